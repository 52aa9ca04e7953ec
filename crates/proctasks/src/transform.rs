use async_trait::async_trait;
use proccore::{Context, Task, TaskContext, TaskError, TaskOutcome, Value};
use procruntime::{TaskFactory, TaskMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Parse a JSON string held in the context
pub struct JsonParseTask {
    from: String,
    into: String,
}

impl Default for JsonParseTask {
    fn default() -> Self {
        Self {
            from: "json".to_string(),
            into: "parsed".to_string(),
        }
    }
}

impl JsonParseTask {
    fn parse(&self, ctx: TaskContext) -> Result<Context, TaskError> {
        let input = ctx.require(&self.from)?;
        let text = input.as_str().ok_or_else(|| TaskError::InvalidInputType {
            field: self.from.clone(),
            expected: "string".to_string(),
            actual: input.type_name().to_string(),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| TaskError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        let mut context = ctx.into_context();
        context.insert(self.into.clone(), Value::from(parsed));
        Ok(context)
    }
}

#[async_trait]
impl Task for JsonParseTask {
    fn task_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        self.parse(ctx).into()
    }
}

pub struct JsonParseFactory;

impl TaskFactory for JsonParseFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        Ok(Arc::new(JsonParseTask {
            from: crate::config_str(config, "from")?.unwrap_or_else(|| "json".to_string()),
            into: crate::config_str(config, "into")?.unwrap_or_else(|| "parsed".to_string()),
        }))
    }

    fn task_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Serialize a context value to a JSON string
pub struct JsonStringifyTask {
    from: String,
    into: String,
}

impl Default for JsonStringifyTask {
    fn default() -> Self {
        Self {
            from: "value".to_string(),
            into: "json".to_string(),
        }
    }
}

#[async_trait]
impl Task for JsonStringifyTask {
    fn task_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let json_str = match ctx.require(&self.from) {
            Ok(value) => match serde_json::to_string_pretty(&value.to_json()) {
                Ok(text) => text,
                Err(e) => return TaskOutcome::failed(format!("JSON stringify error: {}", e)),
            },
            Err(e) => return TaskOutcome::Failure(e),
        };

        let mut context = ctx.into_context();
        context.insert(self.into.clone(), json_str);
        TaskOutcome::Success(context)
    }
}

pub struct JsonStringifyFactory;

impl TaskFactory for JsonStringifyFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        Ok(Arc::new(JsonStringifyTask {
            from: crate::config_str(config, "from")?.unwrap_or_else(|| "value".to_string()),
            into: crate::config_str(config, "into")?.unwrap_or_else(|| "json".to_string()),
        }))
    }

    fn task_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Convert a context value to a JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}
