//! Standard task library
//!
//! Collection of built-in tasks for common process steps

mod context;
mod control;
mod debug;
mod time;
mod transform;

pub use context::SetValuesTask;
pub use control::{FailTask, WaitTask};
pub use debug::LogTask;
pub use time::DelayTask;
pub use transform::{JsonParseTask, JsonStringifyTask};

use proccore::{TaskError, Value};
use procruntime::TaskRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Register all standard tasks with a registry
pub fn register_all(registry: &mut TaskRegistry) {
    registry.register(Arc::new(context::SetValuesFactory));
    registry.register(Arc::new(control::FailFactory));
    registry.register(Arc::new(control::WaitFactory));
    registry.register(Arc::new(debug::LogFactory));
    registry.register(Arc::new(time::DelayFactory));
    registry.register(Arc::new(transform::JsonParseFactory));
    registry.register(Arc::new(transform::JsonStringifyFactory));
}

/// Optional string entry of a step config
pub(crate) fn config_str(
    config: &BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<String>, TaskError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(TaskError::Configuration(format!(
            "'{}' must be a string, got {}",
            key,
            other.type_name()
        ))),
    }
}

/// Optional non-negative integer entry of a step config
pub(crate) fn config_u64(
    config: &BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<u64>, TaskError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0)
            .map(|n| Some(n as u64))
            .ok_or_else(|| {
                TaskError::Configuration(format!(
                    "'{}' must be a non-negative integer, got {}",
                    key,
                    value.type_name()
                ))
            }),
    }
}
