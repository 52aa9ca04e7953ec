// crates/proccli/src/main.rs

use anyhow::{anyhow, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use proccore::{
    Condition, Context, DefinitionSpec, ExecutionEvent, InstanceId, InstanceSummary,
    ProcessDefinition, RetryPolicy, StepSpec, TaskEvent,
};
use procruntime::{
    EngineConfig, FileStore, InMemoryDefinitions, ProcessEngine, ResumeResult, TaskRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "procflow")]
#[command(about = "Process Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a process definition file
    Validate {
        /// Path to definition JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Create an instance and drive it until it waits or finishes
    Run {
        #[command(flatten)]
        engine: EngineArgs,

        /// Initial context as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Deliver the result of a waiting step
    Resume {
        #[command(flatten)]
        engine: EngineArgs,

        #[arg(long)]
        instance: InstanceId,

        /// Step the instance is waiting on
        #[arg(long)]
        step: String,

        /// Context to merge, as a JSON object
        #[arg(long, conflicts_with = "fail")]
        output: Option<String>,

        /// Resume with a failure instead
        #[arg(long)]
        fail: Option<String>,
    },

    /// Cancel an instance
    Cancel {
        #[command(flatten)]
        engine: EngineArgs,

        #[arg(long)]
        instance: InstanceId,
    },

    /// Show the status of an instance
    Status {
        #[command(flatten)]
        engine: EngineArgs,

        #[arg(long)]
        instance: InstanceId,
    },

    /// List available task types
    Tasks,

    /// Create a new example definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "process.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Path to definition JSON file
    #[arg(short, long)]
    file: PathBuf,

    /// Directory holding instance records; in-memory when omitted
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Engine configuration JSON file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    let level = if verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Validate { file } => {
            validate_definition(&file)?;
        }

        Commands::Run {
            engine,
            input,
            verbose: _,
        } => {
            run_process(&engine, input).await?;
        }

        Commands::Resume {
            engine,
            instance,
            step,
            output,
            fail,
        } => {
            let result = match fail {
                Some(message) => ResumeResult::Failure(message),
                None => ResumeResult::Success(parse_context(output.as_deref())?),
            };
            let engine = build_engine(engine.require_state_dir()?).await?;
            let summary = engine.resume(instance, &step, result).await?;
            print_summary(&summary);
        }

        Commands::Cancel { engine, instance } => {
            let engine = build_engine(engine.require_state_dir()?).await?;
            let summary = engine.cancel(instance).await?;
            print_summary(&summary);
        }

        Commands::Status { engine, instance } => {
            let engine = build_engine(engine.require_state_dir()?).await?;
            let summary = engine.get_status(instance).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Tasks => {
            list_tasks();
        }

        Commands::Init { output } => {
            create_example_definition(&output)?;
        }
    }

    Ok(())
}

impl EngineArgs {
    fn require_state_dir(&self) -> Result<&EngineArgs> {
        if self.state_dir.is_none() {
            return Err(anyhow!("--state-dir is required to reach an existing instance"));
        }
        Ok(self)
    }
}

fn load_spec(file: &Path) -> Result<DefinitionSpec> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))
}

fn standard_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    proctasks::register_all(&mut registry);
    registry
}

fn parse_context(input: Option<&str>) -> Result<Context> {
    match input {
        None => Ok(Context::new()),
        Some(text) => {
            let json: serde_json::Value = serde_json::from_str(text)?;
            Context::from_json(json).ok_or_else(|| anyhow!("Input must be a JSON object"))
        }
    }
}

async fn build_engine(args: &EngineArgs) -> Result<ProcessEngine> {
    let definitions = Arc::new(InMemoryDefinitions::new());
    definitions.register(load_spec(&args.file)?).await?;

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let mut builder = ProcessEngine::builder()
        .definitions(definitions)
        .registry(standard_registry())
        .config(config);
    if let Some(dir) = &args.state_dir {
        builder = builder.store(Arc::new(FileStore::open(dir).await?));
    }
    Ok(builder.build())
}

async fn run_process(args: &EngineArgs, input: Option<String>) -> Result<()> {
    println!("🚀 Loading process from: {}", args.file.display());
    let spec = load_spec(&args.file)?;
    let process_type = spec.id.clone();
    println!("📋 Process: {}", spec.name.as_deref().unwrap_or(&process_type));
    println!("   Steps: {}", spec.steps.len());
    println!("   Transitions: {}", spec.transitions.len());
    println!();

    let context = parse_context(input.as_deref())?;
    let engine = build_engine(args).await?;

    // Subscribe to events for real-time output
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let id = engine.create_instance(&process_type, context).await?;
    let summary = engine.run_instance(id).await?;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    print_summary(&summary);
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::InstanceCreated { instance_id, .. } => {
            println!("▶️  Instance {} created", instance_id);
        }
        ExecutionEvent::StatusChanged { from, to, .. } => {
            println!("🔁 {} -> {}", from, to);
        }
        ExecutionEvent::StepStarted { step, attempt, .. } => {
            println!("  ⚡ Starting step: {} (attempt {})", step, attempt);
        }
        ExecutionEvent::StepCompleted {
            step, duration_ms, ..
        } => {
            println!("  ✅ Step {} completed in {}ms", step, duration_ms);
        }
        ExecutionEvent::StepFailed {
            step,
            error,
            will_retry,
            ..
        } => {
            let retry = if will_retry { ", retrying" } else { "" };
            println!("  ❌ Step {} failed: {}{}", step, error, retry);
        }
        ExecutionEvent::StepSuspended { step, reason, .. } => {
            println!("  ⏸️  Step {} waiting: {}", step, reason);
        }
        ExecutionEvent::ForkOpened {
            split, branches, ..
        } => {
            println!("  🔀 {} forked into {}", split, branches.join(", "));
        }
        ExecutionEvent::ForkJoined {
            split,
            join,
            duration_ms,
            ..
        } => {
            let join = join.unwrap_or_else(|| "(terminal)".to_string());
            println!("  🔗 {} joined at {} after {}ms", split, join, duration_ms);
        }
        ExecutionEvent::Task { step, event, .. } => match event {
            TaskEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", step, message);
            }
            TaskEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", step, message);
            }
            TaskEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", step, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", step, percent);
                }
            }
        },
    }
}

fn print_summary(summary: &InstanceSummary) {
    println!("📊 Instance Summary:");
    println!("   Instance ID: {}", summary.id);
    println!("   Status: {}", summary.status);
    println!("   Active: {}", summary.active.join(", "));
    if let Some(step) = &summary.waiting_on {
        println!("   Waiting on: {}", step);
    }
    if let Some(error) = &summary.error {
        println!("   Error: {}", error);
    }
    println!("   Ticks: {}", summary.ticks);
    println!("   History entries: {}", summary.history_len);

    if !summary.context.is_empty() {
        println!();
        println!("📤 Context:");
        for (key, value) in summary.context.iter() {
            println!("   {}: {}", key, value.to_json());
        }
    }
}

fn validate_definition(file: &Path) -> Result<()> {
    println!("🔍 Validating process: {}", file.display());

    let spec = load_spec(file)?;
    let definition = ProcessDefinition::from_spec(spec)?;
    standard_registry().bind(&definition)?;

    println!("✅ Process is valid:");
    println!("   Id: {}", definition.id());
    if let Some(name) = definition.name() {
        println!("   Name: {}", name);
    }
    println!("   Steps: {}", definition.len());
    println!("   Transitions: {}", definition.transitions().len());

    Ok(())
}

fn list_tasks() {
    println!("📦 Available Task Types:");
    println!();

    let registry = standard_registry();
    for task_type in registry.list_task_types() {
        if let Some(metadata) = registry.get_metadata(&task_type) {
            println!("  • {} ({})", task_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", task_type);
        }
    }
}

fn create_example_definition(output: &Path) -> Result<()> {
    let mut spec = DefinitionSpec::new("expense_approval", "submit");
    spec.name = Some("Expense Approval".to_string());
    spec.description = Some("Routes large expenses through a manager, then books and notifies in parallel".to_string());

    spec.add_step(
        StepSpec::new("submit")
            .with_name("Submit")
            .with_task("debug.log")
            .with_config("message", "expense submitted"),
    );
    spec.add_step(
        StepSpec::new("approve")
            .with_name("Manager approval")
            .with_task("control.wait")
            .with_config("reason", "manager sign-off"),
    );
    spec.add_step(StepSpec::new("fan_out").with_name("Book and notify").split());
    spec.add_step(
        StepSpec::new("book")
            .with_task("time.delay")
            .with_config("delay_ms", 200)
            .with_retry(RetryPolicy::exponential(3, 100, 2.0, 1000))
            .with_timeout_ms(5000),
    );
    spec.add_step(
        StepSpec::new("notify")
            .with_task("debug.log")
            .with_config("message", "requester notified"),
    );
    spec.add_step(StepSpec::new("joined").join());
    spec.add_step(StepSpec::new("done"));

    spec.connect_when("submit", "approve", Condition::greater_than("amount", 1000.0));
    spec.connect_when(
        "submit",
        "fan_out",
        Condition::negate(Condition::greater_than("amount", 1000.0)),
    );
    spec.connect("approve", "fan_out");
    spec.connect("fan_out", "book");
    spec.connect("fan_out", "notify");
    spec.connect("book", "joined");
    spec.connect("notify", "joined");
    spec.connect("joined", "done");

    // Refuse to write an example that would not load
    ProcessDefinition::from_spec(spec.clone())?;

    let json = serde_json::to_string_pretty(&spec)?;
    std::fs::write(output, json)?;

    println!("✨ Created example process: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  procflow run --file {} --input '{{\"amount\": 250}}'",
        output.display()
    );

    Ok(())
}
