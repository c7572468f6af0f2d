//! ToolRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow against a tool manifest
//! toolrunner workflow.yaml --tools tools.yaml
//!
//! # Validate and print the execution order only
//! toolrunner workflow.yaml --tools tools.yaml --dry-run
//!
//! # Supply declared inputs and a policy file
//! toolrunner workflow.yaml --tools tools.yaml --input query='"rust"' --config toolrunner.yaml
//!
//! # Limit in-flight steps
//! toolrunner workflow.yaml --tools tools.yaml --parallel 4
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};
use serde_json::{Map, Value};

use toolrunner::authorization::PolicyGate;
use toolrunner::events::{Event, EventBus, EventFilter, EventKind, Subscription};
use toolrunner::execution::{CommandInvoker, Engine, Session, SessionStatus};
use toolrunner::monitoring::ExecutionTimeline;
use toolrunner::workflow::{load_workflow, InMemoryRegistry, WorkflowOrchestrator};
use toolrunner::{Config, EngineError, APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Default tool manifest used when none is specified.
const DEFAULT_MANIFEST: &str = "tools.yaml";

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct Options {
    workflow_path: String,
    manifest_path: String,
    config_path: Option<String>,
    inputs: Map<String, Value>,
    max_parallel: Option<usize>,
    dry_run: bool,
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            manifest_path: DEFAULT_MANIFEST.to_string(),
            config_path: None,
            inputs: Map::new(),
            max_parallel: None,
            dry_run: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Tool Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: toolrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --tools PATH        Tool manifest (default: {})", DEFAULT_MANIFEST);
    println!("  --config PATH       Engine, bus and policy configuration");
    println!("  --input KEY=JSON    Value for a declared workflow input (repeatable)");
    println!("  --parallel N        Maximum in-flight steps (default: unbounded)");
    println!("  --dry-run           Validate and print the execution order");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  toolrunner pipeline.yaml --tools tools.yaml");
    println!("  toolrunner pipeline.yaml --tools tools.yaml --dry-run");
    println!("  toolrunner pipeline.yaml --input query='\"rust\"' --parallel 2");
}

/// Parses `KEY=JSON`. Values that are not valid JSON are taken as strings.
fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid input '{}': expected KEY=VALUE", raw))?;
    if key.is_empty() {
        return Err(format!("Invalid input '{}': empty key", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into an Options struct.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    let value_for = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                options.dry_run = true;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--tools" => {
                options.manifest_path = value_for(&mut i, "--tools")?;
            }
            "--config" => {
                options.config_path = Some(value_for(&mut i, "--config")?);
            }
            "--input" => {
                let (key, value) = parse_input(&value_for(&mut i, "--input")?)?;
                options.inputs.insert(key, value);
            }
            "--parallel" => {
                let raw = value_for(&mut i, "--parallel")?;
                let limit = raw
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", raw))?;
                options.max_parallel = Some(limit);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => options.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Prints one event as a progress line.
fn print_event(event: &Event) {
    let step = event.step_id.as_deref().unwrap_or("");
    let line = match event.kind {
        EventKind::StepStarted => format!(
            "  {} {} (attempt {})",
            "▶".blue(),
            step,
            event.payload["attempt"]
        ),
        EventKind::StepRetrying => format!(
            "  {} {} retrying in {} ms: {}",
            "↻".yellow(),
            step,
            event.payload["delay_ms"],
            event.payload["error"]["detail"].as_str().unwrap_or("")
        ),
        EventKind::StepCompleted => format!("  {} {}", "✓".green(), step),
        EventKind::StepFailed => format!(
            "  {} {}: {}",
            "✗".red(),
            step,
            event.payload["error"]["detail"].as_str().unwrap_or("")
        ),
        EventKind::WorkflowCompleted => format!("{}", "Workflow completed".green().bold()),
        EventKind::WorkflowFailed => format!("{}", "Workflow failed".red().bold()),
        EventKind::WorkflowCancelled => format!("{}", "Workflow cancelled".yellow().bold()),
        EventKind::BusOverflow => format!("{}", "Event subscriber fell behind".yellow()),
        EventKind::WorkflowPlanned | EventKind::WorkflowStarted => return,
    };
    println!("{}", line);
}

/// Passes the session's events to `on_event` until the session settles.
///
/// Ends on the session result rather than on a terminal event, so a
/// subscriber that overflowed and lost the terminal event still returns.
async fn follow_session(
    engine: &Engine,
    progress: &mut Subscription,
    session_id: &str,
    mut on_event: impl FnMut(&Event),
) -> Result<Session, EngineError> {
    let mut relay = |event: Event| {
        if event.session_id.as_deref().map_or(true, |id| id == session_id) {
            on_event(&event);
        }
    };

    let finished = engine.wait(session_id);
    tokio::pin!(finished);

    loop {
        tokio::select! {
            biased;
            event = progress.recv() => match event {
                Some(event) => relay(event),
                None => break,
            },
            session = &mut finished => {
                while let Some(event) = progress.try_recv() {
                    relay(event);
                }
                return session;
            }
        }
    }
    finished.await
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let mut config = match &options.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(limit) = options.max_parallel {
        config.engine.max_concurrency = Some(limit);
    }

    let registry = InMemoryRegistry::load(&options.manifest_path)?;

    info!("Loading workflow: {}", options.workflow_path);
    let workflow = load_workflow(&options.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;

    let bus = Arc::new(EventBus::new(
        config.bus.history_capacity,
        config.bus.subscriber_buffer,
    ));
    let engine = Engine::builder(Arc::new(CommandInvoker::new()))
        .config(config.engine.clone())
        .gate(Arc::new(PolicyGate::from_config(&config.policy)))
        .bus(bus.clone())
        .build();
    let orchestrator = WorkflowOrchestrator::new(Arc::new(registry), engine);

    if options.dry_run {
        let graph = orchestrator.validate(&workflow)?;
        info!("Mode: DRY RUN (no tools will be invoked)");
        println!();
        println!("Execution order:");
        for (index, id) in graph.topological_order().iter().enumerate() {
            let deps = graph.dependencies(id);
            let after = if deps.is_empty() {
                String::new()
            } else {
                format!(" (after {})", deps.join(", "))
            };
            let action = graph.get(id).map(|s| s.qualified_action()).unwrap_or_default();
            println!("  {:>3}. {} -> {}{}", index + 1, id, action, after);
        }
        return Ok(true);
    }

    let mut progress = bus.subscribe(None);
    let session_id = orchestrator.submit(&workflow, Some(options.inputs))?;
    info!("Session: {}", session_id);

    let session = follow_session(orchestrator.engine(), &mut progress, &session_id, print_event).await?;
    let events = bus.history(Some(&EventFilter::new().session(session_id.as_str())));
    print!("{}", ExecutionTimeline::from_events(&events).gantt_chart());

    if let Some(err) = &session.error {
        error!("Step '{}' failed ({}): {}", err.step_id, err.kind, err.detail);
    }
    Ok(session.status == SessionStatus::Completed)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use toolrunner::execution::{StepFailure, ToolInvoker};
    use toolrunner::workflow::{CapabilityRef, ParamSchema};
    use toolrunner::{Step, Workflow};

    struct Echo;

    #[async_trait]
    impl ToolInvoker for Echo {
        async fn invoke(
            &self,
            _capability: &CapabilityRef,
            params: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<Value, StepFailure> {
            Ok(Value::Object(params.clone()))
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("toolrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let options = parse_arguments(&args(&[])).unwrap();
        assert_eq!(options.workflow_path, DEFAULT_WORKFLOW);
        assert_eq!(options.manifest_path, DEFAULT_MANIFEST);
        assert!(options.max_parallel.is_none());
        assert!(!options.dry_run);
    }

    #[test]
    fn test_parse_full() {
        let options = parse_arguments(&args(&[
            "flow.yaml",
            "--tools",
            "t.yaml",
            "--parallel",
            "3",
            "--input",
            "n=5",
            "--input",
            "q=rust",
            "--dry-run",
        ]))
        .unwrap();

        assert_eq!(options.workflow_path, "flow.yaml");
        assert_eq!(options.manifest_path, "t.yaml");
        assert_eq!(options.max_parallel, Some(3));
        assert_eq!(options.inputs["n"], json!(5));
        assert_eq!(options.inputs["q"], json!("rust"));
        assert!(options.dry_run);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--parallel"])).is_err());
        assert!(parse_arguments(&args(&["--parallel", "many"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["--input", "novalue"])).is_err());
    }

    #[tokio::test]
    async fn test_follow_session_ends_after_missed_terminal_event() {
        let bus = Arc::new(EventBus::new(1000, 2));
        let engine = Engine::builder(Arc::new(Echo)).bus(bus.clone()).build();
        let mut registry = InMemoryRegistry::new();
        registry.register("t", "run", ParamSchema::default());
        let orchestrator = WorkflowOrchestrator::new(Arc::new(registry), engine);

        let steps = (0..10).map(|i| Step::new(format!("s{i}"), "t", "run")).collect();
        let mut progress = bus.subscribe(None);
        let session_id = orchestrator.submit(&Workflow::from_steps(steps), None).unwrap();
        orchestrator.engine().wait(&session_id).await.unwrap();

        let mut seen = Vec::new();
        let followed = tokio::time::timeout(
            Duration::from_secs(5),
            follow_session(orchestrator.engine(), &mut progress, &session_id, |e| {
                seen.push(e.kind)
            }),
        )
        .await
        .expect("follow_session should return once the session settles")
        .unwrap();

        assert_eq!(followed.status, SessionStatus::Completed);
        assert!(!seen.iter().any(|kind| kind.is_terminal()));
        assert!(bus.dropped(progress.id()).unwrap_or(0) > 0);
    }
}
