// QuectoFlow — Declarative JSON workflow executor in Rust
// License: Apache-2.0

use clap::{Parser, Subcommand};
use quectoflow::config::Config;
use quectoflow::tool::ToolRegistry;
use quectoflow::workflow::loader::{context_from_str, load_context, load_document};
use quectoflow::workflow::{
    Context, FailurePolicy, ProgressEvent, SchemaValidator, WorkflowExecutor,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const LOGO: &str = "🦀";

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "quectoflow",
    about = "QuectoFlow — Declarative JSON workflow executor",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow document
    Run {
        /// Workflow file (.json, .yaml or .yml)
        workflow: PathBuf,
        /// Initial context as inline JSON, or @path to read it from a file
        #[arg(short = 'x', long)]
        context: Option<String>,
        /// JSON Schema to validate against instead of the built-in one
        #[arg(short, long)]
        schema: Option<String>,
        /// Config file path
        #[arg(short, long)]
        config: Option<String>,
        /// Emit NDJSON progress events on stdout
        #[arg(long)]
        stream: bool,
        /// Abort on the first failed step
        #[arg(long)]
        fail_fast: bool,
    },
    /// Check a workflow document against the schema
    Validate {
        /// Workflow file (.json, .yaml or .yml)
        workflow: PathBuf,
        /// JSON Schema to validate against instead of the built-in one
        #[arg(short, long)]
        schema: Option<String>,
    },
    /// Show version information
    Version,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    quectoflow::logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            workflow,
            context,
            schema,
            config,
            stream,
            fail_fast,
        } => run_cmd(&workflow, context.as_deref(), schema, config.as_deref(), stream, fail_fast).await,
        Commands::Validate { workflow, schema } => validate_cmd(&workflow, schema.as_deref()),
        Commands::Version => {
            version_cmd();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} Error: {:#}", LOGO, e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_cmd(
    workflow_path: &Path,
    context_arg: Option<&str>,
    schema: Option<String>,
    config_path: Option<&str>,
    stream: bool,
    fail_fast: bool,
) -> anyhow::Result<()> {
    let mut cfg = load_config(config_path);
    if schema.is_some() {
        cfg.executor.schema_path = schema;
    }
    if fail_fast {
        cfg.executor.failure_policy = FailurePolicy::FailFast;
    }
    cfg.validate()?;

    let doc = load_document(workflow_path)?;
    let initial = match context_arg {
        Some(raw) => match raw.strip_prefix('@') {
            Some(path) => load_context(Path::new(path))?,
            None => context_from_str(raw)?,
        },
        None => Context::new(),
    };

    let executor = WorkflowExecutor::from_config(&cfg, ToolRegistry::new())?;

    tracing::info!(
        workflow = %workflow_path.display(),
        inputs = initial.len(),
        "QuectoFlow run starting"
    );

    let report = if stream {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event.to_ndjson() {
                    Ok(line) => {
                        let _ = stdout.write_all(line.as_bytes());
                        let _ = stdout.flush();
                    }
                    Err(e) => tracing::warn!("Failed to encode progress event: {}", e),
                }
            }
        });
        let report = executor.run_streaming(&doc, initial, tx).await;
        let _ = printer.await;
        report?
    } else {
        executor.run(&doc, initial).await?
    };

    if stream {
        let line = serde_json::json!({
            "event": "outputs",
            "run_id": report.run_id,
            "outputs": report.outputs(),
        });
        println!("{}", line);
    } else {
        println!("{}", serde_json::to_string_pretty(&report.outputs())?);
        for failure in &report.failures {
            eprintln!("{} {} ({}): {}", LOGO, failure.path, failure.kind, failure.error);
        }
    }
    Ok(())
}

fn validate_cmd(workflow_path: &Path, schema: Option<&str>) -> anyhow::Result<()> {
    let doc = load_document(workflow_path)?;
    let validator = match schema {
        Some(path) => SchemaValidator::from_path(Path::new(path))?,
        None => SchemaValidator::bundled()?,
    };
    validator.validate(&doc)?;
    quectoflow::workflow::Workflow::from_document(&doc)?;
    println!("{} {} is valid", LOGO, workflow_path.display());
    Ok(())
}

fn version_cmd() {
    println!("{} QuectoFlow v{}", LOGO, quectoflow::VERSION);
    println!("  Built with Rust 🦀");
    println!("  Declarative JSON workflow executor");
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: Option<&str>) -> Config {
    let config_path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        Config::default_path().unwrap_or_else(|_| PathBuf::from("config.json"))
    };

    Config::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    })
}
