//! # Autoloom CLI
//!
//! Usage:
//!   autoloom parse "every day at 9 AM create 5 twitter accounts"
//!   autoloom plan "navigate to example.com then scrape data from example.com"
//!   autoloom run --intent "every 10 minutes health check"
//!   autoloom cron "*/15 9-17 * * 1-5" --count 5

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use autoloom_core::config::AutoloomConfig;
use autoloom_core::traits::FnCapability;
use autoloom_orchestrator::{IntentParser, Orchestrator};
use autoloom_scheduler::CronSchedule;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Task types the intent parser emits. Real implementations live outside
/// Autoloom; `run` and `plan` stand in with logging capabilities.
const INTENT_TASK_TYPES: &[&str] = &[
    "account_create",
    "browser_navigate",
    "data_scrape",
    "health_check",
    "cleanup",
];

#[derive(Parser)]
#[command(
    name = "autoloom",
    version,
    about = "🧵 Autoloom: plain-text intents to scheduled, supervised jobs"
)]
struct Cli {
    /// Config file (default ~/.autoloom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an intent and print the task specs as JSON
    Parse {
        text: String,
    },
    /// Parse and resolve an intent, print the execution plan
    Plan {
        text: String,
    },
    /// Run the scheduler and supervisor until Ctrl-C
    Run {
        /// Orchestrate this intent after startup
        #[arg(long)]
        intent: Option<String>,

        /// Workflow name for --intent
        #[arg(long, default_value = "cli")]
        name: String,
    },
    /// Print upcoming fire times of a cron expression (UTC)
    Cron {
        expression: String,

        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

fn load_config(path: Option<&str>) -> Result<AutoloomConfig> {
    let config = match path {
        Some(p) => {
            let expanded = shellexpand::tilde(p).to_string();
            AutoloomConfig::load_from(Path::new(&expanded))?
        }
        None => AutoloomConfig::load()?,
    };
    Ok(config)
}

fn register_dry_run_capabilities(orchestrator: &Orchestrator) -> Result<()> {
    for task_type in INTENT_TASK_TYPES {
        let name = task_type.to_string();
        let capability = FnCapability::new(move |params| {
            let name = name.clone();
            async move {
                tracing::info!("🧪 {name} (dry run) params={}", serde_json::Value::Object(params.clone()));
                Ok(serde_json::json!({"task_type": name, "dry_run": true, "parameters": params}))
            }
        })
        .with_description("Logs the request instead of doing the work");
        orchestrator.register_task(task_type, Arc::new(capability))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "autoloom=debug,autoloom_core=debug,autoloom_scheduler=debug,autoloom_supervisor=debug,autoloom_orchestrator=debug"
    } else {
        "autoloom=info,autoloom_core=info,autoloom_scheduler=info,autoloom_supervisor=info,autoloom_orchestrator=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Parse { text } => {
            let parser = IntentParser::from_config(&config.intent)?;
            let tasks = parser.parse(&text).await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Commands::Plan { text } => {
            let parser = IntentParser::from_config(&config.intent)?;
            let orchestrator = Orchestrator::with_parts(
                config,
                parser,
                Arc::new(autoloom_core::clock::SystemClock),
                None,
            );
            register_dry_run_capabilities(&orchestrator)?;
            let plan = orchestrator.plan(&text).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Run { intent, name } => {
            let orchestrator = Orchestrator::open(config)?;
            register_dry_run_capabilities(&orchestrator)?;
            orchestrator.start().await?;

            if let Some(text) = intent {
                let workflow = orchestrator.orchestrate(&text, &name).await?;
                println!("✅ Workflow '{}' ({})", workflow.name, workflow.id);
                for task in &workflow.tasks {
                    let trigger = task
                        .trigger
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "once".into());
                    println!("   {} [{}] {}", task.name, task.task_type, trigger);
                }
            }

            println!("🧵 Autoloom running. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            orchestrator.shutdown().await;
        }
        Commands::Cron { expression, count } => {
            let schedule = CronSchedule::parse(&expression)?;
            let now = chrono::Utc::now();
            for at in schedule.upcoming(now, count) {
                println!("{}", at.to_rfc3339());
            }
        }
    }

    Ok(())
}
