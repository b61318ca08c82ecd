mod output;
mod pipeline;
mod plan;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor_core::{CancelToken, RunReport};
use events::EventBus;
use orchestrator::{Step, StepContext};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::plan::Plan;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run staged REST configuration plans", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every stage of a plan and print the report
    Run {
        plan: PathBuf,

        /// Print the final report as JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// Check a plan without touching the network
    Validate { plan: PathBuf },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run { plan, json } => run(plan, json).await,
        Commands::Validate { plan } => validate(plan),
    }
}

async fn run(path: PathBuf, json: bool) -> Result<ExitCode> {
    let plan = Plan::load(&path)?;
    plan.validate()?;
    let mut root = pipeline::build(&plan)?;

    let bus = EventBus::new();
    let cancel = CancelToken::new();
    let ctx = StepContext::new()
        .with_cancel(cancel.clone())
        .with_event_bus(bus.clone())
        .with_pool(plan.pool());

    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if json {
                        continue;
                    }
                    if let Some(line) = output::progress_line(&envelope) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling remaining work");
            cancel.cancel();
        }
    });

    tracing::info!(plan = %path.display(), stages = plan.stages.len(), "Starting run");
    root.run(&ctx).await;

    drop(ctx);
    drop(bus);
    let _ = printer.await;

    let report = RunReport::from(root.report().clone());
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", output::render_report(&report));
    }

    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn validate(path: PathBuf) -> Result<ExitCode> {
    let plan = Plan::load(&path)?;
    plan.validate()?;

    let calls: usize = plan.stages.iter().map(|s| s.calls.len()).sum();
    println!(
        "{}: {} stages, {} calls, {} clusters",
        path.display(),
        plan.stages.len(),
        calls,
        plan.clusters.len()
    );
    for var in plan.missing_secrets() {
        println!("warning: {} is not set", var);
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conductor=info,orchestrator=info,transport=info".into());

    let (plain, structured) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .init();
}
