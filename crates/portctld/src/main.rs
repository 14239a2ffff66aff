//! portctld entry point.
//!
//! Loads configuration, inventory, access policy and a bulk request file,
//! then either prints the dry-run plan or runs the batch to completion
//! against the simulated transport and reports the outcome.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use portctl_driver::SimulatedTransport;
use portctl_types::PortConfig;
use portctld::audit::{init_logging, init_logging_pretty, AuditSink, JsonlAuditSink, MemoryAuditSink};
use portctld::authorizer::StaticPolicyStore;
use portctld::config::EngineConfig;
use portctld::intake::RequestFile;
use portctld::inventory::Inventory;
use portctld::metrics;
use portctld::state::BatchStatus;
use portctld::{BatchView, Engine, PlanDecision};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Port activation engine
#[derive(Parser, Debug)]
#[command(name = "portctld")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (defaults apply when missing)
    #[arg(short = 'c', long, default_value = "/etc/portctl/portctld.yaml")]
    config: PathBuf,

    /// Device inventory
    #[arg(short = 'i', long)]
    inventory: PathBuf,

    /// Fabric context to select from the inventory
    #[arg(long, default_value = "default")]
    context: String,

    /// Role and binding policy
    #[arg(short = 'p', long)]
    policy: PathBuf,

    /// Bulk request file
    #[arg(short = 'r', long)]
    request: PathBuf,

    /// Validate and authorize only, printing the plan
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Append audit records as JSON lines to this file
    #[arg(long)]
    audit_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.log_format {
        LogFormat::Json => init_logging(&args.log_level),
        LogFormat::Pretty => init_logging_pretty(&args.log_level),
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting portctld");

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{:#}", e), "portctld failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = EngineConfig::load_or_default(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let inventory = Inventory::load(&args.inventory, &args.context, &config.breaker)
        .with_context(|| format!("loading inventory {}", args.inventory.display()))?;
    let policy = StaticPolicyStore::from_file(&args.policy)
        .with_context(|| format!("loading policy {}", args.policy.display()))?;
    let request = RequestFile::load(&args.request)
        .and_then(RequestFile::into_request)
        .with_context(|| format!("loading request {}", args.request.display()))?;

    let transport = Arc::new(SimulatedTransport::new());
    for key in inventory.port_keys() {
        transport.seed(key, PortConfig::default());
    }

    let memory = Arc::new(MemoryAuditSink::new());
    let mut builder = Engine::builder(config, inventory, Arc::new(policy), transport)
        .with_audit_sink(memory.clone() as Arc<dyn AuditSink>);
    if let Some(path) = &args.audit_file {
        let sink = JsonlAuditSink::open(path).with_context(|| format!("opening audit file {}", path.display()))?;
        builder = builder.with_audit_sink(Arc::new(sink));
    }
    let engine = builder.start().context("starting engine")?;

    if args.dry_run {
        let rows = engine.plan(&request);
        println!("{:<5} {:<16} {:<14} {:<6} {:<6} {:<8} DECISION", "#", "DEVICE", "PORT", "ADMIN", "VLAN", "MODE");
        for row in &rows {
            println!(
                "{:<5} {:<16} {:<14} {:<6} {:<6} {:<8} {}",
                row.index,
                row.device.to_string(),
                row.port.to_string(),
                row.admin.to_string(),
                row.vlan.map(|v| v.as_u16().to_string()).unwrap_or_else(|| "-".to_string()),
                row.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string()),
                row.decision
            );
        }
        let refused = rows
            .iter()
            .filter(|r| !matches!(r.decision, PlanDecision::Allow { .. }))
            .count();
        engine.shutdown().await;
        return Ok(if refused == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    let receipt = match engine.submit(request).await {
        Ok(receipt) => receipt,
        Err(e) => {
            for rejection in e.rejections() {
                warn!(index = rejection.index, error = %rejection.error, "intent refused");
                println!("refused #{}: {}", rejection.index, rejection.error);
            }
            engine.shutdown().await;
            return Err(e).context("submitting request");
        }
    };
    info!(batch = %receipt.batch, jobs = receipt.jobs.len(), "batch submitted");

    let view = engine.wait(receipt.batch).await.context("waiting for batch")?;
    print_summary(&view);
    println!("{}", metrics::summarize(&memory.records()));
    engine.shutdown().await;

    Ok(match view.status {
        BatchStatus::Completed => ExitCode::SUCCESS,
        BatchStatus::PartialSuccess => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    })
}

fn print_summary(view: &BatchView) {
    println!("batch {} ({}, {}): {:?}", view.id, view.actor, view.policy, view.status);
    for job in view.jobs.iter().filter(|j| j.state.is_failure() || j.last_error.is_some()) {
        let reason = job.last_error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        println!("  {} {} attempts={} {}", job.key, job.state, job.attempts, reason);
    }
}
