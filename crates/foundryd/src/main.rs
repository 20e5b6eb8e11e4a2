use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use foundry_api::ServiceState;
use foundry_config::{CliOverrides, ServiceConfig};
use foundry_events::EventLog;
use foundry_exec::HttpExecutionAdapter;
use foundry_pool::{CircuitConfig, ExecutorPool};
use foundry_scheduler::Scheduler;
use foundry_source::GitSourceLoader;
use foundry_store::InMemoryStore;

#[derive(Parser, Debug)]
#[command(name = "foundryd", version)]
#[command(about = "Package-build orchestrator: Submission API + Scheduler")]
struct Cli {
    /// Workspace root to look for `.foundry.toml` in.
    #[arg(long, default_value = ".")]
    workspace_root: PathBuf,

    /// Address the Submission API binds to.
    #[arg(long)]
    listen_addr: Option<String>,

    /// Directory for the append-only event log.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Default per-executor capacity when an added executor omits one.
    #[arg(long)]
    default_capacity: Option<u32>,

    /// Consecutive failures before an executor's circuit opens.
    #[arg(long)]
    circuit_failure_threshold: Option<u32>,

    /// How long an open circuit waits before a half-open probe (e.g. 30s).
    #[arg(long)]
    circuit_recovery_timeout: Option<String>,

    /// Maximum rows dispatched concurrently.
    #[arg(long)]
    max_concurrent: Option<u32>,

    /// Per-invocation HTTP timeout to an executor (e.g. 2m).
    #[arg(long)]
    invoke_timeout: Option<String>,

    /// Hard cap on a submission request body, in bytes.
    #[arg(long)]
    max_body_bytes: Option<u64>,
}

fn parse_duration_arg(value: Option<String>, flag: &str) -> Result<Option<Duration>> {
    value
        .map(|v| humantime::parse_duration(&v).with_context(|| format!("invalid --{flag} value: {v}")))
        .transpose()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        listen_addr: cli.listen_addr.clone(),
        state_dir: cli.state_dir.clone(),
        default_capacity: cli.default_capacity,
        circuit_failure_threshold: cli.circuit_failure_threshold,
        circuit_recovery_timeout: parse_duration_arg(
            cli.circuit_recovery_timeout,
            "circuit-recovery-timeout",
        )?,
        max_concurrent: cli.max_concurrent,
        invoke_timeout: parse_duration_arg(cli.invoke_timeout, "invoke-timeout")?,
        max_body_bytes: cli.max_body_bytes,
    };

    let config = ServiceConfig::layered(&cli.workspace_root, overrides)
        .context("failed to resolve service configuration")?;

    run(config)
}

fn run(config: ServiceConfig) -> Result<()> {
    eprintln!("[info] starting foundryd, listening on {}", config.listen_addr);

    let events = Arc::new(EventLog::new(foundry_events::events_path(&config.state_dir)));
    let store: Arc<dyn foundry_store::BuildStore> = Arc::new(InMemoryStore::new());
    let pool = Arc::new(ExecutorPool::new(
        CircuitConfig {
            failure_threshold: config.pool.circuit_failure_threshold,
            recovery_timeout: config.pool.circuit_recovery_timeout,
        },
        config.pool.default_capacity,
    ));
    let adapter: Arc<dyn foundry_exec::ExecutionAdapter> =
        Arc::new(HttpExecutionAdapter::new(config.exec.invoke_timeout).context("failed to build execution adapter")?);

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        adapter,
        Arc::clone(&events),
        config.scheduler.clone(),
    );
    let scheduler_cancel = scheduler.cancel_handle();

    let server = tiny_http::Server::http(config.listen_addr.as_str())
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", config.listen_addr))?;
    let server = Arc::new(server);

    {
        let server = Arc::clone(&server);
        let scheduler_cancel = Arc::clone(&scheduler_cancel);
        ctrlc::set_handler(move || {
            eprintln!("[info] shutdown signal received, draining in-flight work");
            scheduler_cancel.store(true, Ordering::Release);
            server.unblock();
        })
        .context("failed to install signal handler")?;
    }

    let scheduler = Arc::new(scheduler);
    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.run())
    };

    let state = Arc::new(ServiceState {
        store,
        pool,
        source_loader: Arc::new(GitSourceLoader),
        events,
        max_body_bytes: config.api.max_body_bytes,
    });

    foundry_api::serve(&server, state);

    scheduler_handle.join().map_err(|_| anyhow::anyhow!("scheduler thread panicked"))?;
    scheduler.drain();
    eprintln!("[info] foundryd shut down cleanly");
    Ok(())
}
