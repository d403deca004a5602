use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use jp_core::models::ProvisionerConfig;
use jp_core::services::config_loader;
use jp_core::services::provisioner::{JujuProvisioner, Queues};
use jp_core::services::queue::{MemoryQueue, WorkQueue, APP_QUEUE, PROVISIONER_QUEUE};
use jp_core::services::runner::ProcessRunner;
use jp_core::services::unit_store::JsonUnitStore;
use jp_core::ProvisionError;

const USAGE: &str = "usage: jp-agent [--config PATH] [--debug] <collect|run>";

enum Command {
    Collect,
    Run,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Parse CLI args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.iter().any(|a| a == "--debug");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);
    let command = match args.last().map(String::as_str) {
        Some("collect") => Command::Collect,
        Some("run") => Command::Run,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let _guard = if debug {
        Some(setup_debug_logging())
    } else {
        setup_logging();
        None
    };

    let config = match config_path {
        Some(path) => config_loader::load(&path)?,
        None => ProvisionerConfig::default(),
    };

    let app_queue = Arc::new(MemoryQueue::new(APP_QUEUE));
    let provisioner = Arc::new(JujuProvisioner::new(
        config.clone(),
        Arc::new(ProcessRunner),
        Arc::new(JsonUnitStore::new(&config.agent.state_dir)),
        Queues {
            provisioner: Arc::new(MemoryQueue::new(PROVISIONER_QUEUE)),
            app: app_queue.clone(),
        },
        None,
    ));

    match command {
        Command::Collect => {
            let units = provisioner.collect_status().await?;
            println!("{}", serde_json::to_string_pretty(&units)?);
            Ok(())
        }
        Command::Run => run(provisioner, app_queue, &config).await,
    }
}

/// Log to stderr at `info` unless `RUST_LOG` says otherwise.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Configure file-based tracing to `jp-agent-debug.log` in CWD.
/// Returns the guard that must be held alive for the duration of the program.
fn setup_debug_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", "jp-agent-debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_ansi(false)
        .init();

    guard
}

/// Reconciles every `collect-interval` and serves both queues until Ctrl-C.
async fn run(
    provisioner: Arc<JujuProvisioner>,
    app_queue: Arc<MemoryQueue>,
    config: &ProvisionerConfig,
) -> color_eyre::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_timeout = config.agent.queue_poll_timeout();

    let worker = provisioner.balancer_worker();
    let worker_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(poll_timeout, shutdown).await })
    };
    let app_task = tokio::spawn(drain_app_queue(app_queue, poll_timeout, shutdown_rx));

    let mut ticker = tokio::time::interval(config.agent.collect_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match provisioner.collect_status().await {
                    Ok(units) => tracing::info!(units = units.len(), "collected status"),
                    Err(e) => tracing::error!(error = %e, "status collection failed"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("shutting down");
                break;
            }
        }
    }

    shutdown_tx.send(true)?;
    worker_task.await?;
    app_task.await?;
    Ok(())
}

/// The application layer lives outside this process; its messages are
/// logged and acknowledged.
async fn drain_app_queue(
    queue: Arc<MemoryQueue>,
    poll_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = queue.get(poll_timeout) => match result {
                Ok(delivery) => {
                    tracing::info!(
                        action = %delivery.message.action,
                        args = ?delivery.message.args,
                        "application message"
                    );
                    if let Err(e) = queue.delete(delivery).await {
                        tracing::warn!(error = %e, "failed to acknowledge application message");
                    }
                }
                Err(ProvisionError::QueueTimeout(_)) => {}
                Err(e) => tracing::error!(error = %e, "application queue failed"),
            },
            _ = shutdown.changed() => {}
        }
    }
}
