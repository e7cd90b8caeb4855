//! Bitcoin Mining Client - Main Application
//!
//! Fetches block templates from a Bitcoin node and coordinates a pool of
//! concurrent proof-of-work search workers.

use bitcoin_mining_client::{
    client::RpcClient,
    config::Config,
    coordinator::Coordinator,
    utils::{format_duration, format_hash_rate},
    BlockTemplate, Error, MiningResult, Result, APP_NAME, APP_VERSION,
};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load and validate configuration
    let config = Config::load().await?;

    // Initialize tracing
    let level: tracing::Level = config.log_level.into();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: node={}, workers={}, poll_interval={}s",
        config.node,
        config.worker_count(),
        config.poll_interval
    );

    let result = run_session(&config).await?;
    print_result(&result);

    Ok(())
}

/// Bound on template refetches after an encoding fault before giving up.
const MAX_TEMPLATE_REFETCHES: usize = 3;

/// One mining session: fetch a template, search it across the worker pool,
/// and keep the template fresh until a solution, exhaustion or Ctrl-C.
///
/// An encoding fault means the node handed out a template the header codec
/// rejects; the session refetches a fresh one (bounded) instead of exiting.
async fn run_session(config: &Config) -> Result<MiningResult> {
    let client = RpcClient::new(
        config.node_url(),
        config.rpc_user.clone().unwrap_or_default(),
        config.rpc_password.clone().unwrap_or_default(),
        config.rpc_timeout_duration(),
    )?
    .with_backoff_config(config.backoff_config());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<bitcoin_mining_client::StatusReport>();
    let status_logger = tokio::spawn(async move {
        while let Some(report) = status_rx.recv().await {
            info!(
                epoch = report.epoch,
                height = report.height,
                attempts = report.total_attempts,
                workers = report.active_workers,
                "rate {} over {}",
                format_hash_rate(report.hash_rate.value()),
                format_duration(report.elapsed_secs as u64)
            );
        }
    });

    let coordinator =
        Coordinator::new(config.coordinator_config())?.with_status_channel(status_tx);

    let mut template = client.get_block_template().await?;
    info!(
        height = template.height,
        bits = %template.bits,
        "fetched initial block template"
    );

    let mut refetches = 0;
    let result = loop {
        let (update_tx, update_rx) = mpsc::channel(4);
        let poller = tokio::spawn(poll_templates(
            client.clone(),
            template.clone(),
            update_tx,
            config.poll_interval_duration(),
            cancel.clone(),
        ));

        let outcome = coordinator
            .run(template.clone(), update_rx, cancel.clone())
            .await;
        poller.abort();

        match outcome {
            Err(e @ Error::Encoding { .. }) => {
                if refetches >= MAX_TEMPLATE_REFETCHES {
                    break Err(e);
                }
                refetches += 1;
                warn!(
                    refetches,
                    "template rejected by header codec ({}), refetching", e
                );
                template = client.get_block_template().await?;
            }
            other => break other,
        }
    };

    cancel.cancel();
    status_logger.abort();

    result
}

/// Re-poll the node and forward templates that supersede the current one.
async fn poll_templates(
    client: RpcClient,
    mut current: BlockTemplate,
    updates: mpsc::Sender<BlockTemplate>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        match client.get_block_template().await {
            Ok(next) => {
                if current.is_superseded_by(&next) {
                    info!(height = next.height, "node published fresh work");
                    current = next.clone();
                    if updates.send(next).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                // The client already exhausted its retry budget; keep the
                // current template and try again next interval.
                warn!("template re-poll failed: {}", e);
            }
            Err(e) => {
                error!("template re-poll failed terminally: {}", e);
                break;
            }
        }
    }
}

/// Cancel the search on Ctrl-C.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping search");
            cancel.cancel();
        }
    });
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}

fn print_result(result: &MiningResult) {
    if result.found {
        println!("Solution found");
        if let (Some(nonce), Some(hash)) = (&result.nonce, &result.hash) {
            println!("  nonce: {:#010x}", nonce);
            println!("  hash:  {}", hash);
        }
    } else {
        println!("No solution found");
    }
    println!("  attempts: {}", result.attempts);
    println!(
        "  rate:     {} over {}",
        format_hash_rate(result.hash_rate.value()),
        format_duration(result.duration_secs as u64)
    );
}
