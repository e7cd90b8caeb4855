//! Mining coordinator
//!
//! Partitions the nonce space across a pool of workers, dispatches work,
//! merges their events and drives epoch transitions when the template is
//! replaced mid-search. The coordinator never returns while a spawned
//! worker is still running.

use crate::protocol::{Command, Event};
use crate::stats::StatsAggregator;
use crate::types::{
    BlockTemplate, HashRate, MiningResult, NonceRange, StatusReport, WorkerStatus,
    NONCE_DOMAIN_END,
};
use crate::worker::{WorkerConfig, WorkerUnit};
use crate::{crypto, Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker_count: usize,
    pub worker: WorkerConfig,
    /// First nonce of the search domain (inclusive)
    pub nonce_start: u64,
    /// End of the search domain (exclusive, at most 2^32)
    pub nonce_end: u64,
    /// Cadence for status reports and liveness checks
    pub status_interval: Duration,
    /// A running worker silent past this bound is treated as failed
    pub liveness_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            worker: WorkerConfig::default(),
            nonce_start: 0,
            nonce_end: NONCE_DOMAIN_END,
            status_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

/// How the search loop ended, before shutdown accounting.
enum Outcome {
    Found { nonce: u32, hash: String },
    Exhausted,
    Cancelled,
    Fault(Error),
}

/// Coordinates a pool of [`WorkerUnit`]s over one mining session.
pub struct Coordinator {
    config: CoordinatorConfig,
    status_tx: Option<mpsc::UnboundedSender<StatusReport>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        if config.worker_count == 0 {
            return Err(Error::config("Worker count must be greater than 0"));
        }
        NonceRange::new(config.nonce_start, config.nonce_end)?;
        Ok(Self {
            config,
            status_tx: None,
        })
    }

    /// Deliver periodic [`StatusReport`]s to an external consumer.
    pub fn with_status_channel(mut self, tx: mpsc::UnboundedSender<StatusReport>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    /// Run a search for a single template with no mid-search replacement.
    pub async fn mine(
        &self,
        template: BlockTemplate,
        cancel: CancellationToken,
    ) -> Result<MiningResult> {
        let (_tx, rx) = mpsc::channel(1);
        self.run(template, rx, cancel).await
    }

    /// Run a search to completion, external cancellation or a worker fault.
    ///
    /// Fresh templates arriving on `updates` replace the current snapshot:
    /// the epoch advances, every worker is restarted on a fresh partition
    /// and results from the superseded epoch are discarded.
    pub async fn run(
        &self,
        template: BlockTemplate,
        mut updates: mpsc::Receiver<BlockTemplate>,
        cancel: CancellationToken,
    ) -> Result<MiningResult> {
        // Surface template encoding problems before spawning anything so the
        // caller can refetch instead of tearing down a worker pool.
        let mut target_hex = template.target_hex()?;

        let worker_count = self.config.worker_count;
        let ranges = NonceRange::partition(
            self.config.nonce_start,
            self.config.nonce_end,
            worker_count,
        )?;
        let started = Instant::now();

        let (event_tx, mut events) = mpsc::unbounded_channel();
        let mut commands = Vec::with_capacity(worker_count);
        let mut handles: Vec<Option<JoinHandle<()>>> = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (cmd_tx, cmd_rx) = mpsc::channel(8);
            let unit = WorkerUnit::new(id, self.config.worker.clone(), cmd_rx, event_tx.clone());
            handles.push(Some(unit.spawn()));
            commands.push(cmd_tx);
        }
        drop(event_tx);

        let mut epoch = 1u64;
        let mut current = template;
        let mut stats = StatsAggregator::new(epoch, current.height);
        let mut statuses: HashMap<usize, WorkerStatus> = HashMap::new();
        let mut last_seen: HashMap<usize, Instant> = HashMap::new();

        info!(
            epoch,
            height = current.height,
            workers = worker_count,
            "starting search"
        );
        self.dispatch_epoch(&commands, &ranges, &current, epoch, &mut statuses, &mut last_seen)
            .await;

        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut updates_open = true;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("search cancelled externally");
                    break Outcome::Cancelled;
                }

                maybe_template = updates.recv(), if updates_open => match maybe_template {
                    None => updates_open = false,
                    Some(next) => {
                        if !current.is_superseded_by(&next) {
                            debug!(height = next.height, "re-polled template unchanged, ignoring");
                            continue;
                        }
                        match next.target_hex() {
                            Ok(t) => target_hex = t,
                            Err(e) => break Outcome::Fault(e),
                        }
                        epoch += 1;
                        info!(epoch, height = next.height, "template superseded, restarting search");
                        current = next;
                        stats.begin_epoch(epoch, current.height);
                        self.broadcast(&commands, Command::TemplateUpdate {
                            template: current.clone(),
                            epoch,
                            should_restart: true,
                        }).await;
                        self.dispatch_epoch(&commands, &ranges, &current, epoch, &mut statuses, &mut last_seen)
                            .await;
                    }
                },

                _ = ticker.tick() => {
                    let active = statuses
                        .values()
                        .filter(|s| **s == WorkerStatus::Running)
                        .count();
                    if let Some(tx) = &self.status_tx {
                        let _ = tx.send(stats.report(started.elapsed(), active));
                    }
                    if let Some(id) = self.find_dead_worker(&statuses, &last_seen) {
                        warn!(worker_id = id, "worker silent past liveness timeout");
                        if let Some(handle) = handles[id].take() {
                            handle.abort();
                        }
                        break Outcome::Fault(Error::worker(id, "liveness timeout exceeded"));
                    }
                }

                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        break Outcome::Fault(Error::invalid_state(
                            "all workers exited before the search finished",
                        ));
                    };
                    let wid = event.worker_id();
                    last_seen.insert(wid, Instant::now());

                    match event {
                        Event::Progress { epoch: e, attempts, hash_rate, .. } => {
                            if e == epoch {
                                stats.record_progress(wid, attempts, hash_rate);
                            }
                        }
                        Event::Found { epoch: e, nonce, hash, attempts, .. } => {
                            stats.record_attempts(wid, e, attempts);
                            if e != epoch {
                                debug!(worker_id = wid, stale_epoch = e, "discarding stale solution");
                                continue;
                            }
                            match crypto::meets_target(&hash, &target_hex) {
                                Ok(true) => {
                                    statuses.insert(wid, WorkerStatus::Found);
                                    info!(worker_id = wid, nonce, %hash, "solution accepted");
                                    break Outcome::Found { nonce, hash };
                                }
                                Ok(false) => break Outcome::Fault(Error::worker(
                                    wid,
                                    "reported hash does not meet the target",
                                )),
                                Err(e) => break Outcome::Fault(e),
                            }
                        }
                        Event::Exhausted { epoch: e, attempts, .. } => {
                            stats.record_attempts(wid, e, attempts);
                            if e != epoch {
                                continue;
                            }
                            statuses.insert(wid, WorkerStatus::Exhausted);
                            if statuses.len() == worker_count
                                && statuses.values().all(|s| s.is_terminal())
                            {
                                info!(epoch, "nonce domain exhausted without a match");
                                break Outcome::Exhausted;
                            }
                        }
                        Event::Stopped { epoch: e, attempts, .. } => {
                            // Abandon acknowledgment during an epoch switch;
                            // the fresh Start re-enters the worker as Running.
                            stats.record_attempts(wid, e, attempts);
                        }
                        Event::Error { epoch: e, category, message, .. } => {
                            stats.record_attempts(wid, e, 0);
                            statuses.insert(wid, WorkerStatus::Error);
                            // Encoding faults keep their classification so the
                            // caller can refetch the template.
                            let fault = if category == "encoding" {
                                Error::encoding(message)
                            } else {
                                Error::worker(wid, message)
                            };
                            break Outcome::Fault(fault);
                        }
                    }
                }
            }
        };

        self.shutdown(commands, handles, &mut events, &mut stats, epoch)
            .await;

        let duration = started.elapsed();
        let attempts = stats.total_attempts();
        let hash_rate = HashRate::from_attempts(attempts, duration.as_secs_f64());

        match outcome {
            Outcome::Found { nonce, hash } => Ok(MiningResult {
                found: true,
                nonce: Some(nonce),
                hash: Some(hash),
                attempts,
                duration_secs: duration.as_secs_f64(),
                hash_rate,
            }),
            Outcome::Exhausted | Outcome::Cancelled => Ok(MiningResult {
                found: false,
                nonce: None,
                hash: None,
                attempts,
                duration_secs: duration.as_secs_f64(),
                hash_rate,
            }),
            Outcome::Fault(e) => Err(e),
        }
    }

    /// Send a `Start` over the partitioned domain to every worker.
    async fn dispatch_epoch(
        &self,
        commands: &[mpsc::Sender<Command>],
        ranges: &[NonceRange],
        template: &BlockTemplate,
        epoch: u64,
        statuses: &mut HashMap<usize, WorkerStatus>,
        last_seen: &mut HashMap<usize, Instant>,
    ) {
        let now = Instant::now();
        for (id, (cmd_tx, range)) in commands.iter().zip(ranges.iter().copied()).enumerate() {
            statuses.insert(id, WorkerStatus::Running);
            last_seen.insert(id, now);
            let sent = cmd_tx
                .send(Command::Start {
                    template: template.clone(),
                    range,
                    epoch,
                })
                .await;
            if sent.is_err() {
                warn!(worker_id = id, "worker unreachable during dispatch");
                statuses.insert(id, WorkerStatus::Error);
            }
        }
    }

    async fn broadcast(&self, commands: &[mpsc::Sender<Command>], command: Command) {
        for (id, cmd_tx) in commands.iter().enumerate() {
            if cmd_tx.send(command.clone()).await.is_err() {
                debug!(worker_id = id, "worker unreachable during broadcast");
            }
        }
    }

    fn find_dead_worker(
        &self,
        statuses: &HashMap<usize, WorkerStatus>,
        last_seen: &HashMap<usize, Instant>,
    ) -> Option<usize> {
        last_seen
            .iter()
            .find(|(id, seen)| {
                statuses.get(id) == Some(&WorkerStatus::Running)
                    && seen.elapsed() > self.config.liveness_timeout
            })
            .map(|(id, _)| *id)
    }

    /// Stop every worker and wait for all of them to reach a terminal state.
    async fn shutdown(
        &self,
        commands: Vec<mpsc::Sender<Command>>,
        handles: Vec<Option<JoinHandle<()>>>,
        events: &mut mpsc::UnboundedReceiver<Event>,
        stats: &mut StatsAggregator,
        epoch: u64,
    ) {
        self.broadcast(&commands, Command::Stop).await;
        drop(commands);

        // Drain remaining events for final attempt accounting. The channel
        // closes once every worker task has exited.
        let deadline = Instant::now() + self.config.liveness_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, events.recv()).await {
                Ok(Some(event)) => {
                    stats.record_attempts(event.worker_id(), event.epoch(), match &event {
                        Event::Progress { attempts, .. }
                        | Event::Found { attempts, .. }
                        | Event::Exhausted { attempts, .. }
                        | Event::Stopped { attempts, .. } => *attempts,
                        Event::Error { .. } => 0,
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(epoch, "timed out draining worker events at shutdown");
                    break;
                }
            }
        }

        for (id, handle) in handles.into_iter().enumerate() {
            let Some(handle) = handle else { continue };
            let abort = handle.abort_handle();
            if timeout(self.config.liveness_timeout, handle).await.is_err() {
                warn!(worker_id = id, "worker failed to exit, aborting task");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header;

    const EASY_TARGET: &str = "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
    const IMPOSSIBLE_TARGET: &str =
        "0000000000000000000000000000000000000000000000000000000000000001";

    fn fixture_template(target: &str) -> BlockTemplate {
        BlockTemplate {
            version: 536870912,
            previous_block_hash: format!("01{}", "00".repeat(31)),
            curtime: 1700000000,
            bits: "1d00ffff".to_string(),
            target: Some(target.to_string()),
            height: 1,
            transactions: vec![],
            coinbase_value: 0,
        }
    }

    fn test_config(worker_count: usize, nonce_end: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            worker_count,
            worker: WorkerConfig {
                check_interval: 16,
                ..WorkerConfig::default()
            },
            nonce_start: 0,
            nonce_end,
            status_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_secs(30),
        }
    }

    /// Recompute the reported solution with an independent serialization and
    /// double hash.
    fn verify_solution(template: &BlockTemplate, nonce: u32, hash: &str, target: &str) {
        let merkle = header::compute_merkle_root(&template.transactions).unwrap();
        let block_header = header::build_header(template, &merkle, nonce);
        let bytes = header::serialize(&block_header).unwrap();
        let digest = crypto::sha256d(&bytes);
        assert_eq!(crypto::block_hash_hex(&digest), hash);
        assert!(crypto::meets_target(hash, target).unwrap());
    }

    #[tokio::test]
    async fn test_single_worker_finds_exact_nonce() {
        let template = fixture_template(EASY_TARGET);
        let coordinator = Coordinator::new(test_config(1, 1000)).unwrap();
        let result = coordinator
            .mine(template.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.found);
        assert_eq!(result.nonce, Some(2));
        assert_eq!(result.attempts, 3);
        verify_solution(
            &template,
            result.nonce.unwrap(),
            result.hash.as_deref().unwrap(),
            EASY_TARGET,
        );
    }

    #[tokio::test]
    async fn test_multi_worker_finds_valid_solution() {
        let template = fixture_template(EASY_TARGET);
        let coordinator = Coordinator::new(test_config(4, 1000)).unwrap();
        let result = coordinator
            .mine(template.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.found);
        let nonce = result.nonce.unwrap();
        assert!(u64::from(nonce) < 1000);
        verify_solution(&template, nonce, result.hash.as_deref().unwrap(), EASY_TARGET);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_not_found_with_exact_attempts() {
        let template = fixture_template(IMPOSSIBLE_TARGET);
        let coordinator = Coordinator::new(test_config(4, 1000)).unwrap();
        let result = coordinator
            .mine(template, CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.found);
        assert_eq!(result.nonce, None);
        assert_eq!(result.hash, None);
        assert_eq!(result.attempts, 1000);
    }

    #[tokio::test]
    async fn test_cancellation_stops_all_workers() {
        let template = fixture_template(IMPOSSIBLE_TARGET);
        let coordinator = Coordinator::new(test_config(4, NONCE_DOMAIN_END)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        // `run` only returns once every worker reached a terminal state, so
        // completion itself is the no-leaked-workers assertion.
        let result = coordinator.mine(template, cancel).await.unwrap();
        assert!(!result.found);
        assert!(result.attempts > 0);
    }

    #[tokio::test]
    async fn test_template_update_restarts_search() {
        let hard = fixture_template(IMPOSSIBLE_TARGET);
        let mut easy = fixture_template(EASY_TARGET);
        easy.height = 2;

        let coordinator = Coordinator::new(test_config(2, NONCE_DOMAIN_END)).unwrap();
        let (update_tx, update_rx) = mpsc::channel(4);

        let easy_clone = easy.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            update_tx.send(easy_clone).await.unwrap();
        });

        let result = coordinator
            .run(hard, update_rx, CancellationToken::new())
            .await
            .unwrap();

        assert!(result.found);
        verify_solution(
            &easy,
            result.nonce.unwrap(),
            result.hash.as_deref().unwrap(),
            EASY_TARGET,
        );
    }

    #[tokio::test]
    async fn test_unchanged_template_is_ignored() {
        let template = fixture_template(EASY_TARGET);
        let coordinator = Coordinator::new(test_config(1, 1000)).unwrap();
        let (update_tx, update_rx) = mpsc::channel(4);

        // Same snapshot re-polled; must not trigger a same-epoch re-scan.
        update_tx.try_send(template.clone()).unwrap();

        let result = coordinator
            .run(template, update_rx, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.found);
        assert_eq!(result.nonce, Some(2));
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_status_reports_are_delivered() {
        let template = fixture_template(IMPOSSIBLE_TARGET);
        let coordinator = Coordinator::new(test_config(2, NONCE_DOMAIN_END)).unwrap();
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let coordinator = coordinator.with_status_channel(status_tx);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        coordinator.mine(template, cancel).await.unwrap();

        let report = status_rx.recv().await.expect("expected a status report");
        assert_eq!(report.epoch, 1);
        assert_eq!(report.height, 1);
    }

    #[tokio::test]
    async fn test_worker_encoding_fault_keeps_its_category() {
        // Target parses fine, so the fault only shows up inside the worker
        // when the header fails to serialize.
        let mut template = fixture_template(EASY_TARGET);
        template.previous_block_hash = "zz".repeat(32);
        let coordinator = Coordinator::new(test_config(1, 1000)).unwrap();
        let err = coordinator
            .mine(template, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[tokio::test]
    async fn test_encoding_fault_surfaces_before_spawning() {
        let mut template = fixture_template(EASY_TARGET);
        template.target = Some("xyz".to_string());
        let coordinator = Coordinator::new(test_config(1, 1000)).unwrap();
        let err = coordinator
            .mine(template, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[tokio::test]
    async fn test_silent_worker_trips_liveness_timeout() {
        // Progress cadences set beyond the test horizon: the worker hashes
        // but never reports, so the only signal is its silence.
        let config = CoordinatorConfig {
            worker_count: 1,
            worker: WorkerConfig {
                progress_every: u64::MAX,
                progress_interval: Duration::from_secs(3600),
                check_interval: 1024,
            },
            nonce_start: 0,
            nonce_end: NONCE_DOMAIN_END,
            status_interval: Duration::from_millis(50),
            liveness_timeout: Duration::from_millis(200),
        };
        let coordinator = Coordinator::new(config).unwrap();
        let template = fixture_template(IMPOSSIBLE_TARGET);

        let err = coordinator
            .mine(template, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "worker");
        assert!(err.to_string().contains("liveness"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = CoordinatorConfig {
            worker_count: 0,
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::new(config).is_err());
    }
}
