//! Mining worker unit
//!
//! A worker owns one nonce sub-range per epoch and runs the hash loop:
//! advance the nonce, patch it into the serialized header, double-SHA256,
//! compare against the target. Control messages are polled at loop
//! boundaries so a stop or template update is observed within one check
//! interval, and progress is reported at a bounded cadence.

use crate::protocol::{Command, Event};
use crate::types::{BlockTemplate, HashRate, NonceRange};
use crate::{crypto, header, Result};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cadence configuration for the hash loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Emit progress at least every this many attempts
    pub progress_every: u64,
    /// ...or whenever this much wall time has passed, whichever first
    pub progress_interval: Duration,
    /// Poll the control channel every this many attempts; bounds
    /// cancellation latency and must not exceed the progress cadence
    pub check_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            progress_every: 200_000,
            progress_interval: Duration::from_secs(2),
            check_interval: 1024,
        }
    }
}

/// Outcome of one `mine_range` invocation.
enum MineOutcome {
    /// Terminal event for the epoch already emitted (Found/Exhausted/Error)
    Finished,
    /// Abandoned after a template update; worker returns to idle
    Abandoned,
    /// Stop received; worker shuts down
    Shutdown,
    /// A Start arrived mid-loop; switch to the new assignment directly
    Next(Box<(BlockTemplate, NonceRange, u64)>),
}

/// A single mining worker driven by coordinator commands.
pub struct WorkerUnit {
    id: usize,
    config: WorkerConfig,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
}

impl WorkerUnit {
    pub fn new(
        id: usize,
        config: WorkerConfig,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            id,
            config,
            commands,
            events,
        }
    }

    /// Spawn the worker onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Idle -> Running -> terminal state machine.
    ///
    /// The worker stays alive across epochs: a terminal state for one epoch
    /// returns it to idle, awaiting the next `Start`. Only `Stop` (or a
    /// closed command channel) ends the task.
    pub async fn run(mut self) {
        let mut epoch = 0u64;
        let mut pending: Option<Box<(BlockTemplate, NonceRange, u64)>> = None;

        loop {
            let assignment = match pending.take() {
                Some(next) => Some(next),
                None => match self.commands.recv().await {
                    Some(Command::Start {
                        template,
                        range,
                        epoch,
                    }) => Some(Box::new((template, range, epoch))),
                    Some(Command::Stop) => {
                        let _ = self.events.send(Event::Stopped {
                            worker_id: self.id,
                            epoch,
                            attempts: 0,
                        });
                        break;
                    }
                    // Informational while idle; the Start that follows a
                    // restart carries the new snapshot.
                    Some(Command::TemplateUpdate { .. }) => None,
                    None => break,
                },
            };

            let Some(assignment) = assignment else {
                continue;
            };
            let (template, range, assigned_epoch) = *assignment;
            epoch = assigned_epoch;
            debug!(worker_id = self.id, epoch, %range, "worker starting range");

            match self.mine_range(&template, range, epoch).await {
                MineOutcome::Finished | MineOutcome::Abandoned => {}
                MineOutcome::Shutdown => break,
                MineOutcome::Next(next) => pending = Some(next),
            }
        }

        debug!(worker_id = self.id, "worker task exiting");
    }

    async fn mine_range(
        &mut self,
        template: &BlockTemplate,
        range: NonceRange,
        epoch: u64,
    ) -> MineOutcome {
        let (mut buf, target) = match Self::prepare_epoch(template, range) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "failed to prepare epoch");
                let _ = self.events.send(Event::Error {
                    worker_id: self.id,
                    epoch,
                    category: e.category().to_string(),
                    message: e.to_string(),
                });
                return MineOutcome::Finished;
            }
        };

        let mut attempts = 0u64;
        let mut attempts_at_report = 0u64;
        let mut last_report = Instant::now();
        let mut nonce = range.start;

        while nonce < range.end {
            header::patch_nonce(&mut buf, nonce as u32);
            let digest = crypto::sha256d(&buf);
            attempts += 1;

            if crypto::meets_target_bytes(&digest, &target) {
                let hash = crypto::block_hash_hex(&digest);
                debug!(worker_id = self.id, epoch, nonce, %hash, "solution found");
                let _ = self.events.send(Event::Found {
                    worker_id: self.id,
                    epoch,
                    nonce: nonce as u32,
                    hash,
                    attempts,
                });
                return MineOutcome::Finished;
            }

            nonce += 1;

            if attempts % self.config.check_interval == 0 {
                match self.poll_control(epoch, attempts) {
                    ControlFlow::Continue => {}
                    ControlFlow::Abandon => return MineOutcome::Abandoned,
                    ControlFlow::Shutdown => return MineOutcome::Shutdown,
                    ControlFlow::Next(next) => return MineOutcome::Next(next),
                }

                let since_report = attempts - attempts_at_report;
                let elapsed = last_report.elapsed();
                if since_report >= self.config.progress_every
                    || elapsed >= self.config.progress_interval
                {
                    let _ = self.events.send(Event::Progress {
                        worker_id: self.id,
                        epoch,
                        current_nonce: nonce,
                        attempts,
                        hash_rate: HashRate::from_attempts(since_report, elapsed.as_secs_f64()),
                    });
                    attempts_at_report = attempts;
                    last_report = Instant::now();
                }

                tokio::task::yield_now().await;
            }
        }

        debug!(worker_id = self.id, epoch, attempts, "range exhausted");
        let _ = self.events.send(Event::Exhausted {
            worker_id: self.id,
            epoch,
            attempts,
        });
        MineOutcome::Finished
    }

    /// Per-epoch setup: merkle root, target bytes and the 80-byte buffer.
    /// Only the nonce bytes change per attempt after this point.
    fn prepare_epoch(
        template: &BlockTemplate,
        range: NonceRange,
    ) -> Result<([u8; header::HEADER_SIZE], [u8; 32])> {
        let merkle_root = header::compute_merkle_root(&template.transactions)?;
        let block_header = header::build_header(template, &merkle_root, range.start as u32);
        let buf = header::serialize(&block_header)?;
        let target = crypto::decode_target(&template.target_hex()?)?;
        Ok((buf, target))
    }

    fn poll_control(&mut self, epoch: u64, attempts: u64) -> ControlFlow {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) => {
                    let _ = self.events.send(Event::Stopped {
                        worker_id: self.id,
                        epoch,
                        attempts,
                    });
                    return ControlFlow::Shutdown;
                }
                Ok(Command::TemplateUpdate { should_restart, .. }) => {
                    if should_restart {
                        let _ = self.events.send(Event::Stopped {
                            worker_id: self.id,
                            epoch,
                            attempts,
                        });
                        return ControlFlow::Abandon;
                    }
                }
                Ok(Command::Start {
                    template,
                    range,
                    epoch: next_epoch,
                }) => {
                    let _ = self.events.send(Event::Stopped {
                        worker_id: self.id,
                        epoch,
                        attempts,
                    });
                    return ControlFlow::Next(Box::new((template, range, next_epoch)));
                }
                Err(mpsc::error::TryRecvError::Empty) => return ControlFlow::Continue,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = self.events.send(Event::Stopped {
                        worker_id: self.id,
                        epoch,
                        attempts,
                    });
                    return ControlFlow::Shutdown;
                }
            }
        }
    }
}

enum ControlFlow {
    Continue,
    Abandon,
    Shutdown,
    Next(Box<(BlockTemplate, NonceRange, u64)>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

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

    fn spawn_worker(id: usize) -> (
        mpsc::Sender<Command>,
        mpsc::UnboundedReceiver<Event>,
        JoinHandle<()>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = WorkerConfig {
            check_interval: 16,
            ..WorkerConfig::default()
        };
        let handle = WorkerUnit::new(id, config, cmd_rx, event_tx).spawn();
        (cmd_tx, event_rx, handle)
    }

    async fn next_terminal(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if event.is_terminal() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_worker_finds_known_nonce() {
        let (cmd_tx, mut events, handle) = spawn_worker(0);
        cmd_tx
            .send(Command::Start {
                template: fixture_template(EASY_TARGET),
                range: NonceRange::new(0, 1000).unwrap(),
                epoch: 1,
            })
            .await
            .unwrap();

        // Nonce 2 is the first in [0, 1000) whose header hash is below the
        // easy target; value confirmed against an independent double-SHA256.
        match next_terminal(&mut events).await {
            Event::Found {
                worker_id,
                epoch,
                nonce,
                hash,
                attempts,
            } => {
                assert_eq!(worker_id, 0);
                assert_eq!(epoch, 1);
                assert_eq!(nonce, 2);
                assert_eq!(
                    hash,
                    "7bb58f5ab449723bf304aa3041784853f354fd863d15cb10e65d0dc7aff351b8"
                );
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Found, got {:?}", other),
        }

        cmd_tx.send(Command::Stop).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_exhausts_range_without_match() {
        let (cmd_tx, mut events, handle) = spawn_worker(1);
        cmd_tx
            .send(Command::Start {
                template: fixture_template(IMPOSSIBLE_TARGET),
                range: NonceRange::new(0, 100).unwrap(),
                epoch: 1,
            })
            .await
            .unwrap();

        match next_terminal(&mut events).await {
            Event::Exhausted { attempts, .. } => assert_eq!(attempts, 100),
            other => panic!("expected Exhausted, got {:?}", other),
        }

        drop(cmd_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_promptly_on_stop() {
        let (cmd_tx, mut events, handle) = spawn_worker(2);
        cmd_tx
            .send(Command::Start {
                template: fixture_template(IMPOSSIBLE_TARGET),
                range: NonceRange::new(0, crate::types::NONCE_DOMAIN_END).unwrap(),
                epoch: 1,
            })
            .await
            .unwrap();
        cmd_tx.send(Command::Stop).await.unwrap();

        match next_terminal(&mut events).await {
            Event::Stopped { worker_id, .. } => assert_eq!(worker_id, 2),
            other => panic!("expected Stopped, got {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_restarts_under_new_template() {
        let (cmd_tx, mut events, handle) = spawn_worker(3);
        cmd_tx
            .send(Command::Start {
                template: fixture_template(IMPOSSIBLE_TARGET),
                range: NonceRange::new(0, crate::types::NONCE_DOMAIN_END).unwrap(),
                epoch: 1,
            })
            .await
            .unwrap();

        let easy = fixture_template(EASY_TARGET);
        cmd_tx
            .send(Command::TemplateUpdate {
                template: easy.clone(),
                epoch: 2,
                should_restart: true,
            })
            .await
            .unwrap();

        match next_terminal(&mut events).await {
            Event::Stopped { epoch, .. } => assert_eq!(epoch, 1),
            other => panic!("expected Stopped, got {:?}", other),
        }

        cmd_tx
            .send(Command::Start {
                template: easy,
                range: NonceRange::new(0, 1000).unwrap(),
                epoch: 2,
            })
            .await
            .unwrap();

        match next_terminal(&mut events).await {
            Event::Found { epoch, nonce, .. } => {
                assert_eq!(epoch, 2);
                assert_eq!(nonce, 2);
            }
            other => panic!("expected Found, got {:?}", other),
        }

        cmd_tx.send(Command::Stop).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reports_encoding_fault() {
        let (cmd_tx, mut events, handle) = spawn_worker(4);
        let mut template = fixture_template(EASY_TARGET);
        template.previous_block_hash = "not-hex".to_string();

        cmd_tx
            .send(Command::Start {
                template,
                range: NonceRange::new(0, 1000).unwrap(),
                epoch: 1,
            })
            .await
            .unwrap();

        match next_terminal(&mut events).await {
            Event::Error {
                category, message, ..
            } => {
                assert_eq!(category, "encoding");
                assert!(message.contains("previous block hash"));
            }
            other => panic!("expected Error, got {:?}", other),
        }

        cmd_tx.send(Command::Stop).await.unwrap();
        handle.await.unwrap();
    }
}
