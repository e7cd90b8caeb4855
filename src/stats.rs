//! Progress aggregation and hash-rate reporting
//!
//! Accumulates worker progress messages into per-worker and global counters.
//! Elapsed time is passed in explicitly so reporting is exact under a test
//! clock; the coordinator feeds it real wall time.

use crate::types::{HashRate, StatusReport};
use std::collections::HashMap;
use std::time::Duration;

/// Aggregated mining statistics across workers and epochs.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    epoch: u64,
    height: u64,
    /// Cumulative attempts per worker within the current epoch
    current: HashMap<usize, u64>,
    /// Attempts per worker for the immediately preceding epoch; late
    /// terminal acknowledgments still land here
    prior: HashMap<usize, u64>,
    /// Attempts folded in from epochs older than `prior`
    completed: u64,
    /// Last instantaneous rate reported per worker
    rates: HashMap<usize, f64>,
}

impl StatsAggregator {
    pub fn new(epoch: u64, height: u64) -> Self {
        Self {
            epoch,
            height,
            ..Self::default()
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Roll over to a new epoch, folding the oldest tracked attempts.
    pub fn begin_epoch(&mut self, epoch: u64, height: u64) {
        self.completed += self.prior.values().sum::<u64>();
        self.prior = std::mem::take(&mut self.current);
        self.epoch = epoch;
        self.height = height;
        self.rates.clear();
    }

    /// Record a progress report for the current epoch.
    ///
    /// `attempts` is cumulative within the epoch; `rate` is the worker's
    /// instantaneous estimate.
    pub fn record_progress(&mut self, worker_id: usize, attempts: u64, rate: HashRate) {
        self.record_attempts(worker_id, self.epoch, attempts);
        self.rates.insert(worker_id, rate.value());
    }

    /// Record the attempt count carried by a terminal event. Events from the
    /// immediately preceding epoch update its ledger; older ones are dropped.
    pub fn record_attempts(&mut self, worker_id: usize, epoch: u64, attempts: u64) {
        if epoch == self.epoch {
            let entry = self.current.entry(worker_id).or_insert(0);
            *entry = (*entry).max(attempts);
        } else if epoch + 1 == self.epoch {
            let entry = self.prior.entry(worker_id).or_insert(0);
            *entry = (*entry).max(attempts);
        }
    }

    /// Total attempts across all workers and epochs.
    pub fn total_attempts(&self) -> u64 {
        self.completed
            + self.prior.values().sum::<u64>()
            + self.current.values().sum::<u64>()
    }

    /// Sum of the workers' last instantaneous rates.
    pub fn instantaneous_rate(&self) -> HashRate {
        HashRate::new(self.rates.values().sum())
    }

    /// Build a status report for the given elapsed search time.
    pub fn report(&self, elapsed: Duration, active_workers: usize) -> StatusReport {
        let total = self.total_attempts();
        StatusReport {
            epoch: self.epoch,
            height: self.height,
            total_attempts: total,
            hash_rate: HashRate::from_attempts(total, elapsed.as_secs_f64()),
            active_workers,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}
