//! Coordinator/worker message protocol
//!
//! Both directions are explicit tagged enums, exhaustively matched at each
//! end and serde-serializable so workers can run across process boundaries.
//! Every message carries the epoch it belongs to; results from a stale epoch
//! are discarded by the coordinator.

use crate::types::{BlockTemplate, HashRate, NonceRange};
use serde::{Deserialize, Serialize};

/// Commands sent by the coordinator to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Begin hashing a fresh range under the given template snapshot.
    Start {
        template: BlockTemplate,
        range: NonceRange,
        epoch: u64,
    },
    /// Halt permanently; the worker acknowledges with a terminal event.
    Stop,
    /// The template changed. With `should_restart` set the worker abandons
    /// its current range immediately; a fresh `Start` follows. Without it
    /// the update is informational and the current epoch runs on.
    TemplateUpdate {
        template: BlockTemplate,
        epoch: u64,
        should_restart: bool,
    },
}

/// Events emitted by a worker back to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Periodic progress at a bounded cadence; `hash_rate` is the
    /// instantaneous estimate since the previous report.
    Progress {
        worker_id: usize,
        epoch: u64,
        current_nonce: u64,
        attempts: u64,
        hash_rate: HashRate,
    },
    /// A header hash below the target was found.
    Found {
        worker_id: usize,
        epoch: u64,
        nonce: u32,
        /// Display-form block hash
        hash: String,
        attempts: u64,
    },
    /// The assigned range was scanned without a match.
    Exhausted {
        worker_id: usize,
        epoch: u64,
        attempts: u64,
    },
    /// Terminal acknowledgment of a `Stop` or template abandon.
    Stopped {
        worker_id: usize,
        epoch: u64,
        attempts: u64,
    },
    /// Unexpected fault inside the hash loop. `category` carries the
    /// originating error's classification so the coordinator can surface
    /// encoding faults as such.
    Error {
        worker_id: usize,
        epoch: u64,
        category: String,
        message: String,
    },
}

impl Event {
    pub fn worker_id(&self) -> usize {
        match self {
            Event::Progress { worker_id, .. }
            | Event::Found { worker_id, .. }
            | Event::Exhausted { worker_id, .. }
            | Event::Stopped { worker_id, .. }
            | Event::Error { worker_id, .. } => *worker_id,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Event::Progress { epoch, .. }
            | Event::Found { epoch, .. }
            | Event::Exhausted { epoch, .. }
            | Event::Stopped { epoch, .. }
            | Event::Error { epoch, .. } => *epoch,
        }
    }

    /// Whether this event ends the worker's participation in its epoch.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Progress { .. })
    }
}
