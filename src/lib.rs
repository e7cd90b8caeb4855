//! Bitcoin Mining Client
//!
//! An async proof-of-work search coordinator for Bitcoin supporting:
//! - Block template retrieval over authenticated JSON-RPC with retry and backoff
//! - 80-byte header construction, merkle root computation and double-SHA256
//! - Concurrent workers over a partitioned 32-bit nonce domain
//! - Hot template replacement with epoch-tagged result filtering
//! - Cooperative cancellation and live hash-rate reporting

pub mod client;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod header;
pub mod protocol;
pub mod stats;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "bitcoin-mining-client";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
