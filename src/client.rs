//! Bitcoin node RPC client
//!
//! JSON-RPC over HTTP with Basic authentication, a bounded owned connection
//! pool, per-call timeouts and exponential backoff retry. Authentication
//! failures and node-returned RPC errors are terminal; transport failures
//! and server errors retry up to the configured bound.

use crate::types::BlockTemplate;
use crate::{Error, Result};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Exponential backoff configuration: `delay = base * 2^attempt`, capped.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u64 << attempt.min(16) as u64;
        self.base_delay
            .checked_mul(factor as u32)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// JSON-RPC request envelope.
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: serde_json::Value,
}

/// Error object inside a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
    #[serde(default)]
    #[allow(dead_code)]
    id: serde_json::Value,
}

/// Resilient JSON-RPC client for a Bitcoin node.
///
/// The underlying `reqwest::Client` is the connection pool: bounded per
/// host, idle entries evicted after `pool_idle_timeout`, owned by this value
/// and dropped with it. Independent sessions get independent pools; clones
/// share one pool.
#[derive(Clone, Debug)]
pub struct RpcClient {
    http: Client,
    endpoint: Url,
    user: String,
    password: String,
    call_timeout: Duration,
    backoff: BackoffConfig,
}

impl RpcClient {
    pub fn new(
        endpoint: impl AsRef<str>,
        user: impl Into<String>,
        password: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint.as_ref())
            .map_err(|e| Error::config(format!("Invalid node URL: {}", e)))?;

        // The builder timeout bounds the whole exchange, headers and body
        // both; the explicit race in `send_once` maps it to Error::Timeout.
        let http = ClientBuilder::new()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(call_timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            user: user.into(),
            password: password.into(),
            call_timeout,
            backoff: BackoffConfig::default(),
        })
    }

    /// Set custom backoff configuration
    pub fn with_backoff_config(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Issue a JSON-RPC call, retrying transient failures under backoff.
    #[instrument(skip(self, params))]
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let envelope = RpcRequest {
            jsonrpc: "1.0",
            id: Uuid::new_v4().to_string(),
            method,
            params,
        };

        let mut attempt = 0;
        loop {
            match self.send_once(method, &envelope).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        method,
                        attempt = attempt + 1,
                        max = self.backoff.max_retries,
                        ?delay,
                        error = %e,
                        "RPC call failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/response exchange with the per-call timeout applied.
    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &str,
        envelope: &RpcRequest<'_>,
    ) -> Result<T> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .basic_auth(&self.user, Some(&self.password))
            .json(envelope)
            .send();

        let response = timeout(self.call_timeout, request)
            .await
            .map_err(|_| Error::timeout(method))??;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::auth(format!(
                "node rejected credentials with HTTP {}",
                status
            )));
        }

        let body = response.text().await?;

        // Nodes report RPC-level errors with assorted HTTP statuses; a
        // well-formed error object is terminal regardless of status.
        if let Ok(parsed) = serde_json::from_str::<RpcResponse<T>>(&body) {
            if let Some(error) = parsed.error {
                return Err(Error::rpc_protocol(error.code, error.message));
            }
            if let Some(result) = parsed.result {
                if !status.is_success() {
                    debug!(method, %status, "result carried on non-success status");
                }
                return Ok(result);
            }
        }

        if status.is_server_error() {
            return Err(Error::network(format!("node returned HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(Error::rpc_protocol(
                i64::from(status.as_u16()),
                format!("unexpected HTTP status {}", status),
            ));
        }
        Err(Error::invalid_state(format!(
            "malformed RPC response for {}",
            method
        )))
    }

    /// Fetch a block template with the segwit rule set.
    pub async fn get_block_template(&self) -> Result<BlockTemplate> {
        self.call(
            "getblocktemplate",
            serde_json::json!([{ "rules": ["segwit"] }]),
        )
        .await
    }
}
