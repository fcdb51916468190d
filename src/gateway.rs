//! External agent gateway RPC client.
//!
//! The gateway executes agent turns; this crate only dispatches wake-up
//! calls to it and never awaits the turn itself. Every call carries an
//! explicit timeout and a fresh idempotency key so retries are safe.

use crate::error::{GatewayError, Result};
use crate::now_ms;
use anyhow::Context as _;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default outbound call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// One wake-up call to the external gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCall {
    pub session_key: String,
    pub message: String,
    /// The gateway should not deliver the agent's reply anywhere; the agent
    /// responds through the channel post operation itself.
    pub deliver: bool,
    pub idempotency_key: String,
    #[serde(skip)]
    pub timeout: Duration,
}

impl AgentCall {
    pub fn new(session_key: String, message: String) -> Self {
        Self {
            session_key,
            message,
            deliver: false,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Seam for the external gateway, so the trigger engine can be exercised
/// against a recording fake in tests.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn agent(&self, call: AgentCall) -> Result<()>;
}

/// HTTP JSON implementation of the gateway RPC.
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    call_log: Option<CallLog>,
}

impl HttpGateway {
    pub fn new(url: String, call_log: Option<CallLog>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            call_log,
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'static str,
    params: &'a AgentCall,
}

#[async_trait::async_trait]
impl Gateway for HttpGateway {
    async fn agent(&self, call: AgentCall) -> Result<()> {
        let started = std::time::Instant::now();
        let timeout_secs = call.timeout.as_secs();

        let outcome: std::result::Result<(), GatewayError> = async {
            let response = self
                .client
                .post(&self.url)
                .timeout(call.timeout)
                .json(&RpcRequest {
                    method: "agent",
                    params: &call,
                })
                .send()
                .await
                .map_err(|error| {
                    if error.is_timeout() {
                        GatewayError::Timeout { timeout_secs }
                    } else {
                        GatewayError::Request(error.to_string())
                    }
                })?;

            if !response.status().is_success() {
                return Err(GatewayError::Request(format!(
                    "gateway returned {}",
                    response.status()
                )));
            }
            Ok(())
        }
        .await;

        if let Some(call_log) = &self.call_log {
            call_log
                .append(CallRecord {
                    ts: now_ms(),
                    session_key: &call.session_key,
                    idempotency_key: &call.idempotency_key,
                    ok: outcome.is_ok(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: outcome.as_ref().err().map(|error| error.to_string()),
                })
                .await;
        }

        outcome.map_err(Into::into)
    }
}

/// Record shape for `logs/llm-calls.jsonl`.
#[derive(Serialize)]
pub struct CallRecord<'a> {
    pub ts: i64,
    pub session_key: &'a str,
    pub idempotency_key: &'a str,
    pub ok: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Append-only JSON-lines log of gateway calls.
#[derive(Debug, Clone)]
pub struct CallLog {
    path: PathBuf,
}

impl CallLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one record. Logging failures are reported, never propagated —
    /// the call log must not take the wake-up path down with it.
    pub async fn append(&self, record: CallRecord<'_>) {
        if let Err(error) = self.try_append(&record).await {
            tracing::warn!(%error, path = %self.path.display(), "failed to append call log");
        }
    }

    async fn try_append(&self, record: &CallRecord<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create call log directory")?;
        }

        let mut line = serde_json::to_string(record).context("failed to serialize call record")?;
        line.push('\n');

        use tokio::io::AsyncWriteExt as _;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("failed to open call log")?;
        file.write_all(line.as_bytes())
            .await
            .context("failed to write call log")?;
        Ok(())
    }

    /// Parse every well-formed record in the log. Garbage lines are skipped.
    pub async fn read_all(&self) -> Vec<ParsedCallRecord> {
        let Ok(raw) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Owned record as read back from the call log.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ParsedCallRecord {
    pub ts: i64,
    pub session_key: String,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_log_round_trips_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = CallLog::new(dir.path().join("logs").join("llm-calls.jsonl"));

        log.append(CallRecord {
            ts: 1_000,
            session_key: "agent:builder:webchat:channel:ch-1",
            idempotency_key: "key-1",
            ok: true,
            duration_ms: 42,
            error: None,
        })
        .await;

        // A torn write must not poison later reads.
        use tokio::io::AsyncWriteExt as _;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .await
            .expect("log file should open");
        file.write_all(b"{half a record\n")
            .await
            .expect("garbage should write");

        log.append(CallRecord {
            ts: 2_000,
            session_key: "agent:scout:webchat:channel:ch-2",
            idempotency_key: "key-2",
            ok: false,
            duration_ms: 7,
            error: Some("gateway returned 503".to_string()),
        })
        .await;

        let records = log.read_all().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_key, "agent:builder:webchat:channel:ch-1");
        assert!(!records[1].ok);
    }
}
