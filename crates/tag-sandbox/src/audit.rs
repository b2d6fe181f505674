//! Audit logging for tag executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the code (never raw code in logs)
//! - A preview of the first 500 chars of code
//! - Bridge calls made (with hashed args, not raw)
//! - Duration and classified outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tag_error::BridgeError;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bridge::BridgeOp;
use crate::{ExecutionResult, HostBridge};

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N characters of the code (for human review).
    pub code_preview: String,
    /// Which backend ran the code.
    pub backend: AuditBackend,
    /// Bridge calls made during execution.
    pub bridge_calls: Vec<BridgeCallAudit>,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
    /// Live workers when this execution acquired one. None outside the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size_at_acquire: Option<usize>,
}

/// The backend an execution ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditBackend {
    /// In-process V8 isolate.
    Isolate,
    /// Out-of-process worker.
    WorkerPool,
    /// Remote execution service.
    Remote,
}

/// Audit record for a single bridge call within an execution.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeCallAudit {
    /// Operation name.
    pub op: &'static str,
    /// SHA-256 hash of the serialized arguments (args never stored raw).
    pub args_hash: String,
    /// Duration of this call in milliseconds.
    pub duration_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error code when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// The outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script returned a value.
    Value {
        /// Size of the serialized value in bytes.
        size_bytes: usize,
    },
    /// The script replied.
    Reply,
    /// The script failed.
    ScriptError {
        /// The error message.
        message: String,
    },
    /// Wall time exceeded.
    Timeout,
    /// Heap ceiling exceeded.
    MemoryLimit,
    /// Protocol or process failure.
    Transport {
        /// Operator-facing detail.
        detail: String,
    },
    /// The host could not run the execution at all.
    HostError {
        /// The error message.
        message: String,
    },
}

impl AuditOutcome {
    fn from_result(result: &ExecutionResult) -> Self {
        match result {
            ExecutionResult::Value { value } => AuditOutcome::Value {
                size_bytes: serde_json::to_string(value).map(|s| s.len()).unwrap_or(0),
            },
            ExecutionResult::Reply(_) => AuditOutcome::Reply,
            ExecutionResult::ScriptError { message, .. } => AuditOutcome::ScriptError {
                message: message.clone(),
            },
            ExecutionResult::Timeout => AuditOutcome::Timeout,
            ExecutionResult::MemoryLimit => AuditOutcome::MemoryLimit,
            ExecutionResult::Transport { detail } => AuditOutcome::Transport {
                detail: detail.clone(),
            },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AuditOutcome::Value { .. } => "value",
            AuditOutcome::Reply => "reply",
            AuditOutcome::ScriptError { .. } => "script_error",
            AuditOutcome::Timeout => "timeout",
            AuditOutcome::MemoryLimit => "memory_limit",
            AuditOutcome::Transport { .. } => "transport",
            AuditOutcome::HostError { .. } => "host_error",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true` for easy filtering; bridge
/// calls are summarised as a count. Use `RUST_LOG=tagbox=info` to capture them.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            target: "tagbox::audit",
            audit = true,
            execution_id = %entry.execution_id,
            backend = ?entry.backend,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            bridge_calls = entry.bridge_calls.len(),
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary to avoid panics on multibyte characters.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    backend: AuditBackend,
    bridge_calls: Vec<BridgeCallAudit>,
    start: Instant,
    pool_size_at_acquire: Option<usize>,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for an execution.
    pub fn new(code: &str, backend: AuditBackend) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            backend,
            bridge_calls: Vec::new(),
            start: Instant::now(),
            pool_size_at_acquire: None,
        }
    }

    /// The execution id this entry will carry.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record a bridge call.
    pub fn record_bridge_call(&mut self, audit: BridgeCallAudit) {
        self.bridge_calls.push(audit);
    }

    /// Drain every call recorded by an [`AuditingBridge`].
    pub fn drain_calls(&mut self, rx: &mut UnboundedReceiver<BridgeCallAudit>) {
        while let Ok(call) = rx.try_recv() {
            self.record_bridge_call(call);
        }
    }

    /// Record the live worker count when the worker was acquired.
    pub fn pool_size_at_acquire(&mut self, size: usize) {
        self.pool_size_at_acquire = Some(size);
    }

    /// Finalize the audit entry with a classified result.
    pub fn finish(self, result: &ExecutionResult) -> AuditEntry {
        let outcome = AuditOutcome::from_result(result);
        self.finish_with(outcome)
    }

    /// Finalize the audit entry for an execution the host could not run.
    pub fn finish_host_error(self, error: &dyn std::fmt::Display) -> AuditEntry {
        self.finish_with(AuditOutcome::HostError {
            message: error.to_string(),
        })
    }

    fn finish_with(self, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            backend: self.backend,
            bridge_calls: self.bridge_calls,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
            pool_size_at_acquire: self.pool_size_at_acquire,
        }
    }
}

/// An audit-recording wrapper around a [`HostBridge`].
pub struct AuditingBridge {
    inner: Arc<dyn HostBridge>,
    audit_tx: UnboundedSender<BridgeCallAudit>,
}

impl AuditingBridge {
    /// Wrap a bridge with audit recording.
    pub fn new(inner: Arc<dyn HostBridge>, audit_tx: UnboundedSender<BridgeCallAudit>) -> Self {
        Self { inner, audit_tx }
    }

    async fn record<F>(&self, op: BridgeOp, args: Value, call: F) -> Result<Value, BridgeError>
    where
        F: std::future::Future<Output = Result<Value, BridgeError>>,
    {
        let args_hash = sha256_hex(&args.to_string());
        let start = Instant::now();
        let result = call.await;
        let _ = self.audit_tx.send(BridgeCallAudit {
            op: op.name(),
            args_hash,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
            error_code: result.as_ref().err().map(BridgeError::code),
        });
        result
    }
}

#[async_trait::async_trait]
impl HostBridge for AuditingBridge {
    async fn find_users(&self, query: String) -> Result<Value, BridgeError> {
        let args = Value::from(vec![query.clone()]);
        self.record(BridgeOp::FindUsers, args, self.inner.find_users(query))
            .await
    }

    async fn dump_tags(&self) -> Result<Value, BridgeError> {
        self.record(BridgeOp::DumpTags, Value::Array(vec![]), self.inner.dump_tags())
            .await
    }

    async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
        let args = Value::from(vec![name.clone()]);
        self.record(BridgeOp::FetchTag, args, self.inner.fetch_tag(name))
            .await
    }

    async fn fetch_message(
        &self,
        channel_id: String,
        message_id: String,
    ) -> Result<Value, BridgeError> {
        let args = Value::from(vec![channel_id.clone(), message_id.clone()]);
        self.record(
            BridgeOp::FetchMessage,
            args,
            self.inner.fetch_message(channel_id, message_id),
        )
        .await
    }

    async fn fetch_messages(&self, channel_id: String, opts: Value) -> Result<Value, BridgeError> {
        let args = Value::Array(vec![Value::from(channel_id.clone()), opts.clone()]);
        self.record(
            BridgeOp::FetchMessages,
            args,
            self.inner.fetch_messages(channel_id, opts),
        )
        .await
    }

    async fn http_request(&self, config: Value) -> Result<Value, BridgeError> {
        let args = Value::Array(vec![config.clone()]);
        self.record(BridgeOp::HttpRequest, args, self.inner.http_request(config))
            .await
    }
}
