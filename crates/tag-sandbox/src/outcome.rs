//! Execution requests and their classified results.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-execution resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock ceiling in milliseconds.
    #[serde(rename = "wallTimeMs")]
    pub wall_time_ms: u64,
    /// Heap ceiling in MiB.
    #[serde(rename = "memoryMiB")]
    pub memory_mib: usize,
}

impl Limits {
    /// Wall-clock ceiling as a [`Duration`].
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    /// Heap ceiling in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.memory_mib.saturating_mul(1024 * 1024)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            wall_time_ms: 5_000,
            memory_mib: 64,
        }
    }
}

/// One script to run. Immutable once submitted to a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Script source. Runs as the body of an async function, so `return`
    /// produces the result.
    pub code: String,
    /// Globals injected (as deep copies) before the script runs.
    pub scope: Map<String, Value>,
    /// Resource ceilings.
    pub limits: Limits,
    /// Bridge operations the script may call, by script-visible name.
    pub callback_names: BTreeSet<String>,
}

impl ExecutionRequest {
    /// A request with default limits, no scope and no callbacks.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    /// Set one scope global.
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.scope.insert(name.into(), value);
        self
    }

    /// Replace the limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Allow the named callbacks.
    pub fn with_callbacks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.callback_names.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Arguments of a `reply(content, options)` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    /// Reply body, usually a string.
    pub content: Value,
    /// Reply options (embeds, mentions, ...), `null` when absent.
    #[serde(default)]
    pub options: Value,
}

/// The single terminal outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The script returned normally. `undefined` is reported as `null`.
    Value {
        /// The returned value.
        value: Value,
    },
    /// The script called `reply`.
    Reply(ReplyPayload),
    /// The script threw, failed to compile, or produced an unusable result.
    ScriptError {
        /// Error class (`TypeError`, `SyntaxError`, ...).
        name: String,
        /// Error message.
        message: String,
        /// Stack trace when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    /// Wall-time ceiling exceeded.
    Timeout,
    /// Heap ceiling exceeded.
    MemoryLimit,
    /// Protocol or process failure not attributable to the script.
    Transport {
        /// Operator-facing detail.
        detail: String,
    },
}

impl ExecutionResult {
    /// Shorthand for [`ExecutionResult::Value`].
    pub fn value(value: Value) -> Self {
        ExecutionResult::Value { value }
    }

    /// A script error with the generic `Error` name and no stack.
    pub fn script_error(message: impl Into<String>) -> Self {
        ExecutionResult::ScriptError {
            name: "Error".into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Shorthand for [`ExecutionResult::Transport`].
    pub fn transport(detail: impl Into<String>) -> Self {
        ExecutionResult::Transport {
            detail: detail.into(),
        }
    }

    /// Short label for logs and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Value { .. } => "value",
            ExecutionResult::Reply(_) => "reply",
            ExecutionResult::ScriptError { .. } => "script_error",
            ExecutionResult::Timeout => "timeout",
            ExecutionResult::MemoryLimit => "memory_limit",
            ExecutionResult::Transport { .. } => "transport",
        }
    }

    /// Whether the script completed without a failure class.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ExecutionResult::Value { .. } | ExecutionResult::Reply(_)
        )
    }
}
