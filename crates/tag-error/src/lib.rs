//! Typed error types for the tagbox host bridge.
//!
//! Provides [`BridgeError`], the canonical error type returned by every
//! `HostBridge` operation (user lookup, tag access, message fetches, outbound
//! HTTP).

use thiserror::Error;

/// Canonical error type for host bridge operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The requested entity (tag, message, user) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The sandboxed code passed arguments of the wrong shape.
    #[error("invalid arguments for `{op}`: {reason}")]
    InvalidArguments {
        /// Bridge operation name.
        op: String,
        /// What was wrong with the arguments.
        reason: String,
    },

    /// The host does not provide this operation.
    #[error("operation `{0}` is not supported by this host")]
    Unsupported(String),

    /// The operation is not registered for the running execution.
    #[error("operation `{0}` is not available to this script")]
    NotRegistered(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    Denied(String),

    /// An upstream service (chat API, HTTP target) returned an error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The operation was relayed to another process and failed there.
    #[error("{0}")]
    Relayed(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::NotRegistered(_) => "NOT_REGISTERED",
            Self::Denied(_) => "DENIED",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Relayed(_) => "RELAYED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the message is safe to show to the script author verbatim.
    ///
    /// Internal errors may carry host paths or credentials and are replaced
    /// by a generic message before crossing into the sandbox.
    pub fn is_script_visible(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    /// The message handed to sandboxed code when the operation fails.
    pub fn script_message(&self) -> String {
        if self.is_script_visible() {
            self.to_string()
        } else {
            "internal host error".to_string()
        }
    }

    /// Shorthand for [`BridgeError::InvalidArguments`].
    pub fn invalid_arguments(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

// Compile-time assertion: BridgeError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BridgeError>();
};
