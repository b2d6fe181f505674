#![warn(missing_docs)]

//! # tag-sandbox
//!
//! Sandboxes for user-submitted tag scripts.
//!
//! Two backends run the same [`ExecutionRequest`] and produce the same
//! classified [`ExecutionResult`]:
//!
//! - [`IsolateSandbox`]: a fresh, heap-capped V8 isolate on a dedicated thread
//!   of the host process.
//! - [`WorkerSandbox`]: a pool of `tagbox-worker` processes, one script per
//!   process, talking newline-delimited JSON over a Unix socket.
//!
//! The only bridge from a script to the host is the fixed set of operations
//! in [`bridge::BridgeOp`], served by a [`HostBridge`] supplied per call.
//!
//! ## Security model
//!
//! - **Fresh isolate or process per script**: no state survives a run
//! - **No ambient capabilities**: no fs, net, env, or module loading
//! - **Wall-time and heap ceilings**: enforced by watchdog, heap callback and
//!   host-side timers; workers are killed on expiry
//! - **Isolation by replacement**: workers are destroyed after one script

pub mod audit;
pub mod bridge;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
pub mod ops;
pub mod outcome;
pub mod pending;
pub mod pool;
pub mod validator;

pub use bridge::BridgeOp;
pub use error::SandboxError;
pub use executor::{IsolateSandbox, SandboxConfig};
pub use host::WorkerSandbox;
pub use outcome::{ExecutionRequest, ExecutionResult, Limits, ReplyPayload};
pub use pool::{PoolConfig, WorkerPool};

use serde_json::Value;
use tag_error::BridgeError;

/// Host capabilities reachable from sandboxed code.
///
/// Implementations are supplied per execution by the caller, typically bound
/// to the chat message that triggered the tag so lookups can be scoped to its
/// author. All arguments and results are plain JSON data; nothing live crosses
/// into the sandbox.
///
/// Every method has a default that reports the operation as unsupported, so a
/// host only implements what it actually offers. `reply` is not part of this
/// trait: the sandbox turns it into [`ExecutionResult::Reply`].
#[async_trait::async_trait]
pub trait HostBridge: Send + Sync {
    /// Search users by name, mention or id.
    async fn find_users(&self, query: String) -> Result<Value, BridgeError> {
        let _ = query;
        Err(BridgeError::Unsupported("findUsers".into()))
    }

    /// List every tag visible to the caller.
    async fn dump_tags(&self) -> Result<Value, BridgeError> {
        Err(BridgeError::Unsupported("dumpTags".into()))
    }

    /// Fetch a single tag by name.
    async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
        let _ = name;
        Err(BridgeError::Unsupported("fetchTag".into()))
    }

    /// Fetch one message from a channel.
    async fn fetch_message(
        &self,
        channel_id: String,
        message_id: String,
    ) -> Result<Value, BridgeError> {
        let _ = (channel_id, message_id);
        Err(BridgeError::Unsupported("fetchMessage".into()))
    }

    /// Fetch several messages from a channel (`opts` carries limit/before/after).
    async fn fetch_messages(&self, channel_id: String, opts: Value) -> Result<Value, BridgeError> {
        let _ = (channel_id, opts);
        Err(BridgeError::Unsupported("fetchMessages".into()))
    }

    /// Perform an outbound HTTP request described by `config`
    /// (`{url, method?, headers?, body?}`).
    async fn http_request(&self, config: Value) -> Result<Value, BridgeError> {
        let _ = config;
        Err(BridgeError::Unsupported("httpRequest".into()))
    }
}
