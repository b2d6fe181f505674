//! deno_core op definitions for the isolate sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the functions and types below are documented.
#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use deno_core::op2;
use deno_core::v8;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde_json::Value;

use crate::bridge::{self, BridgeOp};
use crate::{HostBridge, ReplyPayload};

/// Per-execution bridge state stored in OpState.
pub struct BridgeContext {
    /// The host serving bridge operations.
    pub bridge: Arc<dyn HostBridge>,
    /// Runtime the host futures run on. Never the isolate thread's own runtime.
    pub host: tokio::runtime::Handle,
    /// Operations enabled for this execution.
    pub enabled: BTreeSet<BridgeOp>,
    /// Wall-clock deadline of the execution.
    pub deadline: Instant,
    /// Set when the deadline passes inside a bridge call.
    pub timed_out: Arc<AtomicBool>,
    /// Handle used to terminate the isolate from inside an op.
    pub isolate: v8::IsolateHandle,
}

/// JSON produced by the script's completion handler.
pub struct ScriptOutput(pub String);

/// Arguments of the first `reply` call.
pub struct RecordedReply(pub ReplyPayload);

/// Forward `console.*` output to tracing.
#[op2(fast)]
pub fn op_tag_log(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::warn!(target: "tagbox::sandbox::js", "{}", msg),
        "warn" => tracing::info!(target: "tagbox::sandbox::js", "{}", msg),
        _ => tracing::debug!(target: "tagbox::sandbox::js", "{}", msg),
    }
}

/// Store the execution result in OpState.
#[op2(fast)]
pub fn op_tag_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptOutput(json.to_string()));
}

/// Invoke a bridge operation and block the isolate until it settles.
///
/// The host future runs on [`BridgeContext::host`]; this thread waits on a
/// channel for at most the time left before the execution deadline. Past the
/// deadline the host task is aborted and the isolate terminated.
#[op2]
#[string]
pub fn op_tag_bridge_call(
    state: &mut OpState,
    #[string] name: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    let ctx = state.borrow::<BridgeContext>();

    let op = BridgeOp::from_name(&name)
        .filter(|op| *op != BridgeOp::Reply && ctx.enabled.contains(op))
        .ok_or_else(|| JsErrorBox::type_error(format!("{name} is not available")))?;

    let args: Vec<Value> = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::type_error(format!("{name}: arguments are not JSON: {e}")))?;

    tracing::debug!(op = %op, args_len = args_json.len(), "bridge call dispatched");

    let (tx, rx) = std::sync::mpsc::channel();
    let host_bridge = ctx.bridge.clone();
    let task = ctx.host.spawn(async move {
        let result = bridge::dispatch(host_bridge.as_ref(), op, args).await;
        let _ = tx.send(result);
    });

    let remaining = ctx.deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(Ok(value)) => serde_json::to_string(&value)
            .map_err(|e| JsErrorBox::generic(format!("{name}: result serialization failed: {e}"))),
        Ok(Err(err)) => {
            tracing::debug!(op = %op, code = err.code(), error = %err, "bridge call failed");
            Err(JsErrorBox::generic(err.script_message()))
        }
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            task.abort();
            ctx.timed_out.store(true, Ordering::SeqCst);
            ctx.isolate.terminate_execution();
            Err(JsErrorBox::generic(format!("{name} timed out")))
        }
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
            Err(JsErrorBox::generic(format!("{name} failed: host task aborted")))
        }
    }
}

/// Record a reply and stop the script.
///
/// Termination is uncatchable, so nothing after `reply(...)` runs.
#[op2(fast)]
pub fn op_tag_reply(state: &mut OpState, #[string] args_json: String) -> Result<(), JsErrorBox> {
    let isolate = {
        let ctx = state.borrow::<BridgeContext>();
        if !ctx.enabled.contains(&BridgeOp::Reply) {
            return Err(JsErrorBox::type_error("reply is not available"));
        }
        ctx.isolate.clone()
    };

    let args: Vec<Value> = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::type_error(format!("reply: arguments are not JSON: {e}")))?;

    if !state.has::<RecordedReply>() {
        state.put(RecordedReply(bridge::reply_payload(args)));
    }
    isolate.terminate_execution();
    Ok(())
}

deno_core::extension!(
    tag_ext,
    ops = [
        op_tag_log,
        op_tag_set_result,
        op_tag_bridge_call,
        op_tag_reply
    ],
);
