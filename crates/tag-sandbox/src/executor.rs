//! Isolate sandbox: a fresh V8 isolate per script.
//!
//! Each execution gets a brand new runtime. No state leaks between calls.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. Bridge futures run on
//! the caller's runtime, reached through a captured [`Handle`]. The public
//! API is fully async and `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::audit::{AuditBackend, AuditEntryBuilder, AuditLogger, AuditingBridge, NoopAuditLogger};
use crate::bridge::BridgeOp;
use crate::error::SandboxError;
use crate::ops::{tag_ext, BridgeContext, RecordedReply, ScriptOutput};
use crate::validator::{check_output_size, validate_code};
use crate::{ExecutionRequest, ExecutionResult, HostBridge};

/// Default ceiling on a serialized script result: 1 MiB.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Configuration shared by both sandbox backends.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum concurrent isolate executions.
    pub max_concurrent: usize,
    /// Maximum size of submitted code in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// Maximum size of one worker protocol line in bytes.
    pub max_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE, // 64 KB
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_message_size: crate::ipc::DEFAULT_MAX_MESSAGE_SIZE, // 8 MB
        }
    }
}

/// The in-process sandbox. Creates a fresh V8 isolate for each execution.
///
/// This is `Send + Sync` safe: all V8 operations are dispatched to a
/// dedicated thread internally. A concurrency semaphore limits the number
/// of simultaneous isolates.
pub struct IsolateSandbox {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl IsolateSandbox {
    /// Create a new isolate sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new isolate sandbox with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
        }
    }

    /// Run one script and classify its outcome.
    ///
    /// Script failures, timeouts and heap exhaustion are returned as
    /// [`ExecutionResult`] variants. `Err` means the host could not run the
    /// script at all.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        bridge: Arc<dyn HostBridge>,
    ) -> Result<ExecutionResult, SandboxError> {
        tracing::info!(
            code_len = request.code.len(),
            wall_time_ms = request.limits.wall_time_ms,
            memory_mib = request.limits.memory_mib,
            callbacks = request.callback_names.len(),
            "isolate: starting"
        );

        let mut audit = AuditEntryBuilder::new(&request.code, AuditBackend::Isolate);

        if let Err(rejected) = validate_code(&request.code, Some(self.config.max_code_size)) {
            self.audit_logger.log(&audit.finish(&rejected)).await;
            return Ok(rejected);
        }

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel();
        let bridge: Arc<dyn HostBridge> = Arc::new(AuditingBridge::new(bridge, audit_tx));

        let result = spawn_isolate_thread(self.config.clone(), request, bridge).await;

        audit.drain_calls(&mut audit_rx);
        match &result {
            Ok(outcome) => {
                self.audit_logger.log(&audit.finish(outcome)).await;
                tracing::info!(outcome = outcome.label(), "isolate: complete");
            }
            Err(e) => {
                self.audit_logger.log(&audit.finish_host_error(e)).await;
                tracing::warn!(error = %e, "isolate: failed");
            }
        }
        result
    }
}

/// Run [`run_isolated`] on a dedicated thread and await its result.
async fn spawn_isolate_thread(
    config: SandboxConfig,
    request: ExecutionRequest,
    bridge: Arc<dyn HostBridge>,
) -> Result<ExecutionResult, SandboxError> {
    let host = Handle::current();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name("tagbox-isolate".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_isolated(&config, &request, bridge, host));
            if tx.send(Ok(result)).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        })
        .map_err(|e| SandboxError::Execution(anyhow::Error::new(e).context("spawn isolate thread")))?;

    rx.await
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState in `run_isolated`,
    // which is dropped only after the runtime owning the isolate is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Installs scope globals and bridge functions, then removes `Deno`.
///
/// Called as `(BOOTSTRAP)(Deno.core.ops, scopeJson, enabledNames)`. Scope
/// values are parsed from JSON, so the isolate only ever sees copies.
const BOOTSTRAP: &str = r#"(ops, scopeJson, enabled) => {
    const bridgeCall = ops.op_tag_bridge_call;
    const replyOp = ops.op_tag_reply;
    const setResult = ops.op_tag_set_result;
    const logOp = ops.op_tag_log;
    const stringify = JSON.stringify;
    const parse = JSON.parse;

    const scope = parse(scopeJson);
    for (const key of Object.keys(scope)) {
        globalThis[key] = scope[key];
    }

    const define = (name, value) => Object.defineProperty(globalThis, name, {
        value, writable: false, configurable: false, enumerable: false,
    });

    for (const name of enabled) {
        if (name === "reply") continue;
        define(name, (...args) => parse(bridgeCall(name, stringify(args))));
    }

    if (enabled.includes("reply")) {
        const reply = (content, options) => {
            replyOp(stringify([content ?? null, options ?? null]));
        };
        define("reply", reply);
        if (globalThis.msg !== null && typeof globalThis.msg === "object") {
            globalThis.msg.reply = reply;
        }
    }

    const show = (args) => args.map((a) => {
        if (typeof a === "string") return a;
        try { return stringify(a) ?? String(a); } catch { return String(a); }
    }).join(" ");
    globalThis.console = Object.freeze({
        log: (...a) => logOp("log", show(a)),
        debug: (...a) => logOp("debug", show(a)),
        info: (...a) => logOp("info", show(a)),
        warn: (...a) => logOp("warn", show(a)),
        error: (...a) => logOp("error", show(a)),
    });

    define("__tagbox", Object.freeze({
        resolve(value) {
            let json;
            try {
                json = stringify({ ok: value === undefined ? null : value });
            } catch (e) {
                json = stringify({ error: {
                    name: "TypeError",
                    message: "result is not serializable: " + String(e && e.message),
                    stack: null,
                } });
            }
            setResult(json ?? stringify({ ok: null }));
        },
        reject(e) {
            const err = (e !== null && typeof e === "object") ? e : { message: String(e) };
            setResult(stringify({ error: {
                name: String(err.name || "Error"),
                message: String(err.message ?? e),
                stack: typeof err.stack === "string" ? err.stack : null,
            } }));
        },
    }));

    delete globalThis.Deno;
}"#;

/// Run one request in a fresh isolate on the current thread.
///
/// Must be called on a dedicated thread, not the main tokio runtime: bridge
/// ops block this thread while their futures run on `host`. Public for reuse
/// in the worker binary.
pub async fn run_isolated(
    config: &SandboxConfig,
    request: &ExecutionRequest,
    bridge: Arc<dyn HostBridge>,
    host: Handle,
) -> ExecutionResult {
    let wall_time = request.limits.wall_time();
    let deadline = Instant::now() + wall_time;

    let create_params = v8::CreateParams::default().heap_limits(0, request.limits.memory_bytes());
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![tag_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    let timed_out = Arc::new(AtomicBool::new(false));
    let enabled = BridgeOp::resolve_all(&request.callback_names);
    let enabled_names: Vec<&str> = enabled.iter().map(|op| op.name()).collect();
    let isolate = runtime.v8_isolate().thread_safe_handle();
    runtime.op_state().borrow_mut().put(BridgeContext {
        bridge,
        host,
        enabled,
        deadline,
        timed_out: timed_out.clone(),
        isolate,
    });

    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let watchdog_timed_out = timed_out.clone();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(wall_time) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = execute(&mut runtime, request, &enabled_names, wall_time, &timed_out).await;

    // Stop the watchdog before the isolate goes away.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let outcome = classify(
        &runtime,
        heap_state.triggered.load(Ordering::SeqCst),
        timed_out.load(Ordering::SeqCst),
        exec_error,
        config.max_output_size,
    );

    drop(runtime);
    drop(heap_state);
    outcome
}

/// Bootstrap, run the user code and drive the event loop to completion.
/// Returns the engine error text if any step failed.
async fn execute(
    runtime: &mut JsRuntime,
    request: &ExecutionRequest,
    enabled_names: &[&str],
    wall_time: std::time::Duration,
    timed_out: &AtomicBool,
) -> Option<String> {
    let scope_json = match serde_json::to_string(&request.scope) {
        Ok(json) => json,
        Err(e) => return Some(format!("scope is not serializable: {e}")),
    };
    let bootstrap = match (
        serde_json::to_string(&scope_json),
        serde_json::to_string(enabled_names),
    ) {
        (Ok(scope_literal), Ok(enabled_literal)) => {
            format!("({BOOTSTRAP})(Deno.core.ops, {scope_literal}, {enabled_literal});")
        }
        _ => return Some("bootstrap encoding failed".into()),
    };
    if let Err(e) = runtime.execute_script("[tagbox:bootstrap]", bootstrap) {
        return Some(e.to_string());
    }

    let wrapped = format!(
        "(async () => {{\n{code}\n}})().then(\n    (v) => __tagbox.resolve(v),\n    (e) => __tagbox.reject(e),\n);",
        code = request.code
    );
    if let Err(e) = runtime.execute_script("[tagbox:script]", wrapped) {
        return Some(e.to_string());
    }

    match tokio::time::timeout(
        wall_time,
        runtime.run_event_loop(PollEventLoopOptions::default()),
    )
    .await
    {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => {
            timed_out.store(true, Ordering::SeqCst);
            Some("async timeout".into())
        }
    }
}

/// Classify in priority order: reply, heap, timeout, engine error, result.
fn classify(
    runtime: &JsRuntime,
    heap_triggered: bool,
    timed_out: bool,
    exec_error: Option<String>,
    max_output_size: usize,
) -> ExecutionResult {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();

    if let Some(RecordedReply(payload)) = state.try_take::<RecordedReply>() {
        return ExecutionResult::Reply(payload);
    }
    if heap_triggered {
        return ExecutionResult::MemoryLimit;
    }
    if timed_out {
        return ExecutionResult::Timeout;
    }
    if let Some(text) = exec_error {
        return engine_error(&text);
    }

    let Some(ScriptOutput(json)) = state.try_take::<ScriptOutput>() else {
        return ExecutionResult::script_error("script did not complete (awaited a promise that never settles)");
    };

    if let Err(too_large) = check_output_size(json.len(), max_output_size) {
        return too_large;
    }

    let envelope: Value = match serde_json::from_str(&json) {
        Ok(v) => v,
        Err(e) => return ExecutionResult::transport(format!("unreadable script result: {e}")),
    };

    if let Some(error) = envelope.get("error") {
        return ExecutionResult::ScriptError {
            name: error["name"].as_str().unwrap_or("Error").to_string(),
            message: error["message"].as_str().unwrap_or("unknown error").to_string(),
            stack: error["stack"].as_str().map(str::to_string),
        };
    }

    ExecutionResult::value(envelope.get("ok").cloned().unwrap_or(Value::Null))
}

/// Turn engine error text (`Uncaught SyntaxError: ...` plus stack lines) into
/// a script error.
pub(crate) fn engine_error(text: &str) -> ExecutionResult {
    let mut lines = text.lines();
    let head = lines.next().unwrap_or_default().trim();
    let head = head.strip_prefix("Uncaught ").unwrap_or(head);

    let (name, message) = match head.split_once(": ") {
        Some((name, message))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (name.to_string(), message.to_string())
        }
        _ => ("Error".to_string(), head.to_string()),
    };

    let stack: Vec<&str> = lines.map(str::trim_end).filter(|l| !l.is_empty()).collect();
    ExecutionResult::ScriptError {
        name,
        message,
        stack: (!stack.is_empty()).then(|| stack.join("\n")),
    }
}
