//! Worker sandbox: runs a script in a pooled `tagbox-worker` process.
//!
//! The host connects to the worker's Unix socket, sends one `script`
//! envelope, answers `funcCall`s through the caller's [`HostBridge`] and
//! waits for a terminal `result` or `error`. Whatever happens, the worker is
//! destroyed afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinSet;

use crate::audit::{AuditBackend, AuditEntryBuilder, AuditLogger, AuditingBridge, NoopAuditLogger};
use crate::bridge::{self, BridgeOp};
use crate::error::SandboxError;
use crate::executor::SandboxConfig;
use crate::ipc::{write_envelope, Envelope, EnvelopeStream, IpcError, ScriptPayload};
use crate::pool::{last_line, Worker, WorkerPool};
use crate::validator::{check_output_size, validate_code};
use crate::{ExecutionRequest, ExecutionResult, HostBridge};

/// Name of the worker executable.
pub const WORKER_BIN_NAME: &str = "tagbox-worker";

/// Extra time the host grants over the script's wall time, so the worker can
/// report its own timeout first.
const HOST_TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for a worker that closed its socket to exit.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Stderr fragments the V8 runtime prints when it dies of heap exhaustion.
const HEAP_EXHAUSTION_MARKERS: &[&str] = &[
    "JavaScript heap out of memory",
    "Reached heap limit",
    "Fatal JavaScript out of memory",
    "Fatal JavaScript invalid size error",
    "Allocation failed",
];

/// Sandbox backend that runs each script in a fresh worker process.
pub struct WorkerSandbox {
    pool: WorkerPool,
    config: SandboxConfig,
    audit_logger: Arc<dyn AuditLogger>,
}

impl WorkerSandbox {
    /// Create a worker sandbox on top of a pool.
    pub fn new(pool: WorkerPool, config: SandboxConfig) -> Self {
        Self::with_audit_logger(pool, config, Arc::new(NoopAuditLogger))
    }

    /// Create a worker sandbox with an audit logger.
    pub fn with_audit_logger(
        pool: WorkerPool,
        config: SandboxConfig,
        logger: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            pool,
            config,
            audit_logger: logger,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run one script in a pooled worker and classify its outcome.
    ///
    /// `Err` is returned only when no worker could be obtained.
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
            "worker: starting"
        );

        let mut audit = AuditEntryBuilder::new(&request.code, AuditBackend::WorkerPool);

        if let Err(rejected) = validate_code(&request.code, Some(self.config.max_code_size)) {
            self.audit_logger.log(&audit.finish(&rejected)).await;
            return Ok(rejected);
        }

        let mut worker = match self.pool.acquire().await {
            Ok(worker) => worker,
            Err(e) => {
                self.audit_logger.log(&audit.finish_host_error(&e)).await;
                tracing::warn!(error = %e, "worker: no worker available");
                return Err(e);
            }
        };
        audit.pool_size_at_acquire(self.pool.metrics().live());

        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel();
        let bridge: Arc<dyn HostBridge> = Arc::new(AuditingBridge::new(bridge, audit_tx));

        let outcome = self.run_on(&mut worker, &request, bridge).await;
        self.pool.destroy(worker).await;

        audit.drain_calls(&mut audit_rx);
        self.audit_logger.log(&audit.finish(&outcome)).await;
        match &outcome {
            ExecutionResult::Transport { detail } => {
                tracing::error!(detail = %detail, "worker: transport failure")
            }
            other => tracing::info!(outcome = other.label(), "worker: complete"),
        }
        Ok(outcome)
    }

    async fn run_on(
        &self,
        worker: &mut Worker,
        request: &ExecutionRequest,
        bridge: Arc<dyn HostBridge>,
    ) -> ExecutionResult {
        let Some(socket_path) = worker.socket_path().map(Path::to_path_buf) else {
            return ExecutionResult::transport("worker has no socket");
        };
        let stream = match UnixStream::connect(&socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                return ExecutionResult::transport(format!(
                    "connect to {}: {e}",
                    socket_path.display()
                ))
            }
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut incoming =
            EnvelopeStream::spawn(BufReader::new(read_half), self.config.max_message_size);

        let deadline = request.limits.wall_time() + HOST_TIMEOUT_GRACE;
        let exchanged = tokio::time::timeout(
            deadline,
            exchange(&mut incoming, &mut write_half, request, bridge),
        )
        .await;

        match exchanged {
            Ok(Exchange::Finished(ExecutionResult::Value { value })) => {
                let len = serde_json::to_vec(&value).map_or(usize::MAX, |json| json.len());
                match check_output_size(len, self.config.max_output_size) {
                    Ok(()) => ExecutionResult::Value { value },
                    Err(too_large) => too_large,
                }
            }
            Ok(Exchange::Finished(outcome)) => outcome,
            Ok(Exchange::Closed) => classify_exit(worker).await,
            Err(_) => {
                tracing::warn!(worker = worker.id(), "worker: wall time exceeded, killing");
                ExecutionResult::Timeout
            }
        }
    }
}

/// How an exchange with a worker ended.
#[derive(Debug, PartialEq)]
pub enum Exchange {
    /// A terminal outcome was reached.
    Finished(ExecutionResult),
    /// The worker went away without a terminal message.
    Closed,
}

/// Drive one script through the worker protocol.
///
/// Sends the `script` envelope, then serves `funcCall`s concurrently (replies
/// are matched by `uniqueName`, so they may go out in any order) until a
/// terminal message arrives. Calls still in flight when this returns are
/// abandoned.
pub async fn exchange<W: AsyncWrite + Unpin>(
    incoming: &mut EnvelopeStream,
    writer: &mut W,
    request: &ExecutionRequest,
    bridge: Arc<dyn HostBridge>,
) -> Exchange {
    let script = Envelope::Script(ScriptPayload {
        code: request.code.clone(),
        scope: request.scope.clone(),
        options: request.limits,
        funcs: request.callback_names.iter().cloned().collect(),
    });
    if let Err(e) = write_envelope(writer, &script).await {
        return connection_failed(e);
    }

    let mut calls: JoinSet<Envelope> = JoinSet::new();
    loop {
        tokio::select! {
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                let reply = match joined {
                    Ok(reply) => reply,
                    Err(e) => {
                        return Exchange::Finished(ExecutionResult::transport(format!(
                            "bridge task failed: {e}"
                        )))
                    }
                };
                if let Err(e) = write_envelope(writer, &reply).await {
                    return connection_failed(e);
                }
            }
            next = incoming.next() => {
                let envelope = match next {
                    None => return Exchange::Closed,
                    Some(Err(e)) => return connection_failed(e),
                    Some(Ok(envelope)) => envelope,
                };
                match envelope {
                    Envelope::FuncCall { name, unique_name, args } => {
                        if !request.callback_names.contains(&name) {
                            return Exchange::Finished(not_registered(&name));
                        }
                        match BridgeOp::from_name(&name) {
                            Some(BridgeOp::Reply) => {
                                return Exchange::Finished(ExecutionResult::Reply(
                                    bridge::reply_payload(args),
                                ));
                            }
                            Some(op) => {
                                tracing::debug!(op = %op, call = %unique_name, "worker: bridge call");
                                let bridge = bridge.clone();
                                calls.spawn(async move {
                                    let result = bridge::dispatch(bridge.as_ref(), op, args).await;
                                    func_return(unique_name, result)
                                });
                            }
                            None => return Exchange::Finished(not_registered(&name)),
                        }
                    }
                    Envelope::Result(value) => {
                        return Exchange::Finished(ExecutionResult::value(value))
                    }
                    Envelope::Error { name, message, stack } => {
                        return Exchange::Finished(classify_error(name, message, stack))
                    }
                    other => {
                        return Exchange::Finished(ExecutionResult::transport(format!(
                            "unexpected `{}` envelope from worker",
                            other.kind()
                        )))
                    }
                }
            }
        }
    }
}

fn func_return(unique_name: String, result: Result<Value, tag_error::BridgeError>) -> Envelope {
    match result {
        Ok(data) => Envelope::FuncReturn {
            unique_name,
            data,
            error: None,
        },
        Err(e) => Envelope::FuncReturn {
            unique_name,
            data: Value::Null,
            error: Some(e.script_message()),
        },
    }
}

fn connection_failed(e: IpcError) -> Exchange {
    match e {
        // The worker went away; its exit status and stderr say more than the
        // socket error does.
        IpcError::Io(_) | IpcError::Truncated => Exchange::Closed,
        other => Exchange::Finished(ExecutionResult::transport(other.to_string())),
    }
}

fn not_registered(name: &str) -> ExecutionResult {
    ExecutionResult::ScriptError {
        name: "ReferenceError".into(),
        message: format!("{name} is not a registered callback"),
        stack: None,
    }
}

/// Map a worker `error` envelope onto a failure class.
fn classify_error(name: String, message: String, stack: Option<String>) -> ExecutionResult {
    match name.as_str() {
        "TimeoutError" => ExecutionResult::Timeout,
        "MemoryLimitError" => ExecutionResult::MemoryLimit,
        "InternalError" => ExecutionResult::transport(format!("worker: {message}")),
        _ => ExecutionResult::ScriptError {
            name,
            message,
            stack,
        },
    }
}

/// Classify a worker that closed its socket without a terminal message.
async fn classify_exit(worker: &mut Worker) -> ExecutionResult {
    let status = worker.wait_exit(EXIT_GRACE).await;
    let diagnostics = worker.collect_diagnostics(EXIT_GRACE).await;

    if is_heap_exhaustion(&diagnostics) {
        return ExecutionResult::MemoryLimit;
    }
    if killed_by_cpu_limit(status) {
        return ExecutionResult::Timeout;
    }

    let status = match status {
        Some(status) => status.to_string(),
        None => "still running".to_string(),
    };
    ExecutionResult::transport(format!(
        "worker closed the connection without a result ({status}): {}",
        last_line(&diagnostics)
    ))
}

/// Whether worker stderr shows the runtime died of heap exhaustion.
///
/// Best effort: it relies on the fatal-error text V8 prints before aborting.
pub fn is_heap_exhaustion(diagnostics: &str) -> bool {
    HEAP_EXHAUSTION_MARKERS
        .iter()
        .any(|marker| diagnostics.contains(marker))
}

#[cfg(unix)]
fn killed_by_cpu_limit(status: Option<std::process::ExitStatus>) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.and_then(|s| s.signal()) == Some(libc::SIGXCPU)
}

#[cfg(not(unix))]
fn killed_by_cpu_limit(_status: Option<std::process::ExitStatus>) -> bool {
    false
}

/// Find the `tagbox-worker` binary.
///
/// Search order:
/// 1. `TAGBOX_WORKER_BIN` environment variable (must be absolute path)
/// 2. Same directory as the current executable
/// 3. Its parent (test binaries live in `target/*/deps/`)
///
/// On Unix, rejects world-writable binaries.
pub fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var("TAGBOX_WORKER_BIN") {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::WorkerBinary(format!(
                "TAGBOX_WORKER_BIN must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidates = [Some(dir), dir.parent()];
            for dir in candidates.into_iter().flatten() {
                let worker = dir.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::WorkerBinary(format!(
        "{WORKER_BIN_NAME} binary not found. Set TAGBOX_WORKER_BIN or install it alongside tagbox"
    )))
}

fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::WorkerBinary(format!(
                "cannot read metadata for {}: {e}",
                _path.display()
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::WorkerBinary(format!(
                "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
                _path.display(),
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::read_envelope;
    use serde_json::json;
    use serial_test::serial;
    use tag_error::BridgeError;
    use tokio::io::{AsyncBufRead, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// Tags that answer after a delay taken from their name (`"slow-30"`).
    struct DelayedTags;

    #[async_trait::async_trait]
    impl HostBridge for DelayedTags {
        async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
            let ms = name
                .rsplit('-')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if name == "missing" {
                return Err(BridgeError::NotFound("tag `missing`".into()));
            }
            Ok(json!({ "name": name }))
        }
    }

    /// The host end of a duplex pipe and the fake worker's end.
    fn pipe() -> (
        EnvelopeStream,
        WriteHalf<DuplexStream>,
        BufReader<ReadHalf<DuplexStream>>,
        WriteHalf<DuplexStream>,
    ) {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);
        (
            EnvelopeStream::spawn(BufReader::new(host_read), 1024 * 1024),
            host_write,
            BufReader::new(worker_read),
            worker_write,
        )
    }

    async fn recv<R: AsyncBufRead + Unpin>(reader: &mut R) -> Envelope {
        read_envelope(reader, 1024 * 1024).await.unwrap().unwrap()
    }

    fn call(name: &str, id: &str, args: Value) -> Envelope {
        Envelope::FuncCall {
            name: name.into(),
            unique_name: id.into(),
            args: args.as_array().cloned().unwrap_or_default(),
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("return 1").with_callbacks(["fetchTag", "reply"])
    }

    #[tokio::test]
    async fn result_envelope_is_a_value() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            match recv(&mut w_read).await {
                Envelope::Script(payload) => {
                    assert_eq!(payload.code, "return 1");
                    assert_eq!(payload.funcs, vec!["fetchTag", "reply"]);
                }
                other => panic!("expected script, got {other:?}"),
            }
            write_envelope(&mut w_write, &Envelope::Result(json!(1))).await.unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Finished(ExecutionResult::value(json!(1))));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_calls_are_answered_by_id() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            for (id, name) in [("fetchTag-1", "slow-80"), ("fetchTag-2", "fast-0"), ("fetchTag-3", "mid-30")] {
                write_envelope(&mut w_write, &call("fetchTag", id, json!([name]))).await.unwrap();
            }

            let mut order = Vec::new();
            for _ in 0..3 {
                match recv(&mut w_read).await {
                    Envelope::FuncReturn { unique_name, data, error } => {
                        assert!(error.is_none());
                        order.push((unique_name, data["name"].as_str().unwrap().to_string()));
                    }
                    other => panic!("expected funcReturn, got {other:?}"),
                }
            }
            assert_eq!(
                order,
                vec![
                    ("fetchTag-2".to_string(), "fast-0".to_string()),
                    ("fetchTag-3".to_string(), "mid-30".to_string()),
                    ("fetchTag-1".to_string(), "slow-80".to_string()),
                ]
            );
            write_envelope(&mut w_write, &Envelope::Result(json!("done"))).await.unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Finished(ExecutionResult::value(json!("done"))));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn bridge_errors_travel_in_func_return() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            write_envelope(&mut w_write, &call("fetchTag", "fetchTag-1", json!(["missing"])))
                .await
                .unwrap();
            match recv(&mut w_read).await {
                Envelope::FuncReturn { data, error, .. } => {
                    assert_eq!(data, Value::Null);
                    assert!(error.unwrap().contains("not found"));
                }
                other => panic!("expected funcReturn, got {other:?}"),
            }
            write_envelope(&mut w_write, &Envelope::Result(Value::Null)).await.unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Finished(ExecutionResult::value(Value::Null)));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn reply_call_is_terminal() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            write_envelope(&mut w_write, &call("reply", "reply-1", json!(["hi", {"tts": false}])))
                .await
                .unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        match end {
            Exchange::Finished(ExecutionResult::Reply(payload)) => {
                assert_eq!(payload.content, json!("hi"));
                assert_eq!(payload.options, json!({"tts": false}));
            }
            other => panic!("expected reply, got {other:?}"),
        }
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn undeclared_callback_fails_the_script() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            write_envelope(&mut w_write, &call("dumpTags", "dumpTags-1", json!([])))
                .await
                .unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        match end {
            Exchange::Finished(ExecutionResult::ScriptError { name, message, .. }) => {
                assert_eq!(name, "ReferenceError");
                assert!(message.contains("dumpTags"));
            }
            other => panic!("expected script error, got {other:?}"),
        }
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn error_envelopes_map_to_failure_classes() {
        for (name, expected) in [
            ("TimeoutError", ExecutionResult::Timeout),
            ("MemoryLimitError", ExecutionResult::MemoryLimit),
        ] {
            let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
            let worker = tokio::spawn(async move {
                recv(&mut w_read).await;
                let error = Envelope::Error {
                    name: name.into(),
                    message: "limit".into(),
                    stack: None,
                };
                write_envelope(&mut w_write, &error).await.unwrap();
            });
            let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
            assert_eq!(end, Exchange::Finished(expected));
            worker.await.unwrap();
        }

        assert_eq!(
            classify_error("TypeError".into(), "x is not a function".into(), None),
            ExecutionResult::ScriptError {
                name: "TypeError".into(),
                message: "x is not a function".into(),
                stack: None,
            }
        );
    }

    #[tokio::test]
    async fn malformed_line_is_a_transport_failure() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            w_write.write_all(b"{not json\n").await.unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert!(
            matches!(end, Exchange::Finished(ExecutionResult::Transport { .. })),
            "{end:?}"
        );
        worker.await.unwrap();

        // The next exchange on a fresh connection is unaffected.
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        tokio::spawn(async move {
            recv(&mut w_read).await;
            write_envelope(&mut w_write, &Envelope::Result(json!(2))).await.unwrap();
        });
        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Finished(ExecutionResult::value(json!(2))));
    }

    #[tokio::test]
    async fn hangup_without_result_is_closed() {
        let (mut incoming, mut writer, mut w_read, w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            drop(w_write);
            drop(w_read);
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Closed);
        worker.await.unwrap();
    }

    /// A socket whose peer crashed: every read fails with a reset.
    struct ResetSocket;

    impl tokio::io::AsyncRead for ResetSocket {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    #[tokio::test]
    async fn reset_mid_exchange_defers_to_exit_status() {
        use tokio::io::AsyncReadExt;

        let slow_call = call("fetchTag", "fetchTag-1", json!(["slow-50"]));
        let mut line = serde_json::to_vec(&slow_call).unwrap();
        line.push(b'\n');
        let socket = std::io::Cursor::new(line).chain(ResetSocket);
        let mut incoming = EnvelopeStream::spawn(BufReader::new(socket), 1024 * 1024);
        let mut writer = tokio::io::sink();

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Closed);
    }

    #[tokio::test]
    async fn truncated_last_line_defers_to_exit_status() {
        let (mut incoming, mut writer, mut w_read, mut w_write) = pipe();
        let worker = tokio::spawn(async move {
            recv(&mut w_read).await;
            w_write.write_all(b"{\"result\":{\"half").await.unwrap();
            w_write.shutdown().await.unwrap();
        });

        let end = exchange(&mut incoming, &mut writer, &request(), Arc::new(DelayedTags)).await;
        assert_eq!(end, Exchange::Closed);
        worker.await.unwrap();
    }

    #[test]
    fn heap_exhaustion_markers() {
        assert!(is_heap_exhaustion(
            "\n<--- Last few GCs --->\nFatal JavaScript out of memory: Reached heap limit\n"
        ));
        assert!(!is_heap_exhaustion("thread 'main' panicked at src/main.rs"));
        assert!(!is_heap_exhaustion(""));
    }

    #[test]
    #[serial]
    fn find_worker_binary_rejects_relative_env_var() {
        std::env::set_var("TAGBOX_WORKER_BIN", "./relative/path");
        let result = find_worker_binary();
        std::env::remove_var("TAGBOX_WORKER_BIN");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    #[serial]
    fn find_worker_binary_error_guides_user() {
        std::env::remove_var("TAGBOX_WORKER_BIN");
        if let Err(e) = find_worker_binary() {
            let msg = e.to_string();
            assert!(msg.contains("TAGBOX_WORKER_BIN"), "error should guide user: {msg}");
        }
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn find_worker_binary_rejects_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var("TAGBOX_WORKER_BIN", bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var("TAGBOX_WORKER_BIN");

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn find_worker_binary_accepts_secure_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var("TAGBOX_WORKER_BIN", bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var("TAGBOX_WORKER_BIN");

        assert_eq!(result.unwrap(), bin);
    }
}
