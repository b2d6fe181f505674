//! End-to-end tests for the worker sandbox against the real `tagbox-worker`.
//!
//! These verify that the pool and worker together:
//! - Run one script per process and destroy every worker afterwards
//! - Classify values, replies, throws, timeouts and heap exhaustion
//! - Relay bridge calls over the socket
//! - Never exceed `max_workers` live processes under a burst
//!
//! All tests are serialized to avoid resource contention from multiple
//! V8 worker processes competing on CI runners.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use serial_test::serial;
use tag_error::BridgeError;
use tag_sandbox::ipc::{read_envelope, write_envelope, Envelope, ScriptPayload};
use tag_sandbox::{
    ExecutionRequest, ExecutionResult, HostBridge, Limits, PoolConfig, SandboxConfig,
    SandboxError, WorkerPool, WorkerSandbox,
};

/// Bridge serving a fixed tag table.
struct Tags;

#[async_trait::async_trait]
impl HostBridge for Tags {
    async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
        match name.as_str() {
            "greet" => Ok(json!({ "name": "greet", "content": "hello there" })),
            _ => Err(BridgeError::NotFound(format!("tag `{name}`"))),
        }
    }
}

fn pool_config(socket_dir: &std::path::Path) -> PoolConfig {
    PoolConfig {
        min_workers: 0,
        max_workers: 2,
        socket_dir: socket_dir.to_path_buf(),
        acquire_timeout: Duration::from_secs(30),
        spawn_timeout: Duration::from_secs(10),
        worker_bin: Some(PathBuf::from(env!("CARGO_BIN_EXE_tagbox-worker"))),
        ..Default::default()
    }
}

fn sandbox(socket_dir: &std::path::Path) -> WorkerSandbox {
    WorkerSandbox::new(
        WorkerPool::new(pool_config(socket_dir)),
        SandboxConfig::default(),
    )
}

async fn run(sandbox: &WorkerSandbox, request: ExecutionRequest) -> ExecutionResult {
    sandbox.run(request, Arc::new(Tags)).await.unwrap()
}

#[tokio::test]
#[serial]
async fn returns_value_and_destroys_worker() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let result = run(&sandbox, ExecutionRequest::new("return 1 + 1")).await;
    assert_eq!(result, ExecutionResult::value(json!(2)));

    let metrics = sandbox.pool().metrics();
    assert_eq!(metrics.spawned.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.destroyed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.live(), 0);

    let leftover: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftover.is_empty(), "socket files left behind: {leftover:?}");
}

#[tokio::test]
#[serial]
async fn workers_are_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    run(&sandbox, ExecutionRequest::new("globalThis.leak = 42; return 1")).await;
    let second = run(&sandbox, ExecutionRequest::new("return typeof globalThis.leak")).await;
    assert_eq!(second, ExecutionResult::value(json!("undefined")));
    assert_eq!(sandbox.pool().metrics().spawned.load(Ordering::Relaxed), 2);
}

#[tokio::test]
#[serial]
async fn reply_ends_the_script() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let request = ExecutionRequest::new("msg.reply('hi'); return 'unreachable'")
        .with_global("msg", json!({ "content": "!tag greet" }))
        .with_callbacks(["reply"]);
    match run(&sandbox, request).await {
        ExecutionResult::Reply(payload) => assert_eq!(payload.content, json!("hi")),
        other => panic!("expected reply, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn bridge_calls_are_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let request = ExecutionRequest::new(
        r#"
        const tag = fetchTag("greet");
        let missing;
        try { fetchTag("nope"); } catch (e) { missing = e.message; }
        return { content: tag.content, missing };
        "#,
    )
    .with_callbacks(["fetchTag"]);

    let result = run(&sandbox, request).await;
    let ExecutionResult::Value { value } = result else {
        panic!("expected value, got {result:?}");
    };
    assert_eq!(value["content"], "hello there");
    assert!(value["missing"].as_str().unwrap().contains("not found"), "{value}");
}

#[tokio::test]
#[serial]
async fn thrown_errors_keep_their_class() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let result = run(&sandbox, ExecutionRequest::new("null.x")).await;
    match result {
        ExecutionResult::ScriptError { name, .. } => assert_eq!(name, "TypeError"),
        other => panic!("expected script error, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn infinite_loop_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = WorkerSandbox::new(
        WorkerPool::new(PoolConfig {
            min_workers: 1,
            ..pool_config(dir.path())
        }),
        SandboxConfig::default(),
    );
    assert_eq!(sandbox.pool().pre_warm().await, 1);

    let request = ExecutionRequest::new("while (true) {}").with_limits(Limits {
        wall_time_ms: 500,
        memory_mib: 32,
    });
    let started = Instant::now();
    let result = run(&sandbox, request).await;
    let elapsed = started.elapsed();
    assert_eq!(result, ExecutionResult::Timeout);
    assert!(elapsed >= Duration::from_millis(500), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    assert_eq!(sandbox.pool().metrics().destroyed.load(Ordering::Relaxed), 1);

    sandbox.pool().shutdown().await;
}

#[tokio::test]
#[serial]
async fn result_size_limit_holds_on_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        max_output_size: 100,
        ..SandboxConfig::default()
    };

    // The worker runs with its default ceiling; the host still enforces its own.
    let sandbox = WorkerSandbox::new(WorkerPool::new(pool_config(dir.path())), config.clone());
    let big = run(&sandbox, ExecutionRequest::new("return 'x'.repeat(1000)")).await;
    match big {
        ExecutionResult::ScriptError { name, message, .. } => {
            assert_eq!(name, "RangeError");
            assert!(message.contains("100 bytes"), "{message}");
        }
        other => panic!("expected RangeError, got {other:?}"),
    }
    let small = run(&sandbox, ExecutionRequest::new("return 'x'.repeat(10)")).await;
    assert_eq!(small, ExecutionResult::value(json!("xxxxxxxxxx")));

    // With the ceiling forwarded, the worker rejects the result itself.
    let pool = WorkerPool::new(PoolConfig {
        max_output_size: 100,
        ..pool_config(dir.path())
    });
    let sandbox = WorkerSandbox::new(pool, config);
    let big = run(&sandbox, ExecutionRequest::new("return 'x'.repeat(1000)")).await;
    assert!(
        matches!(big, ExecutionResult::ScriptError { ref name, .. } if name == "RangeError"),
        "{big:?}"
    );
}

#[tokio::test]
#[serial]
async fn corrupt_line_fails_only_its_own_execution() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(sandbox(dir.path()));

    // Drive one worker by hand and corrupt its funcReturn.
    let mut worker = sandbox.pool().acquire().await.unwrap();
    let stream = UnixStream::connect(worker.socket_path().unwrap()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut read_half = BufReader::new(read_half);
    let script = Envelope::Script(ScriptPayload {
        code: "return fetchTag('greet')".into(),
        scope: Map::new(),
        options: Limits::default(),
        funcs: vec!["fetchTag".into()],
    });
    write_envelope(&mut write_half, &script).await.unwrap();
    let call = read_envelope(&mut read_half, 1024 * 1024).await.unwrap().unwrap();
    assert_eq!(call.kind(), "funcCall");

    // A healthy execution runs alongside on the same sandbox.
    let healthy = tokio::spawn({
        let sandbox = sandbox.clone();
        async move {
            sandbox
                .run(
                    ExecutionRequest::new("return fetchTag('greet').content")
                        .with_callbacks(["fetchTag"]),
                    Arc::new(Tags),
                )
                .await
        }
    });

    write_half.write_all(b"{\"funcReturn\": nope\n").await.unwrap();
    let after = read_envelope(&mut read_half, 1024 * 1024).await;
    assert!(matches!(after, Ok(None) | Err(_)), "worker kept talking: {after:?}");
    let status = worker.wait_exit(Duration::from_secs(5)).await;
    assert!(status.is_some_and(|s| !s.success()), "{status:?}");
    sandbox.pool().destroy(worker).await;

    assert_eq!(
        healthy.await.unwrap().unwrap(),
        ExecutionResult::value(json!("hello there"))
    );

    // Right after, the sandbox still works.
    let again = run(&sandbox, ExecutionRequest::new("return 3")).await;
    assert_eq!(again, ExecutionResult::value(json!(3)));

    let metrics = sandbox.pool().metrics();
    assert_eq!(metrics.live(), 0);
    assert_eq!(
        metrics.destroyed.load(Ordering::Relaxed),
        metrics.spawned.load(Ordering::Relaxed)
    );
}

#[tokio::test]
#[serial]
async fn heap_exhaustion_is_a_memory_limit() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());

    let request = ExecutionRequest::new(
        "const hoard = []; while (true) { hoard.push(new Array(100000).fill('x')); }",
    )
    .with_limits(Limits {
        wall_time_ms: 10_000,
        memory_mib: 16,
    });
    assert_eq!(run(&sandbox, request).await, ExecutionResult::MemoryLimit);
}

#[tokio::test]
#[serial]
async fn burst_never_exceeds_max_workers() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(sandbox(dir.path()));

    let mut handles = Vec::new();
    for i in 0..5 {
        let sandbox = sandbox.clone();
        handles.push(tokio::spawn(async move {
            let code = format!("return {{ task: {i} }}");
            sandbox.run(ExecutionRequest::new(code), Arc::new(Tags)).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, ExecutionResult::value(json!({ "task": i })));
    }

    let metrics = sandbox.pool().metrics();
    assert!(metrics.peak_live.load(Ordering::SeqCst) <= 2);
    assert_eq!(metrics.spawned.load(Ordering::Relaxed), 5);
    assert_eq!(metrics.live(), 0);
}

#[tokio::test]
#[serial]
async fn shut_down_pool_refuses_work() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = sandbox(dir.path());
    sandbox.pool().shutdown().await;

    let err = sandbox
        .run(ExecutionRequest::new("return 1"), Arc::new(Tags))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::PoolShutdown), "{err}");
}
