//! Pool of single-use `tagbox-worker` processes.
//!
//! Workers are spawned ahead of time (up to `min_workers` idle) or on demand
//! (up to `max_workers` live), each in its own process group with CPU rlimits
//! and a heap flag applied at spawn. A worker runs exactly one script and is
//! then destroyed; the pool never hands a used worker out again.
//!
//! **Capacity invariant**: every live worker holds a permit from a semaphore
//! sized `max_workers`, released only when the worker is destroyed. The
//! number of live processes can therefore never exceed `max_workers`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::SandboxError;
use crate::host::find_worker_binary;

/// Bytes of worker stderr retained for failure classification.
const DIAGNOSTICS_MAX: usize = 16 * 1024;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle workers to keep ready.
    pub min_workers: usize,
    /// Maximum live workers (idle + busy).
    pub max_workers: usize,
    /// Directory the workers create their sockets in.
    pub socket_dir: PathBuf,
    /// How long a new worker may take to announce its socket.
    pub spawn_timeout: Duration,
    /// How long `acquire` waits for capacity.
    pub acquire_timeout: Duration,
    /// Heap ceiling passed to the worker runtime (`--heap-mib`).
    pub heap_mib: usize,
    /// `RLIMIT_CPU` for each worker process, in seconds.
    pub cpu_time_secs: Option<u64>,
    /// Niceness applied to each worker process.
    pub nice: Option<i32>,
    /// External CPU limiter the worker command is wrapped in,
    /// e.g. `["/usr/bin/cpulimit", "-l", "50", "--"]`.
    pub limiter: Option<Vec<String>>,
    /// Worker binary. Located with [`find_worker_binary`] when unset.
    pub worker_bin: Option<PathBuf>,
    /// Result size ceiling passed to the worker (`--max-output-size`).
    pub max_output_size: usize,
    /// Protocol line ceiling passed to the worker (`--max-message-size`).
    pub max_message_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            socket_dir: std::env::temp_dir(),
            spawn_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            heap_mib: 64,
            cpu_time_secs: Some(10),
            nice: Some(10),
            limiter: None,
            worker_bin: None,
            max_output_size: crate::executor::DEFAULT_MAX_OUTPUT_SIZE,
            max_message_size: crate::ipc::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Atomic counters for pool observability.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Total workers spawned.
    pub spawned: AtomicU64,
    /// Total workers destroyed.
    pub destroyed: AtomicU64,
    /// Workers currently alive (idle + busy).
    pub live: AtomicUsize,
    /// Highest `live` value observed.
    pub peak_live: AtomicUsize,
}

impl PoolMetrics {
    /// Workers currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn on_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
    }

    fn on_destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A spawned worker process, owned by whoever acquired it.
///
/// Hand it back with [`WorkerPool::destroy`]. Dropping it instead (for
/// example when the caller is cancelled) still kills the process group and
/// removes the socket, without waiting for the process to be reaped.
pub struct Worker {
    id: u64,
    /// Process group id; cleared once the group has been killed.
    pgid: Option<u32>,
    child: Child,
    socket_path: Option<PathBuf>,
    // Held so the worker never sees a closed stdout.
    _stdout: Option<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
    diagnostics: Arc<Mutex<String>>,
    exit_status: Option<ExitStatus>,
    pool: Weak<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    /// Pool-local worker id (for logs).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The Unix socket the worker listens on.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    /// Wait up to `grace` for the process to exit on its own.
    pub async fn wait_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                self.exit_status = Some(status);
            }
        }
        self.exit_status
    }

    /// Stderr captured so far, waiting up to `grace` for the stream to end.
    pub async fn collect_diagnostics(&mut self, grace: Duration) -> String {
        if let Some(task) = self.stderr_task.as_mut() {
            if tokio::time::timeout(grace, task).await.is_ok() {
                self.stderr_task = None;
            }
        }
        lock(&self.diagnostics).clone()
    }

    fn kill_group(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill_group();
        let _ = self.child.start_kill();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.metrics.on_destroy();
        }
        tracing::debug!(worker = self.id, "worker destroyed");
    }
}

/// A bounded pool of single-use worker processes. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    capacity: Arc<Semaphore>,
    idle: Mutex<VecDeque<Worker>>,
    idle_ready: Notify,
    shutting_down: AtomicBool,
    filling: AtomicBool,
    next_id: AtomicU64,
    metrics: PoolMetrics,
}

impl WorkerPool {
    /// Create a pool. No process is spawned until [`pre_warm`](Self::pre_warm)
    /// or the first [`acquire`](Self::acquire).
    pub fn new(config: PoolConfig) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_workers));
        Self {
            inner: Arc::new(PoolInner {
                config,
                capacity,
                idle: Mutex::new(VecDeque::new()),
                idle_ready: Notify::new(),
                shutting_down: AtomicBool::new(false),
                filling: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Pool counters.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Workers spawned and waiting for a script.
    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Acquire a worker whose socket is ready.
    ///
    /// Takes an idle worker if one exists, spawns one if under `max_workers`,
    /// and otherwise waits (up to `acquire_timeout`) for capacity.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<Worker, SandboxError> {
        let timeout = self.inner.config.acquire_timeout;
        match tokio::time::timeout(timeout, self.inner.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::AcquireTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Kill a worker's process group, reap it and remove its socket. Then
    /// top the idle set back up to `min_workers` in the background.
    #[tracing::instrument(skip(self, worker), fields(worker = worker.id))]
    pub async fn destroy(&self, mut worker: Worker) {
        worker.kill_group();
        let _ = worker.child.kill().await;
        drop(worker);
        self.inner.replenish();
    }

    /// Spawn workers until `min_workers` are idle. Returns how many were spawned.
    pub async fn pre_warm(&self) -> usize {
        self.inner.fill_to_min().await
    }

    /// Stop handing out workers and kill every idle one. Busy workers are
    /// killed by their owners as usual.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.capacity.close();
        self.inner.idle_ready.notify_waiters();

        let workers: Vec<Worker> = lock(&self.inner.idle).drain(..).collect();
        for worker in workers {
            self.destroy(worker).await;
        }
    }
}

impl PoolInner {
    async fn acquire(self: &Arc<Self>) -> Result<Worker, SandboxError> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(SandboxError::PoolShutdown);
            }

            let notified = self.idle_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = lock(&self.idle).pop_front();
            if let Some(mut worker) = idle {
                if worker.is_alive() {
                    tracing::debug!(worker = worker.id, "acquired idle worker");
                    return Ok(worker);
                }
                tracing::warn!(worker = worker.id, "idle worker exited; discarding");
                drop(worker);
                continue;
            }

            tokio::select! {
                permit = self.capacity.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| SandboxError::PoolShutdown)?;
                    return self.spawn_worker(permit).await;
                }
                _ = &mut notified => continue,
            }
        }
    }

    fn push_idle(&self, worker: Worker) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        lock(&self.idle).push_back(worker);
        self.idle_ready.notify_one();
    }

    fn replenish(self: &Arc<Self>) {
        if self.config.min_workers == 0 || self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.fill_to_min().await;
        });
    }

    async fn fill_to_min(self: &Arc<Self>) -> usize {
        if self.filling.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut spawned = 0;
        while !self.shutting_down.load(Ordering::SeqCst)
            && lock(&self.idle).len() < self.config.min_workers
        {
            let Ok(permit) = self.capacity.clone().try_acquire_owned() else {
                break;
            };
            match self.spawn_worker(permit).await {
                Ok(worker) => {
                    self.push_idle(worker);
                    spawned += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to pre-warm worker");
                    break;
                }
            }
        }
        self.filling.store(false, Ordering::SeqCst);
        spawned
    }

    #[tracing::instrument(skip(self, permit))]
    async fn spawn_worker(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<Worker, SandboxError> {
        let config = &self.config;
        let worker_bin = match &config.worker_bin {
            Some(path) => path.clone(),
            None => find_worker_binary()?,
        };

        let mut cmd = match config.limiter.as_deref() {
            Some([limiter, limiter_args @ ..]) => {
                // The environment is cleared below, so PATH lookup is unavailable.
                if !Path::new(limiter).is_absolute() {
                    return Err(SandboxError::Spawn(format!(
                        "limiter must be an absolute path, got '{limiter}'"
                    )));
                }
                let mut cmd = Command::new(limiter);
                cmd.args(limiter_args).arg(&worker_bin);
                cmd
            }
            _ => Command::new(&worker_bin),
        };
        cmd.arg("--socket-dir")
            .arg(&config.socket_dir)
            .arg("--heap-mib")
            .arg(config.heap_mib.to_string())
            .arg("--max-output-size")
            .arg(config.max_output_size.to_string())
            .arg("--max-message-size")
            .arg(config.max_message_size.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .kill_on_drop(true);
        apply_process_limits(&mut cmd, config.cpu_time_secs, config.nice);

        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Spawn(format!("{}: {e}", worker_bin.display()))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let diagnostics = Arc::new(Mutex::new(String::new()));
        let stderr_task = stderr.map(|s| tokio::spawn(capture_stderr(s, diagnostics.clone(), id)));

        self.metrics.on_spawn();
        let mut worker = Worker {
            id,
            pgid: child.id(),
            child,
            socket_path: None,
            _stdout: None,
            stderr_task,
            diagnostics,
            exit_status: None,
            pool: Arc::downgrade(self),
            _permit: permit,
        };

        let mut stdout = BufReader::new(
            stdout.ok_or_else(|| SandboxError::Spawn("worker has no stdout".into()))?,
        );
        let mut line = String::new();
        match tokio::time::timeout(config.spawn_timeout, stdout.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => {
                let diagnostics = worker.collect_diagnostics(Duration::from_millis(200)).await;
                return Err(SandboxError::Spawn(format!(
                    "worker exited before announcing its socket: {}",
                    last_line(&diagnostics)
                )));
            }
            Ok(Err(e)) => return Err(SandboxError::Spawn(format!("reading worker stdout: {e}"))),
            Err(_) => {
                return Err(SandboxError::Spawn(format!(
                    "worker did not announce its socket within {}ms",
                    config.spawn_timeout.as_millis()
                )))
            }
        }

        let socket_path = PathBuf::from(line.trim());
        if !socket_path.is_absolute() || !socket_path.starts_with(&config.socket_dir) {
            return Err(SandboxError::Spawn(format!(
                "worker announced a socket outside {}: {}",
                config.socket_dir.display(),
                socket_path.display()
            )));
        }
        worker.socket_path = Some(socket_path);
        worker._stdout = Some(stdout);

        tracing::debug!(worker = id, pid = ?worker.pgid, "worker ready");
        Ok(worker)
    }
}

/// Put the worker in its own process group and apply CPU limits before exec.
#[cfg(unix)]
fn apply_process_limits(cmd: &mut Command, cpu_time_secs: Option<u64>, nice: Option<i32>) {
    // SAFETY: the closure runs in the forked child before exec and only makes
    // async-signal-safe libc calls.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(secs) = cpu_time_secs {
                let cpu = libc::rlimit {
                    rlim_cur: secs as libc::rlim_t,
                    rlim_max: secs as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(nice) = nice {
                if libc::setpriority(libc::PRIO_PROCESS, 0, nice) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_limits(_cmd: &mut Command, _cpu_time_secs: Option<u64>, _nice: Option<i32>) {}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if pgid > 0 {
        // SAFETY: plain syscall; a negative pid addresses the process group.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Log worker stderr and keep its tail for failure classification.
async fn capture_stderr(stderr: ChildStderr, sink: Arc<Mutex<String>>, worker: u64) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "tagbox::sandbox::worker", worker, "{}", line);
        let mut buf = lock(&sink);
        buf.push_str(&line);
        buf.push('\n');
        if buf.len() > DIAGNOSTICS_MAX {
            let mut cut = buf.len() - DIAGNOSTICS_MAX;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }
}

/// Last non-empty line of captured output.
pub(crate) fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("(no diagnostics)")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
