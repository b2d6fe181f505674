#![warn(missing_docs)]

//! # tag-runner
//!
//! Caller-facing entry point for running tag scripts.
//!
//! [`ScriptRunner::run_script`] takes the script text, the context of the
//! message that invoked it and a [`Backend`], and resolves with one
//! classified [`ExecutionResult`]. Expected failures (throws, timeouts, heap
//! exhaustion, transport breakage) are results; `Err` is reserved for the
//! runner being unable to start the script at all. [`render`] turns a result
//! into text fit for a chat message.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tag_config::{TagConfig, KNOWN_CALLBACKS};
use tag_remote::{RemoteClient, RemoteConfig, RemoteError, RemoteExecution, Verdict};
use tag_sandbox::audit::{AuditBackend, AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use tag_sandbox::{
    ExecutionRequest, ExecutionResult, HostBridge, IsolateSandbox, Limits, PoolConfig,
    SandboxConfig, SandboxError, WorkerPool, WorkerSandbox,
};
use thiserror::Error;

/// Longest text [`render`] produces (chat messages cap at 2000 characters).
pub const DISPLAY_LIMIT: usize = 1900;

/// Where a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// A fresh V8 isolate inside this process.
    Isolate,
    /// A fresh `tagbox-worker` process from the pool.
    WorkerPool,
    /// The remote execution service, for other languages.
    Remote {
        /// Service language id.
        language_id: u32,
    },
}

impl Backend {
    fn label(self) -> &'static str {
        match self {
            Backend::Isolate => "isolate",
            Backend::WorkerPool => "worker_pool",
            Backend::Remote { .. } => "remote",
        }
    }
}

/// The invocation a script runs for.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// The triggering chat message, exposed as `msg`.
    pub message: Option<Value>,
    /// Words after the tag name, exposed as `args` (and as stdin remotely).
    pub args: Vec<String>,
    /// Further globals.
    pub extra: Map<String, Value>,
}

impl ExecutionContext {
    /// Globals injected into the script.
    pub fn scope(&self) -> Map<String, Value> {
        let mut scope = self.extra.clone();
        if let Some(message) = &self.message {
            scope.insert("msg".into(), message.clone());
        }
        scope.insert(
            "args".into(),
            Value::Array(self.args.iter().cloned().map(Value::String).collect()),
        );
        scope
    }
}

/// Errors that prevent a script from running.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The chosen backend is not configured.
    #[error("backend `{0}` is not configured")]
    BackendUnavailable(&'static str),

    /// The sandbox could not start the script.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The remote service refused the submission.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Everything needed to build a [`ScriptRunner`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Settings shared by both local sandboxes.
    pub sandbox: SandboxConfig,
    /// Per-script ceilings.
    pub limits: Limits,
    /// Bridge operations scripts may call.
    pub callbacks: BTreeSet<String>,
    /// Worker pool; the worker backend is unavailable without one.
    pub pool: Option<PoolConfig>,
    /// Remote service; the remote backend is unavailable without one.
    pub remote: Option<RemoteConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            limits: Limits::default(),
            callbacks: KNOWN_CALLBACKS.iter().map(|s| s.to_string()).collect(),
            pool: Some(PoolConfig::default()),
            remote: None,
        }
    }
}

impl RunnerConfig {
    /// Apply a parsed configuration file on top of the defaults.
    pub fn from_tag_config(config: &TagConfig) -> Self {
        let mut runner = RunnerConfig::default();

        let sandbox = &config.sandbox;
        if let Some(ms) = sandbox.wall_time_ms {
            runner.limits.wall_time_ms = ms;
        }
        if let Some(mib) = sandbox.memory_mib {
            runner.limits.memory_mib = mib;
        }
        if let Some(n) = sandbox.max_concurrent {
            runner.sandbox.max_concurrent = n;
        }
        if let Some(kb) = sandbox.max_code_size_kb {
            runner.sandbox.max_code_size = kb * 1024;
        }
        if let Some(kb) = sandbox.max_output_size_kb {
            runner.sandbox.max_output_size = kb * 1024;
        }
        if let Some(callbacks) = &sandbox.callbacks {
            runner.callbacks = callbacks.iter().cloned().collect();
        }

        let overrides = &config.pool;
        let mut pool = PoolConfig {
            // The process ceiling sits above the per-script isolate ceiling so
            // the isolate's own limit trips first.
            heap_mib: runner.limits.memory_mib * 2,
            ..PoolConfig::default()
        };
        if let Some(n) = overrides.min_workers {
            pool.min_workers = n;
        }
        if let Some(n) = overrides.max_workers {
            pool.max_workers = n;
        }
        if let Some(dir) = &overrides.socket_dir {
            pool.socket_dir = PathBuf::from(dir);
        }
        if let Some(ms) = overrides.spawn_timeout_ms {
            pool.spawn_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.acquire_timeout_ms {
            pool.acquire_timeout = Duration::from_millis(ms);
        }
        if overrides.cpu_time_secs.is_some() {
            pool.cpu_time_secs = overrides.cpu_time_secs;
        }
        if overrides.nice.is_some() {
            pool.nice = overrides.nice;
        }
        pool.limiter = overrides.limiter.clone();
        runner.pool = Some(pool);

        runner.remote = config.remote.as_ref().map(|remote| {
            let mut client = RemoteConfig {
                base_url: remote.url.clone(),
                auth_token: remote.auth_token.clone(),
                wall_time: runner.limits.wall_time(),
                ..RemoteConfig::default()
            };
            if let Some(ms) = remote.poll_interval_ms {
                client.poll_interval = Duration::from_millis(ms);
            }
            if let Some(kb) = remote.memory_limit_kb {
                client.memory_limit_kb = kb;
            }
            client
        });

        runner
    }
}

/// Runs tag scripts on the configured backends.
pub struct ScriptRunner {
    isolate: IsolateSandbox,
    workers: Option<WorkerSandbox>,
    remote: Option<RemoteClient>,
    limits: Limits,
    callbacks: BTreeSet<String>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl ScriptRunner {
    /// Build a runner without audit logging.
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Build a runner whose backends all report to `logger`.
    pub fn with_audit_logger(
        config: RunnerConfig,
        logger: Arc<dyn AuditLogger>,
    ) -> Result<Self, RunnerError> {
        let isolate = IsolateSandbox::with_audit_logger(config.sandbox.clone(), logger.clone());
        let workers = config.pool.map(|mut pool| {
            // Workers enforce the same result and line ceilings as the host.
            pool.max_output_size = config.sandbox.max_output_size;
            pool.max_message_size = config.sandbox.max_message_size;
            WorkerSandbox::with_audit_logger(
                WorkerPool::new(pool),
                config.sandbox.clone(),
                logger.clone(),
            )
        });
        let remote = config.remote.map(RemoteClient::new).transpose()?;
        Ok(Self {
            isolate,
            workers,
            remote,
            limits: config.limits,
            callbacks: config.callbacks,
            audit_logger: logger,
        })
    }

    /// The worker pool, when the worker backend is configured.
    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.workers.as_ref().map(WorkerSandbox::pool)
    }

    /// Run a script and classify its outcome.
    pub async fn run_script(
        &self,
        code: &str,
        context: &ExecutionContext,
        backend: Backend,
        bridge: Arc<dyn HostBridge>,
    ) -> Result<ExecutionResult, RunnerError> {
        tracing::info!(code_len = code.len(), backend = backend.label(), "run: starting");

        let request = ExecutionRequest {
            code: code.to_string(),
            scope: context.scope(),
            limits: self.limits,
            callback_names: self.callbacks.clone(),
        };

        let result = match backend {
            Backend::Isolate => self.isolate.run(request, bridge).await?,
            Backend::WorkerPool => {
                let workers = self
                    .workers
                    .as_ref()
                    .ok_or(RunnerError::BackendUnavailable("worker_pool"))?;
                workers.run(request, bridge).await?
            }
            Backend::Remote { language_id } => {
                self.run_remote(code, language_id, &context.args).await?
            }
        };

        tracing::info!(backend = backend.label(), outcome = result.label(), "run: complete");
        Ok(result)
    }

    async fn run_remote(
        &self,
        code: &str,
        language_id: u32,
        args: &[String],
    ) -> Result<ExecutionResult, RunnerError> {
        let client = self
            .remote
            .as_ref()
            .ok_or(RunnerError::BackendUnavailable("remote"))?;

        let audit = AuditEntryBuilder::new(code, AuditBackend::Remote);
        let stdin = (!args.is_empty()).then(|| args.join(" "));

        let result = match client.execute(code, language_id, stdin.as_deref()).await {
            Ok(execution) => classify_remote(execution),
            Err(RemoteError::PollTimeout { .. }) => ExecutionResult::Timeout,
            Err(e @ RemoteError::Rejected { .. }) => {
                self.audit_logger.log(&audit.finish_host_error(&e)).await;
                return Err(e.into());
            }
            Err(e) => ExecutionResult::transport(e.to_string()),
        };
        self.audit_logger.log(&audit.finish(&result)).await;
        Ok(result)
    }
}

/// Map a finished remote run onto the shared outcome classes.
pub fn classify_remote(execution: RemoteExecution) -> ExecutionResult {
    let RemoteExecution { verdict, output } = execution;
    match verdict {
        Verdict::Accepted | Verdict::WrongAnswer => {
            ExecutionResult::value(Value::String(output.stdout))
        }
        Verdict::TimeLimitExceeded => ExecutionResult::Timeout,
        Verdict::CompilationError => ExecutionResult::ScriptError {
            name: "CompilationError".into(),
            message: output.compile_output.trim_end().to_string(),
            stack: None,
        },
        v if v.is_runtime_error() => {
            let stderr = output.stderr.trim_end();
            ExecutionResult::ScriptError {
                name: "RuntimeError".into(),
                message: if stderr.is_empty() {
                    v.description().to_string()
                } else {
                    stderr.to_string()
                },
                stack: None,
            }
        }
        other => ExecutionResult::transport(format!("remote service: {other}")),
    }
}

/// Text shown in chat for an outcome, trimmed to [`DISPLAY_LIMIT`].
///
/// Transport failures render as a generic message; their detail goes to the
/// log at `error`.
pub fn render(result: &ExecutionResult) -> String {
    let text = match result {
        ExecutionResult::Value { value } => display_value(value),
        ExecutionResult::Reply(payload) => display_value(&payload.content),
        ExecutionResult::ScriptError { name, message, .. } => format!("{name}: {message}"),
        ExecutionResult::Timeout => "Script took too long and was stopped.".to_string(),
        ExecutionResult::MemoryLimit => "Script used too much memory and was stopped.".to_string(),
        ExecutionResult::Transport { detail } => {
            tracing::error!(detail = %detail, "run: transport failure");
            "Something went wrong while running this tag.".to_string()
        }
    };
    trim_for_display(&text)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn trim_for_display(text: &str) -> String {
    if text.chars().count() <= DISPLAY_LIMIT {
        return text.to_string();
    }
    let mut trimmed: String = text.chars().take(DISPLAY_LIMIT - 3).collect();
    trimmed.push_str("...");
    trimmed
}
