#![warn(missing_docs)]

//! tagbox: run tag scripts from the command line.

mod local_bridge;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tag_config::TagConfig;
use tag_runner::{render, Backend, ExecutionContext, RunnerConfig, ScriptRunner};
use tag_sandbox::audit::TracingAuditLogger;
use tracing_subscriber::EnvFilter;

use crate::local_bridge::LocalBridge;

/// Config file looked for in the working directory.
const DEFAULT_CONFIG_FILE: &str = "tagbox.toml";

#[derive(Debug, Parser)]
#[command(name = "tagbox", version, about = "Run user-authored tag scripts in a sandbox")]
struct Cli {
    /// Config file (defaults to ./tagbox.toml when present).
    #[arg(long, global = true, env = "TAGBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a script file.
    Run {
        /// Script to run.
        file: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Run a tag from the config's `[tags]` table.
    Tag {
        /// Tag name.
        name: String,
        #[command(flatten)]
        target: Target,
    },
    /// Print the effective configuration and exit.
    CheckConfig,
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Execution backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Isolate)]
    backend: BackendKind,

    /// Remote service language id (required with `--backend remote`).
    #[arg(long)]
    language_id: Option<u32>,

    /// Triggering message as JSON, exposed to the script as `msg`.
    #[arg(long)]
    message: Option<String>,

    /// Script arguments, exposed as `args`.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Isolate,
    Worker,
    Remote,
}

impl Target {
    fn backend(&self) -> Result<Backend> {
        match (self.backend, self.language_id) {
            (BackendKind::Isolate, _) => Ok(Backend::Isolate),
            (BackendKind::Worker, _) => Ok(Backend::WorkerPool),
            (BackendKind::Remote, Some(language_id)) => Ok(Backend::Remote { language_id }),
            (BackendKind::Remote, None) => bail!("--backend remote needs --language-id"),
        }
    }

    fn context(&self, invocation: &str) -> Result<ExecutionContext> {
        let message = match &self.message {
            Some(raw) => serde_json::from_str(raw).context("--message is not valid JSON")?,
            None => local_message(invocation, &self.args),
        };
        Ok(ExecutionContext {
            message: Some(message),
            args: self.args.clone(),
            ..Default::default()
        })
    }
}

/// Stand-in for the chat message that would have triggered the tag.
fn local_message(invocation: &str, args: &[String]) -> Value {
    let mut content = invocation.to_string();
    for arg in args {
        content.push(' ');
        content.push_str(arg);
    }
    json!({
        "content": content,
        "author": { "id": "0", "name": "local" },
        "channel": { "id": "0", "name": "terminal" },
    })
}

/// Locate the configuration file.
///
/// An explicit path (flag or `TAGBOX_CONFIG`) must exist; otherwise
/// `./tagbox.toml` is used when present.
fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd.exists() {
        return Ok(Some(cwd));
    }

    Ok(None)
}

fn load_config(explicit: Option<&Path>) -> Result<TagConfig> {
    match find_config_file(explicit)? {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            TagConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(TagConfig::default())
        }
    }
}

/// Run `code` and print its rendered outcome. Returns whether it succeeded.
async fn execute(config: &TagConfig, code: &str, invocation: &str, target: &Target) -> Result<bool> {
    let backend = target.backend()?;
    let context = target.context(invocation)?;

    let runner_config = RunnerConfig::from_tag_config(config);
    let runner = ScriptRunner::with_audit_logger(runner_config, Arc::new(TracingAuditLogger))?;
    let bridge = Arc::new(LocalBridge::new(config.tags.clone()));

    let outcome = runner.run_script(code, &context, backend, bridge).await;
    if let Some(pool) = runner.worker_pool() {
        pool.shutdown().await;
    }
    let result = outcome?;

    println!("{}", render(&result));
    Ok(result.is_success())
}

fn describe(config: &TagConfig) -> Value {
    let runner = RunnerConfig::from_tag_config(config);
    let mut tags: Vec<&String> = config.tags.keys().collect();
    tags.sort();
    json!({
        "limits": {
            "wall_time_ms": runner.limits.wall_time_ms,
            "memory_mib": runner.limits.memory_mib,
        },
        "max_concurrent": runner.sandbox.max_concurrent,
        "callbacks": runner.callbacks,
        "pool": runner.pool.as_ref().map(|pool| json!({
            "min_workers": pool.min_workers,
            "max_workers": pool.max_workers,
            "socket_dir": pool.socket_dir,
            "heap_mib": pool.heap_mib,
            "cpu_time_secs": pool.cpu_time_secs,
            "nice": pool.nice,
            "limiter": pool.limiter,
        })),
        "remote": runner.remote.as_ref().map(|remote| json!({
            "url": remote.base_url,
            "auth": remote.auth_token.is_some(),
            "poll_interval_ms": remote.poll_interval.as_millis() as u64,
        })),
        "tags": tags,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    let succeeded = match &cli.command {
        Command::Run { file, target } => {
            let code = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            execute(&config, &code, &file.display().to_string(), target).await?
        }
        Command::Tag { name, target } => {
            let code = config
                .tags
                .get(name)
                .ok_or_else(|| anyhow!("no tag named `{name}` in the config"))?
                .clone();
            execute(&config, &code, &format!("!{name}"), target).await?
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&describe(&config))?);
            true
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
