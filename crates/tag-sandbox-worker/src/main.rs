//! tagbox sandbox worker: a single-use process that runs one script.
//!
//! Spawned by [`tag_sandbox::pool::WorkerPool`]. On start it binds a Unix
//! socket, prints the socket path on stdout and waits for the host to
//! connect. It then reads one `script` envelope, runs it in a fresh V8
//! isolate, relays bridge calls to the host as `funcCall`s and sends exactly
//! one terminal message before exiting.
//!
//! **Security**: runs with a clean environment, its own process group and CPU
//! rlimits applied by the pool. Nothing but the socket reaches the host.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tag_error::BridgeError;
use tag_sandbox::executor::{run_isolated, SandboxConfig, DEFAULT_MAX_OUTPUT_SIZE};
use tag_sandbox::ipc::{write_envelope, Envelope, EnvelopeStream, DEFAULT_MAX_MESSAGE_SIZE};
use tag_sandbox::pending::PendingCalls;
use tag_sandbox::{ExecutionRequest, ExecutionResult, HostBridge};
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

#[derive(Parser, Debug)]
#[command(name = "tagbox-worker", about = "Single-use tagbox script worker")]
struct Args {
    /// Directory to create the listening socket in.
    #[arg(long)]
    socket_dir: PathBuf,

    /// Old-generation heap ceiling for the V8 runtime, in MiB.
    #[arg(long, default_value_t = 64)]
    heap_mib: usize,

    /// Maximum size of one protocol line in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Maximum size of the serialized script result in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_SIZE)]
    max_output_size: usize,
}

impl Args {
    fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            max_output_size: self.max_output_size,
            max_message_size: self.max_message_size,
            ..SandboxConfig::default()
        }
    }
}

/// What a relayed call resolves to: data, or the host's error message.
type Returned = Result<Value, String>;

/// Host bridge that relays every operation to the host process.
///
/// Each call gets a fresh `uniqueName` from the pending table, so concurrent
/// calls to the same operation cannot collide.
struct IpcBridge {
    pending: Arc<PendingCalls<Returned>>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl IpcBridge {
    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let (unique_name, rx) = self.pending.register(name);
        let call = Envelope::FuncCall {
            name: name.to_string(),
            unique_name: unique_name.clone(),
            args,
        };
        if self.outbound.send(call).is_err() {
            self.pending.forget(&unique_name);
            return Err(anyhow::anyhow!("host connection closed").into());
        }
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => Err(BridgeError::Relayed(message)),
            Err(_) => Err(anyhow::anyhow!("host connection closed").into()),
        }
    }
}

#[async_trait::async_trait]
impl HostBridge for IpcBridge {
    async fn find_users(&self, query: String) -> Result<Value, BridgeError> {
        self.call("findUsers", vec![json!(query)]).await
    }

    async fn dump_tags(&self) -> Result<Value, BridgeError> {
        self.call("dumpTags", vec![]).await
    }

    async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
        self.call("fetchTag", vec![json!(name)]).await
    }

    async fn fetch_message(
        &self,
        channel_id: String,
        message_id: String,
    ) -> Result<Value, BridgeError> {
        self.call("fetchMessage", vec![json!(channel_id), json!(message_id)])
            .await
    }

    async fn fetch_messages(&self, channel_id: String, opts: Value) -> Result<Value, BridgeError> {
        self.call("fetchMessages", vec![json!(channel_id), opts]).await
    }

    async fn http_request(&self, config: Value) -> Result<Value, BridgeError> {
        self.call("httpRequest", vec![config]).await
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Clean environment: the pool already clears it, this covers manual runs.
    let env_keys: Vec<String> = std::env::vars_os()
        .filter_map(|(k, _)| k.into_string().ok())
        .collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Minimal logging to stderr (the pool captures and classifies it).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    deno_core::v8_set_flags(vec![
        String::new(),
        format!("--max-old-space-size={}", args.heap_mib),
    ]);

    let socket_path = args.socket_dir.join(format!(
        "tagbox-worker-{}-{}.sock",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    let listener = bind(&socket_path)?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", socket_path.display()).context("announce socket path")?;
        stdout.flush().context("announce socket path")?;
    }

    let (stream, _) = listener.accept().await.context("accept host connection")?;
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);

    let (read_half, mut write_half) = stream.into_split();
    let mut incoming = EnvelopeStream::spawn(BufReader::new(read_half), args.max_message_size);

    let request = match incoming.next().await {
        Some(Ok(Envelope::Script(payload))) => ExecutionRequest {
            code: payload.code,
            scope: payload.scope,
            limits: payload.options,
            callback_names: payload.funcs.into_iter().collect(),
        },
        Some(Ok(other)) => anyhow::bail!("expected script envelope, got `{}`", other.kind()),
        Some(Err(e)) => return Err(e).context("read script envelope"),
        None => anyhow::bail!("host closed the connection before sending a script"),
    };

    let pending = Arc::new(PendingCalls::<Returned>::new());
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let bridge: Arc<dyn HostBridge> = Arc::new(IpcBridge {
        pending: pending.clone(),
        outbound: outbound_tx,
    });

    let mut outcome_rx = spawn_isolate(args.sandbox_config(), request, bridge)?;

    // Multiplex relayed calls going out, their returns coming in, and the
    // script's outcome.
    loop {
        tokio::select! {
            Some(call) = outbound_rx.recv() => {
                write_envelope(&mut write_half, &call)
                    .await
                    .context("write funcCall")?;
            }
            next = incoming.next() => match next {
                Some(Ok(Envelope::FuncReturn { unique_name, data, error })) => {
                    let returned = match error {
                        Some(message) => Err(message),
                        None => Ok(data),
                    };
                    if !pending.resolve(&unique_name, returned) {
                        tracing::warn!(call = %unique_name, "funcReturn for unknown call");
                    }
                }
                Some(Ok(other)) => {
                    tracing::warn!(kind = other.kind(), "unexpected envelope from host");
                }
                Some(Err(e)) => {
                    pending.abandon_all();
                    return Err(e).context("read from host");
                }
                None => {
                    let abandoned = pending.abandon_all();
                    anyhow::bail!("host closed the connection ({abandoned} calls abandoned)");
                }
            },
            outcome = &mut outcome_rx => {
                let outcome = outcome.unwrap_or_else(|_| {
                    ExecutionResult::transport("isolate thread exited without a result")
                });
                write_envelope(&mut write_half, &terminal_envelope(outcome))
                    .await
                    .context("write terminal message")?;
                break;
            }
        }
    }

    Ok(())
}

fn bind(path: &Path) -> Result<UnixListener> {
    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict {}", path.display()))?;
    }
    Ok(listener)
}

/// Run the script on a dedicated thread (V8 isolates are !Send). Bridge
/// futures run on this runtime, which keeps serving the socket meanwhile.
fn spawn_isolate(
    config: SandboxConfig,
    request: ExecutionRequest,
    bridge: Arc<dyn HostBridge>,
) -> Result<oneshot::Receiver<ExecutionResult>> {
    let host = tokio::runtime::Handle::current();
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("tagbox-isolate".into())
        .spawn(move || {
            let outcome = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(run_isolated(&config, &request, bridge, host)),
                Err(e) => ExecutionResult::transport(format!("failed to create runtime: {e}")),
            };
            let _ = tx.send(outcome);
        })
        .context("spawn isolate thread")?;
    Ok(rx)
}

/// The single terminal message for an outcome.
fn terminal_envelope(outcome: ExecutionResult) -> Envelope {
    match outcome {
        ExecutionResult::Value { value } => Envelope::Result(value),
        ExecutionResult::Reply(payload) => Envelope::FuncCall {
            name: "reply".into(),
            unique_name: "reply-final".into(),
            args: vec![payload.content, payload.options],
        },
        ExecutionResult::ScriptError {
            name,
            message,
            stack,
        } => Envelope::Error {
            name,
            message,
            stack,
        },
        ExecutionResult::Timeout => Envelope::Error {
            name: "TimeoutError".into(),
            message: "script exceeded its wall-time limit".into(),
            stack: None,
        },
        ExecutionResult::MemoryLimit => Envelope::Error {
            name: "MemoryLimitError".into(),
            message: "script exceeded its heap limit".into(),
            stack: None,
        },
        ExecutionResult::Transport { detail } => Envelope::Error {
            name: "InternalError".into(),
            message: detail,
            stack: None,
        },
    }
}
