//! Host ↔ worker wire protocol.
//!
//! One JSON object per line, `\n`-terminated, over a Unix domain socket. Each
//! object has a single key naming the envelope:
//!
//! ```text
//! {"script":{"code":..,"scope":{..},"options":{"wallTimeMs":..,"memoryMiB":..},"funcs":[..]}}
//! {"funcCall":{"name":..,"uniqueName":..,"args":[..]}}
//! {"funcReturn":{"uniqueName":..,"data":..,"error":..}}
//! {"result":..}
//! {"error":{"name":..,"message":..,"stack":..}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Limits;

/// Default maximum size of one line: 8 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// A protocol message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Envelope {
    /// Host → worker, exactly once: the script to run.
    Script(ScriptPayload),
    /// Worker → host: invoke a declared callback.
    FuncCall {
        /// Callback name.
        name: String,
        /// Correlation id, echoed in the matching `funcReturn`.
        #[serde(rename = "uniqueName")]
        unique_name: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Host → worker: the outcome of a `funcCall`.
    FuncReturn {
        /// Correlation id of the call being answered.
        #[serde(rename = "uniqueName")]
        unique_name: String,
        /// Returned data (`null` on error).
        #[serde(default)]
        data: Value,
        /// Error message when the host operation failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Worker → host, terminal: the script's return value.
    Result(Value),
    /// Worker → host, terminal: the script failed.
    Error {
        /// Error class.
        name: String,
        /// Error message.
        message: String,
        /// Stack trace when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl Envelope {
    /// Wire name of this envelope, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Script(_) => "script",
            Envelope::FuncCall { .. } => "funcCall",
            Envelope::FuncReturn { .. } => "funcReturn",
            Envelope::Result(_) => "result",
            Envelope::Error { .. } => "error",
        }
    }
}

/// Body of the `script` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPayload {
    /// Script source.
    pub code: String,
    /// Globals to inject.
    #[serde(default)]
    pub scope: Map<String, Value>,
    /// Resource ceilings.
    pub options: Limits,
    /// Callback names the worker may relay.
    #[serde(default)]
    pub funcs: Vec<String>,
}

/// Errors reading or writing envelopes.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The underlying socket failed.
    #[error("ipc i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was not a valid envelope.
    #[error("malformed ipc message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The peer closed the connection partway through a line.
    #[error("connection closed mid-message")]
    Truncated,

    /// A line exceeded the size limit.
    #[error("ipc message too large (limit: {limit} bytes)")]
    TooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },
}

/// Write one envelope as a line and flush.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), IpcError> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope. Returns `None` on a clean EOF. Blank lines are skipped.
/// An unterminated final line that does not parse is [`IpcError::Truncated`].
///
/// Not cancel-safe: a partially read line is lost if the future is dropped.
/// Use [`EnvelopeStream`] inside `select!` loops.
pub async fn read_envelope<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Envelope>, IpcError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = (&mut *reader)
            .take(max_size as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        let terminated = line.last() == Some(&b'\n');
        if terminated {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > max_size {
            return Err(IpcError::TooLarge { limit: max_size });
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return match serde_json::from_slice(&line) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(_) if !terminated => Err(IpcError::Truncated),
            Err(e) => Err(e.into()),
        };
    }
}

/// Envelopes read by a background task, for use in `select!` loops.
///
/// The task stops after EOF or the first error (which is delivered), and is
/// aborted when the stream is dropped.
pub struct EnvelopeStream {
    rx: mpsc::Receiver<Result<Envelope, IpcError>>,
    task: JoinHandle<()>,
}

impl EnvelopeStream {
    /// Start reading `reader` in a background task.
    pub fn spawn<R>(mut reader: R, max_size: usize) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                match read_envelope(&mut reader, max_size).await {
                    Ok(Some(envelope)) => {
                        if tx.send(Ok(envelope)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });
        Self { rx, task }
    }

    /// Next envelope, or `None` once the peer closed the connection.
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<Result<Envelope, IpcError>> {
        self.rx.recv().await
    }
}

impl Drop for EnvelopeStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn envelopes_match_wire_shapes() {
        let call = Envelope::FuncCall {
            name: "fetchTag".into(),
            unique_name: "fetchTag-1".into(),
            args: vec![json!("greet")],
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"funcCall": {"name": "fetchTag", "uniqueName": "fetchTag-1", "args": ["greet"]}})
        );

        let ret = Envelope::FuncReturn {
            unique_name: "fetchTag-1".into(),
            data: json!({"content": "hi"}),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&ret).unwrap(),
            json!({"funcReturn": {"uniqueName": "fetchTag-1", "data": {"content": "hi"}}})
        );

        assert_eq!(
            serde_json::to_value(Envelope::Result(json!(2))).unwrap(),
            json!({"result": 2})
        );
    }

    #[test]
    fn parses_script_envelope() {
        let line = r#"{"script":{"code":"return 1","scope":{"args":[]},"options":{"wallTimeMs":500,"memoryMiB":16},"funcs":["reply"]}}"#;
        let envelope: Envelope = serde_json::from_str(line).unwrap();
        match envelope {
            Envelope::Script(payload) => {
                assert_eq!(payload.code, "return 1");
                assert_eq!(payload.options.wall_time_ms, 500);
                assert_eq!(payload.funcs, vec!["reply"]);
            }
            other => panic!("expected script, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_consecutive_lines_then_eof() {
        let mut buf = Vec::new();
        write_envelope(&mut buf, &Envelope::Result(json!("done")))
            .await
            .unwrap();
        buf.extend_from_slice(b"\n");
        write_envelope(
            &mut buf,
            &Envelope::Error {
                name: "TypeError".into(),
                message: "x is not a function".into(),
                stack: None,
            },
        )
        .await
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let first = read_envelope(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(first, Envelope::Result(json!("done")));
        let second = read_envelope(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(second.kind(), "error");
        assert!(read_envelope(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let mut cursor = Cursor::new(b"{not json\n".to_vec());
        let err = read_envelope(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, IpcError::Malformed(_)));
    }

    #[tokio::test]
    async fn unterminated_last_line() {
        let mut cursor = Cursor::new(b"{\"result\":{\"partial".to_vec());
        let err = read_envelope(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, IpcError::Truncated), "{err}");

        let mut cursor = Cursor::new(b"{\"result\":7}".to_vec());
        let envelope = read_envelope(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(envelope, Envelope::Result(json!(7)));
    }

    #[tokio::test]
    async fn unknown_envelope_is_malformed() {
        let mut cursor = Cursor::new(b"{\"reset\":{}}\n".to_vec());
        let err = read_envelope(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, IpcError::Malformed(_)));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let mut buf = Vec::new();
        write_envelope(&mut buf, &Envelope::Result(json!("x".repeat(200))))
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_envelope(&mut cursor, 64).await.unwrap_err();
        assert!(matches!(err, IpcError::TooLarge { limit: 64 }));
    }

    #[tokio::test]
    async fn stream_delivers_error_then_ends() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = EnvelopeStream::spawn(tokio::io::BufReader::new(server), 1024);

        write_envelope(&mut client, &Envelope::Result(json!(1)))
            .await
            .unwrap();
        client.write_all(b"garbage\n").await.unwrap();

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Envelope::Result(json!(1))
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
