#![warn(missing_docs)]

//! # tag-remote
//!
//! Client for a judge-style remote execution service, used for tags written
//! in languages other than JavaScript.
//!
//! The service is stateless from the client's point of view: a submission
//! returns a token, the token is polled until the verdict is terminal, and
//! the output is fetched once. Code, stdin and output travel base64-encoded.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Header carrying the optional service auth token.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Connection and limit settings for the remote service.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Service base URL, without a trailing slash.
    pub base_url: String,
    /// Sent as [`AUTH_HEADER`] when set.
    pub auth_token: Option<String>,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Wall-time limit requested for each run. Polling gives up after twice this.
    pub wall_time: Duration,
    /// Memory limit requested for each run, in KB.
    pub memory_limit_kb: u64,
    /// Timeout for each individual HTTP request.
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:2358".into(),
            auth_token: None,
            poll_interval: Duration::from_millis(250),
            wall_time: Duration::from_secs(5),
            memory_limit_kb: 128_000,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors talking to the remote service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The service refused the submission (bad language id, bad limits, ...).
    #[error("submission rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// The service's own explanation.
        message: String,
    },

    /// The verdict did not become terminal in time.
    #[error("no verdict after {waited_ms}ms")]
    PollTimeout {
        /// How long polling ran.
        waited_ms: u64,
    },

    /// The HTTP request itself failed.
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with something unreadable.
    #[error("unreadable response: {0}")]
    Decode(String),

    /// The service answered with an unexpected status.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// Handle for a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionToken(String);

impl SubmissionToken {
    /// Wrap a token returned by the service.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submission, by the service's status id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// 1
    InQueue,
    /// 2
    Processing,
    /// 3
    Accepted,
    /// 4
    WrongAnswer,
    /// 5
    TimeLimitExceeded,
    /// 6
    CompilationError,
    /// 7
    RuntimeSigsegv,
    /// 8
    RuntimeSigxfsz,
    /// 9
    RuntimeSigfpe,
    /// 10
    RuntimeSigabrt,
    /// 11
    RuntimeNzec,
    /// 12
    RuntimeOther,
    /// 13, and any id the client does not know.
    InternalError,
    /// 14
    ExecFormatError,
}

impl Verdict {
    /// Map a status id. Unknown ids are [`Verdict::InternalError`].
    pub fn from_id(id: u32) -> Verdict {
        match id {
            1 => Verdict::InQueue,
            2 => Verdict::Processing,
            3 => Verdict::Accepted,
            4 => Verdict::WrongAnswer,
            5 => Verdict::TimeLimitExceeded,
            6 => Verdict::CompilationError,
            7 => Verdict::RuntimeSigsegv,
            8 => Verdict::RuntimeSigxfsz,
            9 => Verdict::RuntimeSigfpe,
            10 => Verdict::RuntimeSigabrt,
            11 => Verdict::RuntimeNzec,
            12 => Verdict::RuntimeOther,
            14 => Verdict::ExecFormatError,
            _ => Verdict::InternalError,
        }
    }

    /// Whether the run is finished.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Verdict::InQueue | Verdict::Processing)
    }

    /// Whether the program crashed at runtime (any signal or non-zero exit).
    pub fn is_runtime_error(self) -> bool {
        matches!(
            self,
            Verdict::RuntimeSigsegv
                | Verdict::RuntimeSigxfsz
                | Verdict::RuntimeSigfpe
                | Verdict::RuntimeSigabrt
                | Verdict::RuntimeNzec
                | Verdict::RuntimeOther
        )
    }

    /// Human-readable description, as the service words it.
    pub fn description(self) -> &'static str {
        match self {
            Verdict::InQueue => "In Queue",
            Verdict::Processing => "Processing",
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::CompilationError => "Compilation Error",
            Verdict::RuntimeSigsegv => "Runtime Error (SIGSEGV)",
            Verdict::RuntimeSigxfsz => "Runtime Error (SIGXFSZ)",
            Verdict::RuntimeSigfpe => "Runtime Error (SIGFPE)",
            Verdict::RuntimeSigabrt => "Runtime Error (SIGABRT)",
            Verdict::RuntimeNzec => "Runtime Error (NZEC)",
            Verdict::RuntimeOther => "Runtime Error (Other)",
            Verdict::InternalError => "Internal Error",
            Verdict::ExecFormatError => "Exec Format Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Decoded output of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Program stdout.
    pub stdout: String,
    /// Program stderr.
    pub stderr: String,
    /// Compiler output, for compiled languages.
    pub compile_output: String,
    /// Process exit code, when the program ran.
    pub exit_code: Option<i32>,
}

/// Verdict plus output of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExecution {
    /// Final verdict.
    pub verdict: Verdict,
    /// Decoded output.
    pub output: RemoteOutput,
}

#[derive(Serialize)]
struct SubmissionBody {
    source_code: String,
    language_id: u32,
    memory_limit: u64,
    wall_time_limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
}

#[derive(Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Deserialize)]
struct StatusBody {
    status_id: u32,
}

#[derive(Deserialize)]
struct OutputBody {
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    exit_code: Option<i32>,
}

/// HTTP client for the remote execution service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    config: RemoteConfig,
}

impl RemoteClient {
    /// Build a client.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// The client configuration.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Submit source code. Does not wait for the run.
    #[tracing::instrument(skip(self, code, stdin), fields(code_len = code.len()))]
    pub async fn submit(
        &self,
        code: &str,
        language_id: u32,
        stdin: Option<&str>,
    ) -> Result<SubmissionToken, RemoteError> {
        let body = SubmissionBody {
            source_code: BASE64.encode(code),
            language_id,
            memory_limit: self.config.memory_limit_kb,
            wall_time_limit: self.config.wall_time.as_secs_f64(),
            stdin: stdin.map(|s| BASE64.encode(s)),
        };

        let response = self
            .request(reqwest::Method::POST, "/submissions")
            .query(&[("base64_encoded", "true"), ("wait", "false")])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            let message = rejection_message(&text);
            tracing::info!(status = status.as_u16(), message = %message, "remote: submission rejected");
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let token: TokenBody = decode(response).await?;
        tracing::debug!(token = %token.token, "remote: submitted");
        Ok(SubmissionToken(token.token))
    }

    /// Poll until the verdict is terminal, for at most twice the wall time.
    #[tracing::instrument(skip(self), fields(token = %token))]
    pub async fn poll_status(&self, token: &SubmissionToken) -> Result<Verdict, RemoteError> {
        let budget = self.config.wall_time * 2;
        let polling = async {
            loop {
                let response = self
                    .request(reqwest::Method::GET, &format!("/submissions/{token}"))
                    .query(&[("base64_encoded", "true"), ("fields", "status_id")])
                    .send()
                    .await?;
                let status: StatusBody = decode(response).await?;
                let verdict = Verdict::from_id(status.status_id);
                if verdict.is_terminal() {
                    return Ok(verdict);
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        match tokio::time::timeout(budget, polling).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::PollTimeout {
                waited_ms: budget.as_millis() as u64,
            }),
        }
    }

    /// Fetch and decode the output of a finished run.
    #[tracing::instrument(skip(self), fields(token = %token))]
    pub async fn fetch_output(&self, token: &SubmissionToken) -> Result<RemoteOutput, RemoteError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/submissions/{token}"))
            .query(&[
                ("base64_encoded", "true"),
                ("fields", "stdout,stderr,compile_output,exit_code"),
            ])
            .send()
            .await?;
        let body: OutputBody = decode(response).await?;
        Ok(RemoteOutput {
            stdout: decode_field("stdout", body.stdout)?,
            stderr: decode_field("stderr", body.stderr)?,
            compile_output: decode_field("compile_output", body.compile_output)?,
            exit_code: body.exit_code,
        })
    }

    /// Submit, wait for the verdict and fetch the output.
    pub async fn execute(
        &self,
        code: &str,
        language_id: u32,
        stdin: Option<&str>,
    ) -> Result<RemoteExecution, RemoteError> {
        let token = self.submit(code, language_id, stdin).await?;
        let verdict = self.poll_status(&token).await?;
        let output = self.fetch_output(&token).await?;
        tracing::info!(language_id, verdict = %verdict, "remote: complete");
        Ok(RemoteExecution { verdict, output })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let builder = self.http.request(method, url);
        match &self.config.auth_token {
            Some(token) => builder.header(AUTH_HEADER, token),
            None => builder,
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(RemoteError::UnexpectedStatus {
            status: status.as_u16(),
            body: truncate(&text, 512),
        });
    }
    serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Decode a base64 output field. The service wraps long values across lines.
fn decode_field(name: &str, value: Option<String>) -> Result<String, RemoteError> {
    let Some(value) = value else {
        return Ok(String::new());
    };
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| RemoteError::Decode(format!("{name}: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Extract the service's explanation from a rejection body.
///
/// Accepts `{"error": ".."}`, `{"message": ".."}` and per-field validation
/// maps such as `{"language_id": ["language with id 99 doesn't exist"]}`.
fn rejection_message(body: &str) -> String {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return truncate(body.trim(), 512);
    };
    for key in ["error", "message"] {
        if let Some(Value::String(message)) = map.get(key) {
            return message.clone();
        }
    }
    let mut parts = Vec::new();
    for (field, value) in &map {
        match value {
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => parts.push(format!("{field}: {s}")),
                        other => parts.push(format!("{field}: {other}")),
                    }
                }
            }
            Value::String(s) => parts.push(format!("{field}: {s}")),
            other => parts.push(format!("{field}: {other}")),
        }
    }
    if parts.is_empty() {
        truncate(body.trim(), 512)
    } else {
        parts.join("; ")
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_ids() {
        assert_eq!(Verdict::from_id(1), Verdict::InQueue);
        assert_eq!(Verdict::from_id(3), Verdict::Accepted);
        assert_eq!(Verdict::from_id(5), Verdict::TimeLimitExceeded);
        assert_eq!(Verdict::from_id(11), Verdict::RuntimeNzec);
        assert_eq!(Verdict::from_id(14), Verdict::ExecFormatError);
        assert_eq!(Verdict::from_id(0), Verdict::InternalError);
        assert_eq!(Verdict::from_id(99), Verdict::InternalError);
    }

    #[test]
    fn only_queue_states_are_pending() {
        let pending: Vec<u32> = (1..=14)
            .filter(|id| !Verdict::from_id(*id).is_terminal())
            .collect();
        assert_eq!(pending, vec![1, 2]);
        assert!(Verdict::RuntimeSigsegv.is_runtime_error());
        assert!(!Verdict::CompilationError.is_runtime_error());
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(
            rejection_message(r#"{"language_id":["language with id 9999 doesn't exist"]}"#),
            "language_id: language with id 9999 doesn't exist"
        );
        assert_eq!(rejection_message(r#"{"error":"wall time too big"}"#), "wall time too big");
        assert_eq!(rejection_message("plain text\n"), "plain text");
    }

    #[test]
    fn output_fields_tolerate_line_wrapping() {
        let wrapped = "aGVsbG8g\nd29ybGQK\n".to_string();
        assert_eq!(decode_field("stdout", Some(wrapped)).unwrap(), "hello world\n");
        assert_eq!(decode_field("stderr", None).unwrap(), "");
        assert!(matches!(
            decode_field("stdout", Some("!!!".into())),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h...");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
