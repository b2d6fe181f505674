//! Host bridge for local runs: tags from the config file, real HTTP.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tag_error::BridgeError;
use tag_sandbox::HostBridge;

/// Largest response body handed to a script.
const MAX_RESPONSE_BODY: usize = 1024 * 1024;

/// Serves `[tags]` from the config and performs outbound HTTP. User and
/// message lookups are not available outside a chat session.
pub struct LocalBridge {
    tags: HashMap<String, String>,
    http: reqwest::Client,
}

impl LocalBridge {
    pub fn new(tags: HashMap<String, String>) -> Self {
        Self {
            tags,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl HostBridge for LocalBridge {
    async fn dump_tags(&self) -> Result<Value, BridgeError> {
        let mut names: Vec<&String> = self.tags.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| json!({ "name": name, "content": self.tags[name] }))
            .collect())
    }

    async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
        match self.tags.get(&name) {
            Some(content) => Ok(json!({ "name": name, "content": content })),
            None => Err(BridgeError::NotFound(format!("tag `{name}`"))),
        }
    }

    async fn http_request(&self, config: Value) -> Result<Value, BridgeError> {
        let invalid = |reason: String| BridgeError::invalid_arguments("httpRequest", reason);

        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("config needs a string `url`".into()))?;
        let url = reqwest::Url::parse(url).map_err(|e| invalid(format!("bad url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BridgeError::Denied(format!(
                "scheme `{}` is not allowed",
                url.scheme()
            )));
        }

        let method = config.get("method").and_then(Value::as_str).unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid(format!("bad method `{method}`")))?;

        let mut request = self.http.request(method, url);
        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }
        request = match config.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(body)) => request.body(body.clone()),
            Some(other) => request.json(other),
        };

        let mut response = request
            .send()
            .await
            .map_err(|e| BridgeError::Upstream(e.to_string()))?;
        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), json!(v))))
            .collect();

        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BODY as u64)
        {
            return Err(body_too_large());
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BridgeError::Upstream(e.to_string()))?
        {
            if body.len() + chunk.len() > MAX_RESPONSE_BODY {
                return Err(body_too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(json!({
            "status": status,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }
}

fn body_too_large() -> BridgeError {
    BridgeError::Upstream(format!("response body exceeds {MAX_RESPONSE_BODY} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> LocalBridge {
        LocalBridge::new(HashMap::from([
            ("b".to_string(), "second".to_string()),
            ("a".to_string(), "first".to_string()),
        ]))
    }

    #[tokio::test]
    async fn tags_are_served_sorted() {
        let all = bridge().dump_tags().await.unwrap();
        assert_eq!(
            all,
            json!([{ "name": "a", "content": "first" }, { "name": "b", "content": "second" }])
        );
        assert_eq!(bridge().fetch_tag("a".into()).await.unwrap()["content"], "first");
        assert!(matches!(
            bridge().fetch_tag("zzz".into()).await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn http_refuses_other_schemes() {
        let err = bridge()
            .http_request(json!({ "url": "file:///etc/passwd" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Denied(_)), "{err}");

        let err = bridge()
            .http_request(json!({ "url": "not a url" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
    }

    async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_returns_status_headers_and_body() {
        let app = axum::Router::new().route(
            "/echo",
            axum::routing::post(|body: String| async move {
                (axum::http::StatusCode::ACCEPTED, [("x-seen", "yes")], body)
            }),
        );
        let base = serve(app).await;

        let response = bridge()
            .http_request(json!({
                "url": format!("{base}/echo"),
                "method": "post",
                "body": "ping",
            }))
            .await
            .unwrap();
        assert_eq!(response["status"], 202);
        assert_eq!(response["headers"]["x-seen"], "yes");
        assert_eq!(response["body"], "ping");
    }

    #[tokio::test]
    async fn declared_oversized_body_is_refused() {
        let app = axum::Router::new().route(
            "/big",
            axum::routing::get(|| async { "x".repeat(MAX_RESPONSE_BODY + 1) }),
        );
        let base = serve(app).await;

        let err = bridge()
            .http_request(json!({ "url": format!("{base}/big") }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[tokio::test]
    async fn endless_chunked_body_is_cut_off() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
            if socket.write_all(head).await.is_err() {
                return 0;
            }
            let chunk = vec![b'x'; 64 * 1024];
            let mut sent = 0usize;
            loop {
                let size = format!("{:x}\r\n", chunk.len());
                if socket.write_all(size.as_bytes()).await.is_err()
                    || socket.write_all(&chunk).await.is_err()
                    || socket.write_all(b"\r\n").await.is_err()
                {
                    return sent;
                }
                sent += chunk.len();
            }
        });

        let err = bridge()
            .http_request(json!({ "url": format!("http://{addr}/stream") }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");

        // The server stops once the bridge hangs up, well short of unbounded.
        let sent = server.await.unwrap();
        assert!(sent < 64 * MAX_RESPONSE_BODY, "server sent {sent} bytes");
    }

    #[tokio::test]
    async fn lookups_outside_chat_are_unsupported() {
        let err = bridge().find_users("ann".into()).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
    }
}
