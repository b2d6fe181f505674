//! The fixed set of bridge operations and their dispatch table.
//!
//! Scripts see each operation as a global function of the same name. Calls
//! arrive here as `(BridgeOp, Vec<Value>)` (positional JSON arguments),
//! whether they came from an in-process op or over the worker socket.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;
use tag_error::BridgeError;

use crate::HostBridge;

/// A bridge operation callable from sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeOp {
    /// `findUsers(query)`
    FindUsers,
    /// `dumpTags()`
    DumpTags,
    /// `fetchTag(name)`
    FetchTag,
    /// `fetchMessage(channelId, messageId)`
    FetchMessage,
    /// `fetchMessages(channelId, opts)`
    FetchMessages,
    /// `httpRequest(config)`
    HttpRequest,
    /// `reply(text, options)`: ends the script with a reply result.
    Reply,
}

impl BridgeOp {
    /// Every operation, in declaration order.
    pub const ALL: [BridgeOp; 7] = [
        BridgeOp::FindUsers,
        BridgeOp::DumpTags,
        BridgeOp::FetchTag,
        BridgeOp::FetchMessage,
        BridgeOp::FetchMessages,
        BridgeOp::HttpRequest,
        BridgeOp::Reply,
    ];

    /// The script-visible name (also the wire name).
    pub fn name(self) -> &'static str {
        match self {
            BridgeOp::FindUsers => "findUsers",
            BridgeOp::DumpTags => "dumpTags",
            BridgeOp::FetchTag => "fetchTag",
            BridgeOp::FetchMessage => "fetchMessage",
            BridgeOp::FetchMessages => "fetchMessages",
            BridgeOp::HttpRequest => "httpRequest",
            BridgeOp::Reply => "reply",
        }
    }

    /// Look up an operation by its script-visible name.
    pub fn from_name(name: &str) -> Option<BridgeOp> {
        BridgeOp::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Resolve declared callback names into operations.
    ///
    /// Unknown names are dropped with a warning: a script can only ever be
    /// given operations this crate knows how to dispatch.
    pub fn resolve_all<'a>(names: impl IntoIterator<Item = &'a String>) -> BTreeSet<BridgeOp> {
        names
            .into_iter()
            .filter_map(|name| {
                let op = BridgeOp::from_name(name);
                if op.is_none() {
                    tracing::warn!(callback = %name, "ignoring unknown callback name");
                }
                op
            })
            .collect()
    }
}

impl fmt::Display for BridgeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dispatch one bridge call to the host.
///
/// `Reply` is never dispatched: each backend turns it into a terminal result
/// before reaching here, so seeing it is reported as invalid usage.
pub async fn dispatch(
    bridge: &dyn HostBridge,
    op: BridgeOp,
    args: Vec<Value>,
) -> Result<Value, BridgeError> {
    let mut args = Args::new(op, args);
    match op {
        BridgeOp::FindUsers => {
            let query = args.string("query")?;
            bridge.find_users(query).await
        }
        BridgeOp::DumpTags => bridge.dump_tags().await,
        BridgeOp::FetchTag => {
            let name = args.string("name")?;
            bridge.fetch_tag(name).await
        }
        BridgeOp::FetchMessage => {
            let channel_id = args.string("channelId")?;
            let message_id = args.string("messageId")?;
            bridge.fetch_message(channel_id, message_id).await
        }
        BridgeOp::FetchMessages => {
            let channel_id = args.string("channelId")?;
            let opts = args.optional_object("opts")?;
            bridge.fetch_messages(channel_id, opts).await
        }
        BridgeOp::HttpRequest => {
            let config = args.http_config()?;
            bridge.http_request(config).await
        }
        BridgeOp::Reply => Err(BridgeError::invalid_arguments(
            op.name(),
            "reply is handled by the sandbox, not the host",
        )),
    }
}

/// Split `reply(content, options)` arguments.
pub fn reply_payload(args: Vec<Value>) -> crate::ReplyPayload {
    let mut args = args.into_iter();
    crate::ReplyPayload {
        content: args.next().unwrap_or(Value::Null),
        options: args.next().unwrap_or(Value::Null),
    }
}

/// Positional argument reader for one call.
struct Args {
    op: BridgeOp,
    values: std::vec::IntoIter<Value>,
}

impl Args {
    fn new(op: BridgeOp, values: Vec<Value>) -> Self {
        Self {
            op,
            values: values.into_iter(),
        }
    }

    /// A string argument. Numbers are accepted since chat ids are often
    /// passed around as numbers by scripts.
    fn string(&mut self, what: &str) -> Result<String, BridgeError> {
        match self.values.next() {
            Some(Value::String(s)) => Ok(s),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(BridgeError::invalid_arguments(
                self.op.name(),
                format!("`{what}` must be a string, got {}", type_name(&other)),
            )),
            None => Err(BridgeError::invalid_arguments(
                self.op.name(),
                format!("missing `{what}`"),
            )),
        }
    }

    fn optional_object(&mut self, what: &str) -> Result<Value, BridgeError> {
        match self.values.next() {
            None | Some(Value::Null) => Ok(Value::Object(Default::default())),
            Some(v @ Value::Object(_)) => Ok(v),
            Some(other) => Err(BridgeError::invalid_arguments(
                self.op.name(),
                format!("`{what}` must be an object, got {}", type_name(&other)),
            )),
        }
    }

    /// `httpRequest` accepts either a config object with a `url` or a bare URL.
    fn http_config(&mut self) -> Result<Value, BridgeError> {
        match self.values.next() {
            Some(Value::String(url)) => Ok(serde_json::json!({ "url": url })),
            Some(Value::Object(map)) => {
                if !map.get("url").is_some_and(Value::is_string) {
                    return Err(BridgeError::invalid_arguments(
                        self.op.name(),
                        "config needs a string `url`",
                    ));
                }
                Ok(Value::Object(map))
            }
            Some(other) => Err(BridgeError::invalid_arguments(
                self.op.name(),
                format!("config must be an object, got {}", type_name(&other)),
            )),
            None => Err(BridgeError::invalid_arguments(
                self.op.name(),
                "missing `config`",
            )),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct TagsOnly;

    #[async_trait::async_trait]
    impl HostBridge for TagsOnly {
        async fn fetch_tag(&self, name: String) -> Result<Value, BridgeError> {
            Ok(json!({ "name": name, "content": "hello" }))
        }

        async fn fetch_message(
            &self,
            channel_id: String,
            message_id: String,
        ) -> Result<Value, BridgeError> {
            Ok(json!({ "channel": channel_id, "id": message_id }))
        }

        async fn http_request(&self, config: Value) -> Result<Value, BridgeError> {
            Ok(config)
        }
    }

    #[test]
    fn names_round_trip() {
        for op in BridgeOp::ALL {
            assert_eq!(BridgeOp::from_name(op.name()), Some(op));
        }
        assert_eq!(BridgeOp::from_name("eval"), None);
    }

    #[test]
    fn resolve_all_drops_unknown_names() {
        let names = vec![
            "fetchTag".to_string(),
            "rmRf".to_string(),
            "reply".to_string(),
        ];
        let ops = BridgeOp::resolve_all(&names);
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&BridgeOp::FetchTag));
        assert!(ops.contains(&BridgeOp::Reply));
    }

    #[tokio::test]
    async fn dispatch_routes_to_host() {
        let result = dispatch(&TagsOnly, BridgeOp::FetchTag, vec![json!("greet")])
            .await
            .unwrap();
        assert_eq!(result["name"], "greet");
    }

    #[tokio::test]
    async fn dispatch_accepts_numeric_ids() {
        let result = dispatch(
            &TagsOnly,
            BridgeOp::FetchMessage,
            vec![json!(1234), json!("5678")],
        )
        .await
        .unwrap();
        assert_eq!(result, json!({ "channel": "1234", "id": "5678" }));
    }

    #[tokio::test]
    async fn dispatch_rejects_missing_arguments() {
        let err = dispatch(&TagsOnly, BridgeOp::FetchTag, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
        assert!(err.to_string().contains("missing `name`"));
    }

    #[tokio::test]
    async fn dispatch_rejects_wrong_types() {
        let err = dispatch(&TagsOnly, BridgeOp::FetchTag, vec![json!({ "a": 1 })])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("got object"), "{err}");
    }

    #[tokio::test]
    async fn http_request_accepts_bare_url() {
        let result = dispatch(
            &TagsOnly,
            BridgeOp::HttpRequest,
            vec![json!("https://example.com")],
        )
        .await
        .unwrap();
        assert_eq!(result, json!({ "url": "https://example.com" }));
    }

    #[tokio::test]
    async fn http_request_requires_url() {
        let err = dispatch(
            &TagsOnly,
            BridgeOp::HttpRequest,
            vec![json!({ "method": "GET" })],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[tokio::test]
    async fn unimplemented_operations_are_unsupported() {
        let err = dispatch(&TagsOnly, BridgeOp::DumpTags, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
    }

    #[tokio::test]
    async fn reply_is_never_dispatched() {
        let err = dispatch(&TagsOnly, BridgeOp::Reply, vec![json!("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
    }

    #[test]
    fn reply_payload_defaults_to_null() {
        let payload = reply_payload(vec![json!("hi")]);
        assert_eq!(payload.content, json!("hi"));
        assert_eq!(payload.options, Value::Null);
    }
}
