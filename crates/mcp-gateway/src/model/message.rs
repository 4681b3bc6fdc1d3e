//! The two interchangeable wire message shapes and the translation between
//! them and the canonical upstream payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageShape {
    JsonRpc,
    Standard,
}

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// The gateway's standard tool-invocation shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StandardMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A wire message in exactly one of the two shapes.
///
/// The shapes never merge: forwarding emits only the fields belonging to the
/// detected shape, omitting absent optional fields rather than emitting null
/// placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    JsonRpc(JsonRpcMessage),
    Standard(StandardMessage),
}

impl GatewayMessage {
    /// A message carrying a non-null `method` is JSON-RPC, anything else is
    /// the standard shape.
    pub fn detect(value: &Value) -> MessageShape {
        match value.get("method") {
            Some(method) if !method.is_null() => MessageShape::JsonRpc,
            _ => MessageShape::Standard,
        }
    }

    pub fn parse(value: Value) -> Result<Self, serde_json::Error> {
        match Self::detect(&value) {
            MessageShape::JsonRpc => serde_json::from_value(value).map(GatewayMessage::JsonRpc),
            MessageShape::Standard => serde_json::from_value(value).map(GatewayMessage::Standard),
        }
    }

    pub fn shape(&self) -> MessageShape {
        match self {
            GatewayMessage::JsonRpc(_) => MessageShape::JsonRpc,
            GatewayMessage::Standard(_) => MessageShape::Standard,
        }
    }

    /// Canonical upstream payload: only the detected shape's non-null fields.
    pub fn to_upstream(&self) -> Value {
        let mut object = Map::new();
        match self {
            GatewayMessage::JsonRpc(message) => {
                object.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
                object.insert("method".into(), Value::String(message.method.clone()));
                if let Some(params) = &message.params {
                    object.insert("params".into(), params.clone());
                }
                if let Some(id) = &message.id {
                    object.insert("id".into(), id.clone());
                }
            }
            GatewayMessage::Standard(message) => {
                if let Some(kind) = &message.kind {
                    object.insert("type".into(), Value::String(kind.clone()));
                }
                if let Some(tool) = &message.tool {
                    object.insert("tool".into(), Value::String(tool.clone()));
                }
                if let Some(arguments) = &message.arguments {
                    object.insert("arguments".into(), arguments.clone());
                }
                if let Some(data) = &message.data {
                    object.insert("data".into(), data.clone());
                }
            }
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn detects_json_rpc_by_method() {
        assert_eq!(
            GatewayMessage::detect(&json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1})),
            MessageShape::JsonRpc
        );
        assert_eq!(
            GatewayMessage::detect(&json!({"tool": "search", "arguments": {"q": "x"}})),
            MessageShape::Standard
        );
        assert_eq!(
            GatewayMessage::detect(&json!({"method": null, "tool": "search"})),
            MessageShape::Standard
        );
    }

    #[test]
    fn round_trip_preserves_shape() {
        for value in [
            json!({"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "t"}, "id": "7"}),
            json!({"method": "ping"}),
            json!({"type": "invoke", "tool": "search", "arguments": {"q": "x"}}),
            json!({"data": {"k": "v"}}),
        ] {
            let shape = GatewayMessage::detect(&value);
            let message = GatewayMessage::parse(value).unwrap();
            let upstream = message.to_upstream();
            assert_eq!(GatewayMessage::detect(&upstream), shape);
        }
    }

    #[test]
    fn json_rpc_omits_absent_fields() {
        let message = GatewayMessage::parse(json!({"method": "notifications/progress"})).unwrap();
        let upstream = message.to_upstream();
        assert_eq!(upstream, json!({"jsonrpc": "2.0", "method": "notifications/progress"}));
        assert!(upstream.get("params").is_none());
        assert!(upstream.get("id").is_none());
    }

    #[test]
    fn standard_emits_only_non_null_subset() {
        let message =
            GatewayMessage::parse(json!({"tool": "search", "type": null, "data": null})).unwrap();
        assert_eq!(message.to_upstream(), json!({"tool": "search"}));
    }

    #[test]
    fn shapes_never_merge() {
        // A JSON-RPC message carrying stray standard fields forwards only the
        // JSON-RPC subset.
        let message =
            GatewayMessage::parse(json!({"method": "tools/list", "tool": "ignored", "id": 3}))
                .unwrap();
        let upstream = message.to_upstream();
        assert_eq!(upstream, json!({"jsonrpc": "2.0", "method": "tools/list", "id": 3}));
    }

    #[test]
    fn normalizes_jsonrpc_version() {
        let message = GatewayMessage::parse(json!({"method": "ping"})).unwrap();
        assert_eq!(
            message.to_upstream().get("jsonrpc"),
            Some(&json!(JSONRPC_VERSION))
        );
    }
}
