//! JSON-RPC 2.0 Messages
//!
//! Frame types shared by the gateway dispatcher and the client-side engine,
//! the standard error codes, and the payloads of the trade-stream methods
//! and notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::{Channel, EventKind, Instrument};

/// Protocol version tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Notification carrying one trade.
pub const TRADES_UPDATE: &str = "trades.update";
/// Notification raised when the upstream feed drops.
pub const CONNECTION_LOST: &str = "connection.lost";
/// Notification raised once the upstream feed is back.
pub const CONNECTION_RESTORED: &str = "connection.restored";

/// Subscribe call.
pub const METHOD_SUBSCRIBE: &str = "subscribe";
/// Unsubscribe call.
pub const METHOD_UNSUBSCRIBE: &str = "unsubscribe";

// =============================================================================
// Errors
// =============================================================================

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error while handling the call.
    pub const INTERNAL_ERROR: i64 = -32603;

    fn new(code: i64, message: &str, details: Option<String>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data: details.map(Value::String),
        }
    }

    /// -32700.
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error", None)
    }

    /// -32600.
    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(Self::INVALID_REQUEST, "Invalid Request", None)
    }

    /// -32601.
    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "Method not found", None)
    }

    /// -32602 with details in `data`.
    #[must_use]
    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, "Invalid params", Some(details.into()))
    }

    /// -32603 with details in `data`.
    #[must_use]
    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, "Internal error", Some(details.into()))
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Version tag.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Call id, echoed in the response.
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    /// Build a request frame.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Version tag matches and a method is present.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION && !self.method.is_empty()
    }
}

/// Response frame. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Version tag.
    pub jsonrpc: String,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Id of the answered request; null if it could not be read.
    pub id: Value,
}

impl JsonRpcResponse {
    /// Successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Error response.
    #[must_use]
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Notification frame (no id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Version tag.
    pub jsonrpc: String,
    /// Notification name.
    pub method: String,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a notification frame.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Inbound frame as seen by a calling client.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Answer to a call, keyed by the id in string form.
    Response {
        /// Normalized call id.
        id: String,
        /// `result` or `error`.
        outcome: Result<Value, RpcError>,
    },
    /// Unsolicited message.
    Notification(JsonRpcNotification),
}

impl WireMessage {
    /// Classify a raw frame. `None` for invalid JSON or frames that are
    /// neither a response nor a notification.
    ///
    /// A response whose `error` member is not a valid error object still
    /// resolves its call, as an internal error carrying the raw member.
    #[must_use]
    pub fn decode(text: &str) -> Option<Self> {
        let Value::Object(mut object) = serde_json::from_str::<Value>(text).ok()? else {
            return None;
        };

        let id = object.remove("id").filter(|id| !id.is_null());
        let method = match object.remove("method") {
            Some(Value::String(method)) => Some(method),
            _ => None,
        };

        match (id, method) {
            (Some(id), None) => {
                let id = match id {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let outcome = match object.remove("error").filter(|e| !e.is_null()) {
                    Some(error) => Err(RpcError::deserialize(&error).unwrap_or_else(|e| {
                        RpcError::internal_error(format!("malformed error object {error}: {e}"))
                    })),
                    None => Ok(object.remove("result").unwrap_or(Value::Null)),
                };
                Some(Self::Response { id, outcome })
            }
            (None, Some(method)) => Some(Self::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params: object.remove("params"),
            })),
            _ => None,
        }
    }
}

// =============================================================================
// Trade Stream Payloads
// =============================================================================

/// Params of `subscribe` / `unsubscribe` as they arrive. Fields stay raw
/// strings so validation can report exactly what was wrong.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Channel name; only `trades` is served.
    #[serde(default)]
    pub channel: Option<String>,
    /// Instrument wire symbol.
    #[serde(default)]
    pub symbol: Option<String>,
}

impl SubscriptionParams {
    /// Params for the trades channel of `instrument`.
    #[must_use]
    pub fn trades(instrument: Instrument) -> Self {
        Self {
            channel: Some(Channel::Trades.as_str().to_string()),
            symbol: Some(instrument.as_str().to_string()),
        }
    }
}

/// Result of a successful `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResult {
    /// Always `trades`.
    pub channel: Channel,
    /// The instrument.
    #[serde(rename = "symbol")]
    pub instrument: Instrument,
    /// `subscribed` or `unsubscribed`.
    pub event: EventKind,
}

/// Params of `connection.lost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLostParams {
    /// Human-readable cause.
    pub reason: String,
}

/// Params of `connection.restored`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRestoredParams {
    /// Hint for clients; always `resubscribe`.
    pub action: String,
}
