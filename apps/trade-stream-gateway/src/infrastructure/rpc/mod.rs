//! JSON-RPC 2.0
//!
//! - [`messages`]: frame types, error codes and trade-stream payloads
//! - [`engine`]: client-side call correlation and notification multicast
//! - [`connection`]: self-healing WebSocket connection for the engine
//! - [`client`]: typed trade-stream client

pub mod client;
pub mod connection;
pub mod engine;
pub mod messages;

pub use client::TradeStreamClient;
pub use connection::WsRpcConnection;
pub use engine::{DEFAULT_RPC_TIMEOUT, NotificationStream, RpcClientError, RpcConnection, RpcEngine};
pub use messages::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcError, SubscriptionParams,
    SubscriptionResult,
};
