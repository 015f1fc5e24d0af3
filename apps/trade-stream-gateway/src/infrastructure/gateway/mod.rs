//! Downstream Gateway
//!
//! - [`Dispatcher`]: JSON-RPC request handling and event fan-out
//! - [`GatewayServer`]: the `/ws` WebSocket endpoint

pub mod dispatcher;
pub mod server;

pub use dispatcher::Dispatcher;
pub use server::{GatewayServer, GatewayServerError, router, serve};
