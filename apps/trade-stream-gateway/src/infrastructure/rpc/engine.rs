//! JSON-RPC Protocol Engine
//!
//! Client-side call/response correlation and notification multicast over an
//! [`RpcConnection`].
//!
//! - Each `invoke` gets a fresh call id and a pending slot; the slot is
//!   removed on response, timeout, send failure, or when the caller drops
//!   the future.
//! - Responses for unknown ids and frames that fail to decode are dropped.
//! - Notifications fan out to every live `on_notification` stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use super::messages::{JsonRpcNotification, JsonRpcRequest, RpcError, WireMessage};
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::metrics::{self, ParseSide};

/// Default per-call timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

const NOTIFICATION_CAPACITY: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// Failure of a client-side call or connection operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcClientError {
    /// No response within the engine's timeout.
    #[error("RPC request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Configured window.
        timeout_ms: u128,
    },
    /// The server answered with an error object.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional details.
        data: Option<Value>,
    },
    /// The connection was closed while the call was pending.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The engine was disposed while the call was pending.
    #[error("Client disposed")]
    Disposed,
    /// The frame could not be written.
    #[error("send failed: {0}")]
    Send(String),
    /// The request could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Connecting was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<RpcError> for RpcClientError {
    fn from(error: RpcError) -> Self {
        Self::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

// =============================================================================
// Connection Port
// =============================================================================

/// Message-oriented connection carrying JSON-RPC text frames.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Open the connection.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), RpcClientError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), RpcClientError>;

    /// Write one text frame.
    async fn send(&self, frame: String) -> Result<(), RpcClientError>;

    /// Receiver for inbound text frames from now on.
    fn messages(&self) -> broadcast::Receiver<String>;

    /// Watch connection state transitions.
    fn state(&self) -> watch::Receiver<ConnectionState>;
}

// =============================================================================
// Engine
// =============================================================================

/// Stream of `params` values for one notification method.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

type PendingCall = oneshot::Sender<Result<Value, RpcClientError>>;

struct Shared {
    pending: Mutex<HashMap<String, PendingCall>>,
    notifications: RwLock<Option<broadcast::Sender<JsonRpcNotification>>>,
}

struct Dispatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// JSON-RPC engine for one connection.
pub struct RpcEngine {
    connection: Arc<dyn RpcConnection>,
    shared: Arc<Shared>,
    timeout: Duration,
    next_id: AtomicU64,
    dispatch: Mutex<Option<Dispatch>>,
}

/// Removes a pending slot however the call ends.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
    }
}

impl RpcEngine {
    /// Create an engine and start dispatching inbound frames.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(connection: Arc<dyn RpcConnection>, timeout: Duration) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            notifications: RwLock::new(Some(notifications)),
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            connection.messages(),
            Arc::clone(&shared),
            cancel.clone(),
        ));

        Self {
            connection,
            shared,
            timeout,
            next_id: AtomicU64::new(0),
            dispatch: Mutex::new(Some(Dispatch { cancel, handle })),
        }
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Watch the underlying connection state.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Open the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns the connection's error.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), RpcClientError> {
        self.connection.connect(cancel).await
    }

    /// Stop dispatching, fail every pending call with
    /// [`RpcClientError::ConnectionClosed`], then close the connection.
    ///
    /// # Errors
    ///
    /// Returns the connection's error.
    pub async fn disconnect(&self) -> Result<(), RpcClientError> {
        self.stop_dispatch().await;
        self.fail_pending(|| RpcClientError::ConnectionClosed);
        self.connection.disconnect().await
    }

    /// Call `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`RpcClientError::Rpc`] when the server answers with an error
    /// - [`RpcClientError::Timeout`] when no response arrives in time
    /// - [`RpcClientError::Send`] when the frame cannot be written
    /// - [`RpcClientError::ConnectionClosed`] / [`RpcClientError::Disposed`]
    ///   when the engine is shut down first
    pub async fn invoke(&self, method: &str, params: Option<Value>) -> Result<Value, RpcClientError> {
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let request = JsonRpcRequest::new(method, params, Value::String(id.clone()));
        let frame =
            serde_json::to_string(&request).map_err(|e| RpcClientError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        tracing::debug!(id = %id, method, "Invoking RPC method");
        self.connection.send(frame).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot finalized without an answer
            Ok(Err(_)) => Err(RpcClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!(id = %id, method, "RPC request timed out");
                Err(RpcClientError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.timeout.as_millis(),
                })
            }
        }
    }

    /// Live stream of `params` for notifications named `method`.
    ///
    /// Every call returns an independent view; all of them see every
    /// notification raised after they were created. Ends once the engine
    /// is disposed.
    #[must_use]
    pub fn on_notification(&self, method: &str) -> NotificationStream {
        let Some(rx) = self
            .shared
            .notifications
            .read()
            .as_ref()
            .map(broadcast::Sender::subscribe)
        else {
            return Box::pin(stream::empty());
        };

        let method = method.to_string();
        Box::pin(BroadcastStream::new(rx).filter_map(move |item| {
            future::ready(match item {
                Ok(notification) if notification.method == method => {
                    Some(notification.params.unwrap_or(Value::Null))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, method = %method, "Notification stream lagged");
                    None
                }
            })
        }))
    }

    /// Tear the engine down: stop dispatching, reject every pending call
    /// that still has a caller waiting with [`RpcClientError::Disposed`],
    /// and end all notification streams.
    pub async fn dispose(&self) {
        self.stop_dispatch().await;

        let pending: Vec<PendingCall> = self.shared.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            if !tx.is_closed() {
                let _ = tx.send(Err(RpcClientError::Disposed));
            }
        }

        self.shared.notifications.write().take();
        tracing::debug!("RPC engine disposed");
    }

    async fn stop_dispatch(&self) {
        let dispatch = self.dispatch.lock().take();
        if let Some(dispatch) = dispatch {
            dispatch.cancel.cancel();
            if let Err(e) = dispatch.handle.await {
                tracing::warn!(error = %e, "RPC dispatch task failed");
            }
        }
    }

    fn fail_pending(&self, error: impl Fn() -> RpcClientError) {
        let pending: Vec<PendingCall> = self.shared.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(error()));
        }
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.cancel.cancel();
        }
    }
}

async fn dispatch_loop(
    mut messages: broadcast::Receiver<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = messages.recv() => received,
        };

        match received {
            Ok(text) => shared.dispatch(&text),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "RPC inbound frames lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("RPC dispatch stopped");
}

impl Shared {
    fn dispatch(&self, text: &str) {
        match WireMessage::decode(text) {
            Some(WireMessage::Response { id, outcome }) => {
                let pending = self.pending.lock().remove(&id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(RpcClientError::from));
                    }
                    None => tracing::debug!(id = %id, "Dropping response for unknown call"),
                }
            }
            Some(WireMessage::Notification(notification)) => {
                if let Some(tx) = self.notifications.read().as_ref() {
                    let _ = tx.send(notification);
                }
            }
            None => {
                metrics::record_parse_failure(ParseSide::Downstream);
                tracing::debug!("Dropping undecodable RPC frame");
            }
        }
    }
}

// =============================================================================
// In-memory Connection (tests)
// =============================================================================
