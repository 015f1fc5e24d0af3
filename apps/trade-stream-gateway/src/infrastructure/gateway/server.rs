//! Gateway WebSocket Server
//!
//! Serves `GET /ws`. Each socket gets a hub registration; a dedicated writer
//! task drains the connection's outbound queue, so responses and fan-out
//! notifications never interleave on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use crate::infrastructure::metrics;

#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

/// Downstream WebSocket server.
pub struct GatewayServer {
    port: u16,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a server for `port`.
    #[must_use]
    pub const fn new(port: u16, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Self {
        Self {
            port,
            dispatcher,
            cancel,
        }
    }

    /// Bind the port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError` if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), GatewayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Gateway server listening");
        serve(listener, self.dispatcher, self.cancel).await
    }
}

/// Serve the gateway on an already bound listener until cancelled.
///
/// # Errors
///
/// Returns `GatewayServerError::ServerFailed` if the server stops with an
/// error.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<(), GatewayServerError> {
    let app = router(dispatcher, cancel.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayServerError::ServerFailed(e.to_string()))?;

    tracing::info!("Gateway server stopped");
    Ok(())
}

/// Router with the `/ws` endpoint.
pub fn router(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ServerState { dispatcher, cancel })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let ServerState { dispatcher, cancel } = state;
    let registration = dispatcher.hub().register();
    let connection = registration.id;
    let outbound = registration.outbound;
    let mut frames = registration.frames;

    metrics::set_downstream_connections(dispatcher.hub().connection_count());
    tracing::info!(connection_id = %connection, "Client connected");

    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                tracing::debug!(connection_id = %connection, error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(connection_id = %connection, "Ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection, error = %e, "Socket read failed");
                break;
            }
        };

        let response = dispatcher.handle_frame(connection, &text).await;
        match serde_json::to_string(&response) {
            Ok(frame) => {
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!(connection_id = %connection, error = %e, "Failed to encode response"),
        }
    }

    dispatcher.connection_closed(connection).await;
    drop(outbound);
    if let Err(e) = writer.await {
        tracing::warn!(connection_id = %connection, error = %e, "Socket writer failed");
    }
}

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
