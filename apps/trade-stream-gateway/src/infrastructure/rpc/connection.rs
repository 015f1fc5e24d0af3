//! WebSocket RPC Connection
//!
//! [`RpcConnection`] over a [`ReconnectingLink`]. After an unexpected close
//! the connection re-opens itself, moving through `connected → reconnecting
//! → connected`. Only `disconnect` (or the connect token being cancelled)
//! ends it for good.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::engine::{RpcClientError, RpcConnection};
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::retry::BackoffStrategy;
use crate::infrastructure::transport::{FrameTransport, LinkError, LinkHandler, ReconnectingLink};

const MESSAGE_CAPACITY: usize = 1024;

/// Self-healing client connection to a gateway endpoint.
#[derive(Clone)]
pub struct WsRpcConnection {
    link: ReconnectingLink,
    messages: broadcast::Sender<String>,
}

/// Relays every inbound frame to the message channel.
struct MessageRelay {
    messages: broadcast::Sender<String>,
}

impl LinkHandler for MessageRelay {
    fn on_frame(&self, text: String) {
        let _ = self.messages.send(text);
    }
}

impl WsRpcConnection {
    /// Create a disconnected connection to `url`.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn FrameTransport>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let relay = Arc::new(MessageRelay {
            messages: messages.clone(),
        });
        Self {
            link: ReconnectingLink::new("gateway", url, transport, backoff, relay),
            messages,
        }
    }

    /// Current state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.link.state()
    }
}

#[async_trait]
impl RpcConnection for WsRpcConnection {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), RpcClientError> {
        self.link.connect(cancel).await.map_err(|e| match e {
            LinkError::Transport(e) => RpcClientError::Send(e.to_string()),
            LinkError::Cancelled | LinkError::NotConnected => RpcClientError::Cancelled,
        })
    }

    async fn disconnect(&self) -> Result<(), RpcClientError> {
        self.link.disconnect().await;
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), RpcClientError> {
        self.link.send(frame).await.map_err(|e| match e {
            LinkError::Transport(e) => RpcClientError::Send(e.to_string()),
            LinkError::Cancelled | LinkError::NotConnected => RpcClientError::ConnectionClosed,
        })
    }

    fn messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state_changes()
    }
}
