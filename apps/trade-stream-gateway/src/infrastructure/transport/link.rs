//! Reconnecting Link
//!
//! One text-frame connection that re-opens itself after an unexpected close.
//! The upstream connector and the client RPC connection both run on it; what
//! differs between them plugs in through [`LinkHandler`].
//!
//! # Lifecycle
//!
//! `Disconnected → Connecting → Connected`, then `Connected → Reconnecting →
//! Connected` on every unexpected close. Overlapping `connect` calls share
//! one session. `disconnect` ends the link for good, including a connect
//! that is still retrying.
//!
//! After a reconnect the new writer is handed to [`LinkHandler::restore`]
//! before senders can see it, so replayed frames always precede new ones.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FrameStream, FrameTransport, FrameWriter, InboundFrame, TransportError};
use crate::domain::streaming::ConnectionState;
use crate::infrastructure::retry::{BackoffStrategy, RetryError, RetryExecutor};

/// Link failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Cancelled, or disconnected while connecting.
    #[error("link cancelled")]
    Cancelled,
    /// No transport is published.
    #[error("link not connected")]
    NotConnected,
    /// The transport failed the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Owner-specific behaviour of a [`ReconnectingLink`].
#[async_trait]
pub trait LinkHandler: Send + Sync {
    /// An inbound text frame arrived.
    fn on_frame(&self, text: String);

    /// The link moved to `state`.
    fn on_state(&self, _state: ConnectionState) {}

    /// The transport dropped without a deliberate disconnect.
    fn on_lost(&self, _reason: &str) {}

    /// A replacement transport is open but not yet published.
    ///
    /// Replay per-link state through `reopened`. The link publishes the
    /// writer once this returns `Ok`; call [`Reopened::publish`] earlier to
    /// do it while still holding a lock of your own. On `Err` the
    /// replacement is dropped and the link reconnects again.
    async fn restore(&self, _reopened: &Reopened<'_>) -> Result<(), TransportError> {
        Ok(())
    }

    /// The replacement transport is published.
    fn on_restored(&self) {}
}

/// A re-opened transport awaiting [`LinkHandler::restore`].
pub struct Reopened<'a> {
    slot: &'a Mutex<Option<FrameWriter>>,
    writer: FrameWriter,
}

impl Reopened<'_> {
    /// Write one frame on the replacement transport.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.writer.send(frame).await
    }

    /// Make the replacement transport visible to [`ReconnectingLink::send`].
    pub fn publish(&self) {
        *self.slot.lock() = Some(self.writer.clone());
    }
}

enum Lifecycle {
    Idle,
    Connecting(CancellationToken),
    Running(Session),
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Self-healing text-frame connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReconnectingLink {
    shared: Arc<Shared>,
}

struct Shared {
    name: &'static str,
    url: String,
    transport: Arc<dyn FrameTransport>,
    retry: RetryExecutor,
    handler: Arc<dyn LinkHandler>,
    writer: Mutex<Option<FrameWriter>>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes `connect` calls; never taken by `disconnect`.
    connecting: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
}

impl ReconnectingLink {
    /// Create a disconnected link. `name` labels its log lines.
    #[must_use]
    pub fn new(
        name: &'static str,
        url: impl Into<String>,
        transport: Arc<dyn FrameTransport>,
        backoff: Arc<dyn BackoffStrategy>,
        handler: Arc<dyn LinkHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                name,
                url: url.into(),
                transport,
                retry: RetryExecutor::new(backoff),
                handler,
                writer: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
                connecting: tokio::sync::Mutex::new(()),
                state,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the transport, retrying until success or cancellation, and start
    /// the session task. A no-op while a session is running.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Cancelled`] if `cancel` fires or `disconnect` is
    /// called before the transport opens.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        let shared = &self.shared;
        let _serial = shared.connecting.lock().await;

        let token = {
            let mut lifecycle = shared.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Running(_)) {
                tracing::debug!(link = shared.name, "Already connected");
                return Ok(());
            }
            let token = cancel.child_token();
            *lifecycle = Lifecycle::Connecting(token.clone());
            token
        };

        shared.set_state(ConnectionState::Connecting);
        tracing::info!(link = shared.name, url = %shared.url, "Connecting");

        let opened = shared.open(&token).await;

        let mut lifecycle = shared.lifecycle.lock();
        // Anything else means disconnect ran meanwhile
        let ours = matches!(*lifecycle, Lifecycle::Connecting(_));
        match opened {
            Ok((writer, stream)) if ours => {
                *shared.writer.lock() = Some(writer);
                shared.set_state(ConnectionState::Connected);

                let session = Arc::clone(shared);
                let session_token = token.clone();
                let handle = tokio::spawn(async move { session.run(stream, session_token).await });
                *lifecycle = Lifecycle::Running(Session {
                    cancel: token,
                    handle,
                });
                Ok(())
            }
            other => {
                if ours {
                    *lifecycle = Lifecycle::Idle;
                }
                drop(lifecycle);
                shared.set_state(ConnectionState::Disconnected);
                Err(other.err().unwrap_or(LinkError::Cancelled))
            }
        }
    }

    /// Stop the session, close the transport gracefully and wait for the
    /// session task. Cancels a connect that is still retrying.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let taken = std::mem::replace(&mut *shared.lifecycle.lock(), Lifecycle::Idle);

        match taken {
            Lifecycle::Idle => return,
            Lifecycle::Connecting(token) => token.cancel(),
            Lifecycle::Running(session) => {
                session.cancel.cancel();

                let writer = shared.writer.lock().take();
                if let Some(writer) = writer
                    && let Err(e) = writer.close().await
                {
                    tracing::debug!(link = shared.name, error = %e, "Close handshake failed");
                }

                if let Err(e) = session.handle.await {
                    tracing::warn!(link = shared.name, error = %e, "Session task failed");
                }

                // The session may have published a writer while racing the cancel
                shared.writer.lock().take();
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        tracing::info!(link = shared.name, url = %shared.url, "Disconnected");
    }

    /// Write one frame on the published transport.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] while no transport is published,
    /// or the transport error if the write fails.
    pub async fn send(&self, frame: String) -> Result<(), LinkError> {
        let writer = self
            .shared
            .writer
            .lock()
            .clone()
            .ok_or(LinkError::NotConnected)?;
        writer.send(frame).await.map_err(LinkError::from)
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.handler.on_state(state);
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<(FrameWriter, FrameStream), LinkError> {
        let url = self.url.as_str();
        let (sink, stream) = self
            .retry
            .execute(|| self.transport.open(url), cancel)
            .await
            .map_err(|RetryError::Cancelled| LinkError::Cancelled)?;

        tracing::info!(link = self.name, url, "Connected");
        Ok((FrameWriter::spawn(sink), stream))
    }

    async fn run(self: Arc<Self>, mut stream: FrameStream, cancel: CancellationToken) {
        'session: loop {
            let Some(reason) = self.receive(&mut stream, &cancel).await else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }

            tracing::warn!(link = self.name, reason = %reason, "Connection lost, reconnecting");
            self.writer.lock().take();
            self.set_state(ConnectionState::Reconnecting);
            self.handler.on_lost(&reason);

            stream = loop {
                let Ok((writer, next)) = self.open(&cancel).await else {
                    break 'session;
                };

                let reopened = Reopened {
                    slot: &self.writer,
                    writer,
                };
                let restored = tokio::select! {
                    () = cancel.cancelled() => break 'session,
                    restored = self.handler.restore(&reopened) => restored,
                };

                match restored {
                    Ok(()) => {
                        reopened.publish();
                        break next;
                    }
                    Err(e) => {
                        tracing::warn!(link = self.name, error = %e, "Restore failed, reconnecting");
                        self.writer.lock().take();
                    }
                }
            };

            self.set_state(ConnectionState::Connected);
            self.handler.on_restored();
            tracing::info!(link = self.name, "Connection restored");
        }

        tracing::debug!(link = self.name, "Session stopped");
    }

    /// Relay frames until the transport ends. `None` when cancelled.
    async fn receive(&self, stream: &mut FrameStream, cancel: &CancellationToken) -> Option<String> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return None,
                frame = stream.next() => match frame {
                    Some(Ok(InboundFrame::Text(text))) => self.handler.on_frame(text),
                    Some(Ok(InboundFrame::Closed(reason))) => {
                        return Some(reason.unwrap_or_else(|| "closed by peer".to_string()));
                    }
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return Some("stream ended".to_string()),
                },
            }
        }
    }
}
