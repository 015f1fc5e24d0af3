//! Frame Transport
//!
//! Text-frame transport abstraction shared by the upstream connector and the
//! client-side RPC connection, plus the single-writer task that serializes
//! every outbound frame for one transport.
//!
//! - [`FrameTransport`]: opens a (sink, stream) pair for a URL
//! - [`WebSocketTransport`]: tokio-tungstenite implementation
//! - [`FrameWriter`]: handle to the task that owns the sink
//! - [`ReconnectingLink`]: a connection that re-opens itself, with
//!   owner hooks through [`LinkHandler`]

use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

mod link;

pub use link::{LinkError, LinkHandler, ReconnectingLink, Reopened};

/// Outbound frame queue depth per writer.
const WRITE_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Frames and Errors
// =============================================================================

/// A frame read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// UTF-8 text payload.
    Text(String),
    /// The peer closed the connection.
    Closed(Option<String>),
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),
    /// The writer is gone.
    #[error("transport closed")]
    Closed,
}

/// Outbound half of an open transport.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of an open transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame, TransportError>> + Send>>;

/// Opens text-frame transports.
#[async_trait]
pub trait FrameTransport: Send + Sync + Debug {
    /// Connect to `url` and split the connection into its two halves.
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport over tokio-tungstenite (ws:// and wss://).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(url, "WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec())
                    .ok()
                    .map(|text| Ok(InboundFrame::Text(text))),
                Ok(Message::Close(frame)) => Some(Ok(InboundFrame::Closed(
                    frame.map(|f| f.reason.as_str().to_owned()),
                ))),
                // tungstenite answers pings itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

// =============================================================================
// Frame Writer
// =============================================================================

enum WriteCommand {
    Send {
        frame: String,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Handle to the task owning a transport's sink.
///
/// All frames for one transport pass through this task, so concurrent
/// senders never interleave and no lock is held across the network write.
/// The task ends after a failed write, a close, or when every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl Debug for WriteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send { frame, .. } => f.debug_struct("Send").field("frame", frame).finish(),
            Self::Close { .. } => f.write_str("Close"),
        }
    }
}

impl FrameWriter {
    /// Spawn the writer task for `sink`.
    #[must_use]
    pub fn spawn(sink: FrameSink) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        tokio::spawn(write_loop(sink, rx));
        Self { tx }
    }

    /// Write one frame, resolving once the sink accepted it.
    ///
    /// # Errors
    ///
    /// Returns the sink error, or [`TransportError::Closed`] if the writer
    /// task has already stopped.
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Send { frame, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Close the sink gracefully and stop the writer task.
    ///
    /// # Errors
    ///
    /// Returns the sink error, or [`TransportError::Closed`] if the writer
    /// task has already stopped.
    pub async fn close(&self) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteCommand::Close { ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Whether the writer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop(mut sink: FrameSink, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Send { frame, ack } => {
                let result = sink.send(frame).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            WriteCommand::Close { ack } => {
                let _ = ack.send(sink.close().await);
                break;
            }
        }
    }
    tracing::trace!("Frame writer stopped");
}

// =============================================================================
// In-memory Transport (tests)
// =============================================================================

#[cfg(test)]
pub(crate) mod memory {
    //! Channel-backed transport handing each opened session to the test.

    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::channel::mpsc as fmpsc;

    use super::*;

    /// Test-side view of one opened transport.
    pub struct MemorySession {
        /// Frames the code under test wrote.
        pub outbound: fmpsc::UnboundedReceiver<String>,
        /// Inject frames; drop to simulate the peer vanishing.
        pub inbound: fmpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
    }

    impl MemorySession {
        /// Next written frame, parsed as JSON.
        pub async fn next_json(&mut self) -> serde_json::Value {
            let text = self.outbound.next().await.expect("outbound frame");
            serde_json::from_str(&text).expect("outbound frame is JSON")
        }

        /// Push a text frame to the reader.
        pub fn push(&self, text: impl Into<String>) {
            self.inbound
                .unbounded_send(Ok(InboundFrame::Text(text.into())))
                .expect("reader alive");
        }
    }

    #[derive(Debug)]
    pub struct MemoryTransport {
        sessions: mpsc::UnboundedSender<MemorySession>,
        failures_left: AtomicU32,
    }

    impl MemoryTransport {
        /// Transport whose first `failures` opens are refused.
        pub fn new(failures: u32) -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
            let (sessions, rx) = mpsc::unbounded_channel();
            (
                Self {
                    sessions,
                    failures_left: AtomicU32::new(failures),
                },
                rx,
            )
        }

        /// Refuse the next `failures` opens.
        pub fn fail_next(&self, failures: u32) {
            self.failures_left.store(failures, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FrameTransport for MemoryTransport {
        async fn open(&self, _url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
            let refused = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect("connection refused".to_string()));
            }

            let (out_tx, out_rx) = fmpsc::unbounded::<String>();
            let (in_tx, in_rx) = fmpsc::unbounded();

            let _ = self.sessions.send(MemorySession {
                outbound: out_rx,
                inbound: in_tx,
            });

            let sink = out_tx.sink_map_err(|e| TransportError::Send(e.to_string()));
            Ok((Box::pin(sink), Box::pin(in_rx)))
        }
    }
}
