//! Client-side streaming transport.
//!
//! Wraps a WebSocket connection behind an explicit lifecycle:
//! `Connecting -> Handshaking -> Open -> Closing -> Closed`. One reader task
//! owns the socket's receive half and enqueues events into an ordered queue;
//! the consumer drains that queue one event at a time, so slow processing
//! never stalls socket reads and events are always observed in arrival order.
//! The queue is unbounded: a consumer that is persistently slower than
//! arrival accumulates backlog.
//!
//! Pings are answered with pongs internally and never surfaced. `Open` and
//! `Closed` are each delivered exactly once; `close` is idempotent and safe
//! to call concurrently from the consumer, the reader task, or a shutdown
//! path.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Handshaking,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Events delivered to the transport consumer, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed; fired exactly once.
    Open,
    /// A text or binary frame payload.
    Message(String),
    /// Read or write failure on a connection that was not already closing.
    Error(String),
    /// Terminal; fired exactly once. Carries the error that caused the close,
    /// or `None` on a clean close.
    Closed(Option<String>),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("WebSocket connect failed: {0}")]
    Connect(#[from] tungstenite::Error),
}

enum WriteCmd {
    Frame(WsMessage),
    Shutdown { send_close_frame: bool },
}

struct Shared {
    state: AtomicU8,
    close_started: AtomicBool,
    write_tx: mpsc::UnboundedSender<WriteCmd>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        self.close_started.load(Ordering::SeqCst)
    }

    /// Start the close sequence. Exactly one caller wins; everyone else
    /// observes the already-closing state and returns immediately.
    fn begin_close(&self, send_close_frame: bool) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Closing);
        }
        let _ = self.write_tx.send(WriteCmd::Shutdown { send_close_frame });
    }
}

/// A streaming connection to the relay server.
pub struct Transport {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Establish the connection and complete the handshake.
    ///
    /// Accepts http(s) URLs for convenience and rewrites them to ws(s), the
    /// scheme the consumer configuration carries for the rest of the API.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let ws_url = ws_url(url)?;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_started: AtomicBool::new(false),
            write_tx,
        });

        shared.set_state(ConnectionState::Handshaking);
        let (stream, _response) = connect_async(ws_url.as_str()).await?;
        shared.set_state(ConnectionState::Open);
        let _ = event_tx.send(TransportEvent::Open);

        let (sink, source) = stream.split();
        tokio::spawn(write_loop(sink, write_rx, shared.clone(), event_tx.clone()));
        tokio::spawn(read_loop(source, shared.clone(), event_tx));

        Ok(Self { shared, events })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Queue a text frame. No-op unless the connection is open.
    pub fn send(&self, text: impl Into<String>) {
        if self.shared.state() != ConnectionState::Open || self.shared.is_closing() {
            return;
        }
        let text: String = text.into();
        let _ = self
            .shared
            .write_tx
            .send(WriteCmd::Frame(WsMessage::text(text)));
    }

    /// Close the connection, optionally emitting a close frame first.
    /// Idempotent; the `Closed` event still arrives exactly once.
    pub fn close(&self, send_close_frame: bool) {
        self.shared.begin_close(send_close_frame);
    }

    /// Next event in arrival order. Returns `None` after `Closed` has been
    /// consumed.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut write_rx: mpsc::UnboundedReceiver<WriteCmd>,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(cmd) = write_rx.recv().await {
        match cmd {
            WriteCmd::Frame(message) => {
                if let Err(e) = sink.send(message).await {
                    // Write errors are fatal for the connection.
                    if !shared.is_closing() {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                    }
                    shared.begin_close(false);
                }
            }
            WriteCmd::Shutdown { send_close_frame } => {
                if send_close_frame {
                    let _ = sink.send(WsMessage::Close(None)).await;
                }
                let _ = sink.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut reason: Option<String> = None;

    loop {
        match source.next().await {
            Some(Ok(message)) => match message {
                WsMessage::Text(text) => {
                    let _ = event_tx.send(TransportEvent::Message(text.as_str().to_string()));
                }
                WsMessage::Binary(bytes) => {
                    let _ = event_tx.send(TransportEvent::Message(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    ));
                }
                WsMessage::Ping(payload) => {
                    // Answered internally, never surfaced.
                    let _ = shared.write_tx.send(WriteCmd::Frame(WsMessage::Pong(payload)));
                }
                WsMessage::Pong(_) => {}
                WsMessage::Close(_) => {
                    // Remote close: shut down locally without echoing an
                    // extra close frame of our own.
                    shared.begin_close(false);
                    break;
                }
                WsMessage::Frame(_) => {}
            },
            Some(Err(e)) => {
                if !shared.is_closing() {
                    reason = Some(e.to_string());
                    let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                }
                break;
            }
            None => {
                if !shared.is_closing() {
                    reason = Some("connection closed by server".to_string());
                }
                break;
            }
        }
    }

    shared.begin_close(false);
    shared.set_state(ConnectionState::Closed);
    // The reader is the only emitter of Closed, so it fires exactly once.
    let _ = event_tx.send(TransportEvent::Closed(reason));
}

fn ws_url(url: &str) -> Result<String, TransportError> {
    if let Some(rest) = url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if let Some(rest) = url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url.to_string())
    } else {
        Err(TransportError::UnsupportedScheme(url.to_string()))
    }
}
