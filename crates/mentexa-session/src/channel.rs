//! Channel multiplexer: the one WebSocket to the conversational service.
//!
//! Outbound messages are serialized here and handed to a writer task; the
//! connection task reports `Opened`, each inbound text frame, errors and
//! `Closed` into the session queue. Nothing is queued while the link is not
//! open and nothing is retried.

use crate::error::SessionError;
use crate::protocol::{InboundMessage, OutboundMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Lifecycle of the connection, in the order the transport reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    /// One inbound text frame, not yet decoded.
    Message(String),
    /// A [`SessionError::Connection`], rendered.
    Error(String),
    Closed,
}

/// Owns the connection handle. Only the session controller touches it.
#[derive(Debug)]
pub struct ChannelMultiplexer {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    sent: u64,
    dropped: u64,
}

impl Default for ChannelMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMultiplexer {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            outbound: None,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Messages handed to the transport.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Messages discarded because the link was not open.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Open the WebSocket at `url`. Lifecycle arrives on `events` as [`ChannelEvent`]s.
    pub fn connect<E>(&mut self, url: &str, events: mpsc::UnboundedSender<E>)
    where
        E: From<ChannelEvent> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.state = ConnectionState::Connecting;
        info!(target: "mentexa::channel", "Connecting to {}", url);
        tokio::spawn(run_connection(url.to_string(), rx, events));
    }

    /// Use an existing transport: every outbound JSON text goes to `link`.
    /// The owner reports `Opened`/`Closed` itself.
    pub fn attach(&mut self, link: mpsc::UnboundedSender<String>) {
        self.outbound = Some(link);
        self.state = ConnectionState::Connecting;
    }

    pub fn on_opened(&mut self) {
        self.state = ConnectionState::Open;
        info!(target: "mentexa::channel", "🔗 Channel open");
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.outbound = None;
        info!(
            target: "mentexa::channel",
            "Channel closed ({} sent, {} dropped)", self.sent, self.dropped
        );
    }

    /// Send one message if the link is open. Returns whether it was handed off.
    pub fn send(&mut self, message: &OutboundMessage) -> bool {
        if self.state != ConnectionState::Open {
            self.dropped += 1;
            debug!("dropping outbound message: channel {}", self.state.as_str());
            return false;
        }
        let Some(tx) = &self.outbound else {
            self.dropped += 1;
            return false;
        };
        let text = match message.to_json() {
            Ok(t) => t,
            Err(e) => {
                warn!("could not serialize outbound message: {}", e);
                return false;
            }
        };
        if tx.send(text).is_err() {
            self.dropped += 1;
            debug!("dropping outbound message: writer gone");
            return false;
        }
        self.sent += 1;
        true
    }

    /// Decode one inbound frame. Malformed or unknown messages are logged and ignored.
    pub fn demux(&self, text: &str) -> Option<InboundMessage> {
        match InboundMessage::from_json(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(target: "mentexa::channel", "ignoring inbound message: {}", e);
                None
            }
        }
    }

    /// Drop the writer; the connection task sends a close frame and ends.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!("closing channel");
        }
        self.state = ConnectionState::Closed;
    }
}

fn emit<E: From<ChannelEvent>>(events: &mpsc::UnboundedSender<E>, event: ChannelEvent) -> bool {
    events.send(E::from(event)).is_ok()
}

async fn run_connection<E>(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<ChannelEvent> + Send + 'static,
{
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let err = SessionError::from(e);
            error!(target: "mentexa::channel", "WebSocket connect to {} failed: {}", url, err);
            emit(&events, ChannelEvent::Error(err.to_string()));
            emit(&events, ChannelEvent::Closed);
            return;
        }
    };
    info!(target: "mentexa::channel", "WebSocket connection established");
    if !emit(&events, ChannelEvent::Opened) {
        return;
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = ws_tx.send(tungstenite::Message::Text(text.into())).await {
                        let err = SessionError::from(e);
                        warn!("WebSocket send failed: {}", err);
                        emit(&events, ChannelEvent::Error(err.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    if !emit(&events, ChannelEvent::Message(text.as_str().to_owned())) {
                        break;
                    }
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    info!(target: "mentexa::channel", "Server closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = ws_tx.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(other)) => debug!("ignoring non-text frame ({} bytes)", other.len()),
                Some(Err(e)) => {
                    let err = SessionError::from(e);
                    warn!("WebSocket error: {}", err);
                    emit(&events, ChannelEvent::Error(err.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    emit(&events, ChannelEvent::Closed);
}
