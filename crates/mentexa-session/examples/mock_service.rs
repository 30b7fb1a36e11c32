//! Example: local stand-in for the conversational service.
//!
//! Accepts the Mentexa channel protocol on ws://127.0.0.1:8000/ws, answers every
//! finalized turn with a transcript and a streamed reply, and pushes emotion
//! updates every two seconds.
//!
//!   cargo run -p mentexa-session --example mock_service [-- 127.0.0.1:8000]
//!   cargo run -p mentexa-session --bin mentexa

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const EMOTIONS: [&str; 4] = ["neutral", "happy", "surprised", "calm"];

#[derive(Default)]
struct TurnStats {
    chunks: usize,
    bytes: usize,
    frames: usize,
    turns: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("🧪 Mock service listening on ws://{}/ws", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from {}", peer);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                error!("Connection error: {:#}", e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut stats = TurnStats::default();
    let mut emotions = tokio::time::interval(Duration::from_secs(2));
    let mut tick = 0usize;

    loop {
        tokio::select! {
            _ = emotions.tick() => {
                tick += 1;
                let modality = if tick % 2 == 0 { "facial" } else { "voice" };
                let update = json!({
                    "type": "emotion_update",
                    "modality": modality,
                    "emotion": EMOTIONS[tick % EMOTIONS.len()],
                    "confidence": 55 + (tick * 7) % 40,
                });
                send(&mut ws_sender, update).await?;
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(event) = serde_json::from_str::<Value>(text.as_str()) else {
                        warn!("unparseable message");
                        continue;
                    };
                    match event["type"].as_str().unwrap_or_default() {
                        "audio_chunk" => {
                            if event["is_recording_turn"].as_bool() == Some(true) {
                                stats.chunks += 1;
                                stats.bytes += event["data"].as_str().map(str::len).unwrap_or(0);
                            }
                        }
                        "video_frame" => {
                            stats.frames += 1;
                            debug!("video frame {}", stats.frames);
                        }
                        "finalize_turn" => {
                            stats.turns += 1;
                            info!(
                                "Turn {} finalized: {} chunks, {} bytes",
                                stats.turns, stats.chunks, stats.bytes
                            );
                            reply(&mut ws_sender, &stats).await?;
                            stats.chunks = 0;
                            stats.bytes = 0;
                        }
                        other => warn!("Unknown event type: {}", other),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client disconnected after {} turns", stats.turns);
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!(e).context("WebSocket error")),
            }
        }
    }
}

async fn reply<S>(ws_sender: &mut S, stats: &TurnStats) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let transcript = format!("(turn {}: {} audio chunks)", stats.turns, stats.chunks);
    send(&mut *ws_sender, json!({"type": "transcript", "text": transcript})).await?;

    let answer = format!(
        "I heard about {} kilobytes of audio and saw {} frames so far.",
        stats.bytes / 1024,
        stats.frames
    );
    for word in answer.split_inclusive(' ') {
        send(&mut *ws_sender, json!({"type": "chat_token", "text": word})).await?;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    send(&mut *ws_sender, json!({"type": "chat_end"})).await
}

async fn send<S>(ws_sender: &mut S, value: Value) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    ws_sender
        .send(Message::Text(value.to_string().into()))
        .await
        .context("send failed")
}
