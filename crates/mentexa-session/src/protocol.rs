//! Wire shapes of the session channel.
//!
//! Every message is a JSON object with a `type` discriminator. Outbound:
//! `audio_chunk`, `finalize_turn`, `video_frame`. Inbound: `emotion_update`,
//! `transcript`, `chat_token`, `chat_end`.

use crate::error::SessionResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Messages the client sends to the conversational service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    AudioChunk {
        /// Base64 WAV payload.
        data: String,
        is_recording_turn: bool,
    },
    FinalizeTurn,
    VideoFrame {
        /// `data:image/jpeg;base64,...`
        data: String,
    },
}

impl OutboundMessage {
    pub fn to_json(&self) -> SessionResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the conversational service sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    EmotionUpdate {
        modality: String,
        emotion: String,
        confidence: f64,
    },
    Transcript {
        text: String,
    },
    ChatToken {
        text: String,
    },
    ChatEnd,
}

impl InboundMessage {
    /// Decode one text frame. Unknown `type` values are errors, never panics.
    pub fn from_json(text: &str) -> SessionResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Which sensor an emotion reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Visual,
    Audio,
}

impl Modality {
    /// `"facial"` is the camera; every other label is treated as voice.
    pub fn from_wire(label: &str) -> Self {
        if label == "facial" {
            Modality::Visual
        } else {
            Modality::Audio
        }
    }
}

/// Latest emotion estimate for one modality.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub label: String,
    /// 0–100.
    pub confidence: f32,
}

impl Reading {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 100.0) as f32
        } else {
            0.0
        };
        Self {
            label: label.into(),
            confidence,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Halves round away from zero.
        write!(f, "{} ({:.0}%)", self.label, self.confidence.round())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Audio,
    Video,
}

/// One encoded chunk on its way to the channel. Built, sent, dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEnvelope {
    pub kind: ChunkKind,
    pub payload: String,
    /// Audio only: whether the chunk belongs to the open turn.
    pub turn_flag: bool,
}

impl ChunkEnvelope {
    pub fn audio(payload: String, turn_flag: bool) -> Self {
        Self {
            kind: ChunkKind::Audio,
            payload,
            turn_flag,
        }
    }

    pub fn video(payload: String) -> Self {
        Self {
            kind: ChunkKind::Video,
            payload,
            turn_flag: false,
        }
    }

    pub fn into_message(self) -> OutboundMessage {
        match self.kind {
            ChunkKind::Audio => OutboundMessage::AudioChunk {
                data: self.payload,
                is_recording_turn: self.turn_flag,
            },
            ChunkKind::Video => OutboundMessage::VideoFrame { data: self.payload },
        }
    }
}
