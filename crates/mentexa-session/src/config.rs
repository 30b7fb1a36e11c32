//! Session configuration: built-in defaults, an optional `mentexa.toml`, then `MENTEXA_*` env.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | MENTEXA_ENDPOINT | ws://localhost:8000/ws | Conversational service WebSocket endpoint. |
//! | MENTEXA_AUDIO_SLICE_MS | 1000 | Audio slice interval. |
//! | MENTEXA_VIDEO_INTERVAL_MS | 200 | Video sampling interval. |
//! | MENTEXA_VIDEO_ENABLED | true | Sample the camera at all. |
//! | MENTEXA_JPEG_QUALITY | 60 | Quality factor (1–100) of the video stills. |
//! | MENTEXA_MIN_CHUNK_LEN | 100 | Encoded audio payloads at or below this length are dropped. |
//! | MENTEXA_SPEECH_RATE | 1.0 | Synthesis rate. |
//! | MENTEXA_SPEECH_PITCH | 1.0 | Synthesis pitch. |
//! | MENTEXA_GREETING | Welcome to Mentexa. | System message opening the conversation (empty disables). |

use crate::capture::CaptureSettings;
use crate::encoder::FrameSpec;
use crate::error::{SessionError, SessionResult};
use crate::playback::VoiceParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_endpoint() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_audio_slice_ms() -> u64 {
    1000
}

fn default_video_interval_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

fn default_frame_width() -> u32 {
    160
}

fn default_frame_height() -> u32 {
    120
}

fn default_jpeg_quality() -> u8 {
    60
}

fn default_min_chunk_len() -> usize {
    100
}

fn default_speech() -> f32 {
    1.0
}

fn default_greeting() -> Option<String> {
    Some("Welcome to Mentexa.".to_string())
}

/// Everything a session needs to know before it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket endpoint of the conversational service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Microphone audio is sliced into one chunk per interval.
    #[serde(default = "default_audio_slice_ms")]
    pub audio_slice_ms: u64,
    /// Camera is sampled once per interval.
    #[serde(default = "default_video_interval_ms")]
    pub video_interval_ms: u64,
    #[serde(default = "default_true")]
    pub video_enabled: bool,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Minimum encoded (base64) audio payload length worth transmitting.
    #[serde(default = "default_min_chunk_len")]
    pub min_chunk_len: usize,
    #[serde(default = "default_speech")]
    pub speech_rate: f32,
    #[serde(default = "default_speech")]
    pub speech_pitch: f32,
    #[serde(default = "default_greeting")]
    pub greeting: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            audio_slice_ms: default_audio_slice_ms(),
            video_interval_ms: default_video_interval_ms(),
            video_enabled: true,
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
            jpeg_quality: default_jpeg_quality(),
            min_chunk_len: default_min_chunk_len(),
            speech_rate: default_speech(),
            speech_pitch: default_speech(),
            greeting: default_greeting(),
        }
    }
}

impl SessionConfig {
    /// Default path of the optional configuration file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("mentexa.toml")
    }

    /// Load from `path` (or `mentexa.toml` when it exists), then apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> SessionResult<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_path(p)?,
            None => {
                let p = Self::default_path();
                if p.exists() {
                    Self::load_from_path(&p)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys fall back to defaults.
    pub fn load_from_path(path: &Path) -> SessionResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `MENTEXA_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("MENTEXA_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = get("MENTEXA_AUDIO_SLICE_MS").and_then(|v| v.parse().ok()) {
            self.audio_slice_ms = v;
        }
        if let Some(v) = get("MENTEXA_VIDEO_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.video_interval_ms = v;
        }
        if let Some(v) = get("MENTEXA_VIDEO_ENABLED") {
            self.video_enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = get("MENTEXA_JPEG_QUALITY").and_then(|v| v.parse().ok()) {
            self.jpeg_quality = v;
        }
        if let Some(v) = get("MENTEXA_MIN_CHUNK_LEN").and_then(|v| v.parse().ok()) {
            self.min_chunk_len = v;
        }
        if let Some(v) = get("MENTEXA_SPEECH_RATE").and_then(|v| v.parse().ok()) {
            self.speech_rate = v;
        }
        if let Some(v) = get("MENTEXA_SPEECH_PITCH").and_then(|v| v.parse().ok()) {
            self.speech_pitch = v;
        }
        // Present-but-empty disables the greeting.
        if let Some(v) = lookup("MENTEXA_GREETING") {
            let v = v.trim().to_string();
            self.greeting = if v.is_empty() { None } else { Some(v) };
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SessionError::Config("endpoint must not be empty".to_string()));
        }
        if self.audio_slice_ms == 0 || self.video_interval_ms == 0 {
            return Err(SessionError::Config(
                "audio_slice_ms and video_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(SessionError::Config(format!(
                "frame size must be non-zero, got {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(SessionError::Config(format!(
                "jpeg_quality must be 1-100, got {}",
                self.jpeg_quality
            )));
        }
        if !(self.speech_rate > 0.0) || !(self.speech_pitch > 0.0) {
            return Err(SessionError::Config(format!(
                "speech rate and pitch must be positive, got {} / {}",
                self.speech_rate, self.speech_pitch
            )));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            audio_slice: Duration::from_millis(self.audio_slice_ms),
            video_interval: Duration::from_millis(self.video_interval_ms),
            video_enabled: self.video_enabled,
            frame: FrameSpec {
                width: self.frame_width,
                height: self.frame_height,
                quality: self.jpeg_quality,
            },
        }
    }

    pub fn voice(&self) -> VoiceParams {
        VoiceParams {
            rate: self.speech_rate,
            pitch: self.speech_pitch,
        }
    }
}
