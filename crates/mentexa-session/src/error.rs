//! Error types for the Mentexa session controller

use thiserror::Error;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while running a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Video device error: {0}")]
    VideoDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DefaultStreamConfigError> for SessionError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        SessionError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for SessionError {
    fn from(err: cpal::BuildStreamError) -> Self {
        SessionError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for SessionError {
    fn from(err: cpal::PlayStreamError) -> Self {
        SessionError::AudioStream(err.to_string())
    }
}

impl From<hound::Error> for SessionError {
    fn from(err: hound::Error) -> Self {
        SessionError::Encode(err.to_string())
    }
}

impl From<image::ImageError> for SessionError {
    fn from(err: image::ImageError) -> Self {
        SessionError::Encode(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}
