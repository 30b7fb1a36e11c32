//! # Mentexa Session - realtime multimodal session controller
//!
//! Streams microphone audio and camera stills to a conversational service
//! over one WebSocket, takes push-to-talk turns, assembles streamed replies
//! and speaks them back, with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Session Controller                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Capture    │→ │   Encoder    │→ │ Turn Machine │→ ws ─┐ │
//! │  │ (cpal/still) │  │ (WAV / JPEG) │  │ (press/flush)│      │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘      │ │
//! │  ┌──────────────┐  ┌──────────────┐                         │ │
//! │  │   Playback   │← │    Reply     │←──── inbound ←──────────┘ │
//! │  │ (rodio sink) │  │  Assembler   │                           │
//! │  └──────────────┘  └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod reply;
pub mod session;
pub mod turn;
pub mod voice_output;

pub use capture::{
    AcquiredDevices, AudioSlice, CaptureDevices, CaptureEvent, CaptureHandle, CapturePipeline,
    CaptureSettings, DeviceGuard, FrameSource, LocalDevices, StillFrameSource, VideoFrame,
};
pub use channel::{ChannelEvent, ChannelMultiplexer, ConnectionState};
pub use config::SessionConfig;
pub use encoder::{encode_audio, encode_frame, FrameSpec};
pub use error::{SessionError, SessionResult};
pub use playback::{
    PlaybackSynchronizer, SpeechSynthesizer, SynthesisEvent, SynthesisSink, Utterance,
    UtteranceId, VoiceParams,
};
pub use protocol::{ChunkEnvelope, ChunkKind, InboundMessage, Modality, OutboundMessage, Reading};
pub use reply::{Conversation, ConversationMessage, FinishedReply, MessageId, Speaker};
pub use session::{
    EmotionReadings, SessionController, SessionEvent, SessionHandle, SessionStatus, SessionView,
    UserCommand,
};
pub use turn::{TurnMachine, TurnOutput, TurnPhase};
pub use voice_output::{create_best_tts, OpenAiTts, SilentTts, SinkSpeech, TtsBackend};
