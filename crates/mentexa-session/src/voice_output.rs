//! **VoiceOutput**: the speech engine behind the playback synchronizer.
//!
//! A [`TtsBackend`] turns text into audio bytes; [`SinkSpeech`] plays them on a
//! `rodio::Sink` and reports start/end/error. `cancel()` stops the sink at once,
//! which is the barge-in kill-switch.

use crate::error::{SessionError, SessionResult};
use crate::playback::{SpeechSynthesizer, SynthesisEvent, SynthesisSink, Utterance, VoiceParams};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend that turns text into audio bytes (WAV/MP3).
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. Return empty vec to skip playback.
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> SessionResult<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct SilentTts;

impl TtsBackend for SilentTts {
    fn synthesize(&self, _text: &str, _voice: &VoiceParams) -> SessionResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "silent"
    }
}

/// OpenAI-compatible `/audio/speech` backend.
/// Uses `TTS_API_URL` (default https://api.openai.com/v1), `TTS_API_KEY`, `TTS_MODEL`, `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub voice: String,
}

impl OpenAiTts {
    pub fn from_env() -> SessionResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| SessionError::Config("TTS requires TTS_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "shimmer".to_string());
        Ok(Self::new(base_url, api_key, model, voice))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    fn request_body(&self, text: &str, voice: &VoiceParams) -> serde_json::Value {
        // The speech endpoint has no pitch control.
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": voice.rate.clamp(0.25, 4.0),
        })
    }
}

impl TtsBackend for OpenAiTts {
    fn synthesize(&self, text: &str, voice: &VoiceParams) -> SessionResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        // Blocking client is built per call: synthesis runs on a worker thread,
        // never inside the async runtime.
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SessionError::Tts(e.to_string()))?;
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let res = client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, voice))
            .send()
            .map_err(|e| SessionError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(SessionError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| SessionError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// OpenAI-compatible TTS when `TTS_API_KEY` is set, otherwise the silent placeholder.
pub fn create_best_tts() -> Arc<dyn TtsBackend> {
    match OpenAiTts::from_env() {
        Ok(tts) => {
            info!("TTS: [OpenAI-compatible] {} / {}", tts.model, tts.voice);
            Arc::new(tts)
        }
        Err(_) => {
            info!("TTS: [Silent] (set TTS_API_KEY for spoken replies)");
            Arc::new(SilentTts)
        }
    }
}

/// Plays synthesized speech through the default output device.
///
/// The `OutputStream` is not `Send`, so it lives on a keeper thread for as long
/// as this value exists. Each utterance is synthesized and watched on its own
/// worker thread; a generation counter tells workers they were cancelled.
pub struct SinkSpeech {
    sink: Arc<Sink>,
    tts: Arc<dyn TtsBackend>,
    generation: Arc<Mutex<u64>>,
    _keeper: mpsc::Sender<()>,
}

impl SinkSpeech {
    pub fn new(tts: Arc<dyn TtsBackend>) -> SessionResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<SessionResult<Arc<Sink>>>();
        let (keeper_tx, keeper_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("mentexa-audio-out".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SessionError::Playback(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(SessionError::Playback(e.to_string())));
                        return;
                    }
                }
                // Returns once the owning SinkSpeech is dropped.
                let _ = keeper_rx.recv();
                drop(stream);
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|_| SessionError::Playback("audio output thread exited".to_string()))??;
        info!("VoiceOutput: sink ready ({} TTS)", tts.name());

        Ok(Self {
            sink,
            tts,
            generation: Arc::new(Mutex::new(0)),
            _keeper: keeper_tx,
        })
    }
}

impl SpeechSynthesizer for SinkSpeech {
    fn speak(&mut self, utterance: Utterance, events: SynthesisSink) {
        let generation = {
            let mut g = lock(&self.generation);
            *g += 1;
            *g
        };
        let sink = Arc::clone(&self.sink);
        let tts = Arc::clone(&self.tts);
        let current = Arc::clone(&self.generation);

        let spawned = thread::Builder::new()
            .name("mentexa-utterance".to_string())
            .spawn(move || play_utterance(utterance, generation, sink, tts, current, events));
        if let Err(e) = spawned {
            warn!("VoiceOutput: could not start playback worker: {}", e);
        }
    }

    fn cancel(&mut self) {
        *lock(&self.generation) += 1;
        self.sink.stop();
        info!("VoiceOutput: stopped (interruption or replacement)");
    }
}

fn play_utterance(
    utterance: Utterance,
    generation: u64,
    sink: Arc<Sink>,
    tts: Arc<dyn TtsBackend>,
    current: Arc<Mutex<u64>>,
    events: SynthesisSink,
) {
    let id = utterance.id;
    let bytes = match tts.synthesize(&utterance.text, &utterance.voice) {
        Ok(b) => b,
        Err(e) => {
            events(SynthesisEvent::Failed(id, e.to_string()));
            return;
        }
    };

    {
        // Held across the append so a concurrent cancel cannot slip between check and play.
        let g = lock(&current);
        if *g != generation {
            debug!("utterance {} superseded before playback", id.0);
            return;
        }
        if bytes.is_empty() {
            events(SynthesisEvent::Started(id));
            events(SynthesisEvent::Ended(id));
            return;
        }
        let source = match rodio::Decoder::new(Cursor::new(bytes)) {
            Ok(s) => s,
            Err(e) => {
                events(SynthesisEvent::Failed(id, format!("Decode failed: {}", e)));
                return;
            }
        };
        sink.append(source.convert_samples::<f32>());
        sink.play();
    }
    events(SynthesisEvent::Started(id));

    loop {
        thread::sleep(Duration::from_millis(25));
        if *lock(&current) != generation {
            // Cancelled; the synchronizer already cleared its state.
            return;
        }
        if sink.empty() {
            break;
        }
    }
    events(SynthesisEvent::Ended(id));
}

fn lock(m: &Mutex<u64>) -> std::sync::MutexGuard<'_, u64> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_tts_returns_empty() {
        let out = SilentTts.synthesize("hello", &VoiceParams::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn openai_body_maps_rate_to_speed() {
        let tts = OpenAiTts::new("https://tts.example/v1/", "k", "tts-1", "nova");
        let body = tts.request_body(
            "hi",
            &VoiceParams {
                rate: 9.0,
                pitch: 1.0,
            },
        );
        assert_eq!(body["voice"], "nova");
        assert_eq!(body["input"], "hi");
        assert_eq!(body["speed"], 4.0);
    }

    #[test]
    fn openai_skips_blank_text_without_network() {
        let tts = OpenAiTts::new("http://127.0.0.1:9", "k", "tts-1", "nova");
        let out = tts.synthesize("   ", &VoiceParams::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn sink_speech_reports_silent_utterance() {
        use crate::playback::UtteranceId;

        let mut speech = SinkSpeech::new(Arc::new(SilentTts)).expect("no output device");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        speech.speak(
            Utterance {
                id: UtteranceId(1),
                text: "hello".to_string(),
                voice: VoiceParams::default(),
            },
            Arc::new(move |ev: SynthesisEvent| {
                let _ = tx.lock().unwrap().send(ev);
            }),
        );
        assert_eq!(rx.recv().unwrap(), SynthesisEvent::Started(UtteranceId(1)));
        assert_eq!(rx.recv().unwrap(), SynthesisEvent::Ended(UtteranceId(1)));
    }
}
