//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use mentexa_session::{
    AcquiredDevices, CaptureDevices, DeviceGuard, SessionConfig, SessionResult, SessionView,
    SpeechSynthesizer, SynthesisEvent, SynthesisSink, Utterance,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Microphone fed by the test. No camera.
#[derive(Clone, Default)]
pub struct ScriptedDevices {
    frames: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
}

impl ScriptedDevices {
    pub fn push(&self, samples: Vec<f32>) {
        let guard = self.frames.lock().unwrap();
        guard
            .as_ref()
            .expect("capture not started")
            .send(samples)
            .unwrap();
    }

    /// Drop the frame sender, as a microphone that disappears mid-session would.
    pub fn unplug(&self) {
        self.frames.lock().unwrap().take();
    }
}

impl CaptureDevices for ScriptedDevices {
    fn acquire(
        &mut self,
        frames: mpsc::UnboundedSender<Vec<f32>>,
    ) -> SessionResult<AcquiredDevices> {
        *self.frames.lock().unwrap() = Some(frames);
        Ok(AcquiredDevices {
            microphone: DeviceGuard::detached(),
            sample_rate: 16000,
            camera: None,
        })
    }
}

#[derive(Default)]
pub struct SpeechLog {
    pub spoken: Vec<Utterance>,
    pub cancels: usize,
}

/// Records requests; reports `Started` immediately when `auto_start` is set.
#[derive(Clone, Default)]
pub struct ScriptedSpeech {
    pub log: Arc<Mutex<SpeechLog>>,
    pub auto_start: bool,
}

impl ScriptedSpeech {
    pub fn starting() -> Self {
        Self {
            auto_start: true,
            ..Default::default()
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .spoken
            .iter()
            .map(|u| u.text.clone())
            .collect()
    }

    pub fn cancels(&self) -> usize {
        self.log.lock().unwrap().cancels
    }
}

impl SpeechSynthesizer for ScriptedSpeech {
    fn speak(&mut self, utterance: Utterance, events: SynthesisSink) {
        let id = utterance.id;
        self.log.lock().unwrap().spoken.push(utterance);
        if self.auto_start {
            events(SynthesisEvent::Started(id));
        }
    }

    fn cancel(&mut self) {
        self.log.lock().unwrap().cancels += 1;
    }
}

/// Slices never tick on their own; only flushes produce audio.
pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        audio_slice_ms: 60_000,
        greeting: None,
        ..SessionConfig::default()
    }
}

/// Half a second of a 440 Hz tone at 16 kHz.
pub fn tone() -> Vec<f32> {
    (0..8000)
        .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
        .collect()
}

pub async fn wait_for_view<F>(rx: &mut watch::Receiver<SessionView>, pred: F) -> SessionView
where
    F: FnMut(&SessionView) -> bool,
{
    timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("view condition not reached in time")
        .expect("session ended")
        .clone()
}

/// Outbound message types in order, with the turn flag for audio.
pub fn wire_tags(wire: &[String]) -> Vec<String> {
    wire.iter()
        .map(|text| {
            let v: serde_json::Value = serde_json::from_str(text).unwrap();
            match v["type"].as_str().unwrap() {
                "audio_chunk" => format!("audio:{}", v["is_recording_turn"]),
                other => other.to_string(),
            }
        })
        .collect()
}
