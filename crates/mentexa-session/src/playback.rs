//! Playback synchronization: one utterance at a time, cancellation wins.
//!
//! The synchronizer requests synthesis from a [`SpeechSynthesizer`] and turns
//! its start/end/error lifecycle into a single `speaking` flag. Every request
//! carries an [`UtteranceId`]; events for anything but the current utterance
//! are ignored, so a late `Ended` from a cancelled utterance can never flip
//! the flag back on or off.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtteranceId(pub u64);

/// Voice shaping passed to the synthesis engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub rate: f32,
    pub pitch: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub voice: VoiceParams,
}

/// Lifecycle signals reported by a synthesis engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started(UtteranceId),
    Ended(UtteranceId),
    Failed(UtteranceId, String),
}

/// Where an engine reports [`SynthesisEvent`]s. Called from any thread.
pub type SynthesisSink = Arc<dyn Fn(SynthesisEvent) + Send + Sync>;

/// External speech engine. Must report `Started` and then `Ended` or `Failed`
/// for each utterance it actually plays; must stop audio on `cancel`.
pub trait SpeechSynthesizer: Send {
    fn speak(&mut self, utterance: Utterance, events: SynthesisSink);

    /// Stop whatever is playing or pending. May be called when idle.
    fn cancel(&mut self);
}

pub struct PlaybackSynchronizer {
    engine: Box<dyn SpeechSynthesizer>,
    voice: VoiceParams,
    events: SynthesisSink,
    next_id: u64,
    active: Option<UtteranceId>,
    speaking: watch::Sender<bool>,
}

impl PlaybackSynchronizer {
    pub fn new(
        engine: Box<dyn SpeechSynthesizer>,
        voice: VoiceParams,
        events: SynthesisSink,
    ) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            engine,
            voice,
            events,
            next_id: 0,
            active: None,
            speaking,
        }
    }

    /// Speak `text`, cancelling anything in progress. Empty text is skipped.
    pub fn play(&mut self, text: &str) -> Option<UtteranceId> {
        if text.is_empty() {
            debug!("playback skipped: empty reply");
            return None;
        }
        self.cancel();

        self.next_id += 1;
        let id = UtteranceId(self.next_id);
        self.active = Some(id);
        info!("🔊 Synthesis requested for utterance {} ({} chars)", id.0, text.len());

        self.engine.speak(
            Utterance {
                id,
                text: text.to_string(),
                voice: self.voice,
            },
            Arc::clone(&self.events),
        );
        Some(id)
    }

    /// Stop the current utterance and clear the speaking flag immediately.
    pub fn cancel(&mut self) {
        if let Some(id) = self.active.take() {
            info!("⏹️ Utterance {} cancelled", id.0);
            self.engine.cancel();
        }
        self.set_speaking(false);
    }

    /// Apply an engine lifecycle event.
    pub fn on_event(&mut self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Started(id) if self.active == Some(id) => {
                self.set_speaking(true);
            }
            SynthesisEvent::Ended(id) if self.active == Some(id) => {
                debug!("Utterance {} ended", id.0);
                self.active = None;
                self.set_speaking(false);
            }
            SynthesisEvent::Failed(id, reason) if self.active == Some(id) => {
                warn!("Utterance {} failed: {}", id.0, reason);
                self.active = None;
                self.set_speaking(false);
            }
            stale => debug!("ignoring stale synthesis event {:?}", stale),
        }
    }

    /// A synthesis has been requested and not yet ended.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    fn set_speaking(&self, value: bool) {
        self.speaking.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        spoken: Vec<Utterance>,
        cancels: usize,
    }

    struct RecordingEngine(Arc<Mutex<Calls>>);

    impl SpeechSynthesizer for RecordingEngine {
        fn speak(&mut self, utterance: Utterance, _events: SynthesisSink) {
            self.0.lock().unwrap().spoken.push(utterance);
        }

        fn cancel(&mut self) {
            self.0.lock().unwrap().cancels += 1;
        }
    }

    fn synchronizer() -> (PlaybackSynchronizer, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let sync = PlaybackSynchronizer::new(
            Box::new(RecordingEngine(Arc::clone(&calls))),
            VoiceParams::default(),
            Arc::new(|_: SynthesisEvent| {}),
        );
        (sync, calls)
    }

    #[test]
    fn speaking_only_between_start_and_end() {
        let (mut sync, calls) = synchronizer();
        let id = sync.play("Hello world").unwrap();
        assert!(!sync.is_speaking());
        assert!(sync.is_active());

        sync.on_event(SynthesisEvent::Started(id));
        assert!(sync.is_speaking());

        sync.on_event(SynthesisEvent::Ended(id));
        assert!(!sync.is_speaking());
        assert!(!sync.is_active());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.spoken.len(), 1);
        assert_eq!(calls.spoken[0].text, "Hello world");
        assert_eq!(calls.spoken[0].voice, VoiceParams::default());
    }

    #[test]
    fn failure_is_treated_like_end() {
        let (mut sync, _) = synchronizer();
        let id = sync.play("x").unwrap();
        sync.on_event(SynthesisEvent::Started(id));
        sync.on_event(SynthesisEvent::Failed(id, "device gone".to_string()));
        assert!(!sync.is_speaking());
    }

    #[test]
    fn cancel_is_authoritative_over_late_events() {
        let (mut sync, calls) = synchronizer();
        let id = sync.play("long answer").unwrap();
        sync.on_event(SynthesisEvent::Started(id));
        sync.cancel();
        assert!(!sync.is_speaking());

        // The engine reports late; nothing changes.
        sync.on_event(SynthesisEvent::Started(id));
        sync.on_event(SynthesisEvent::Ended(id));
        assert!(!sync.is_speaking());
        assert_eq!(calls.lock().unwrap().cancels, 1);
    }

    #[test]
    fn new_trigger_replaces_the_current_one() {
        let (mut sync, calls) = synchronizer();
        let first = sync.play("first").unwrap();
        sync.on_event(SynthesisEvent::Started(first));
        let second = sync.play("second").unwrap();
        assert!(!sync.is_speaking());

        sync.on_event(SynthesisEvent::Ended(first));
        sync.on_event(SynthesisEvent::Started(second));
        assert!(sync.is_speaking());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.cancels, 1);
        assert_eq!(calls.spoken.len(), 2);
    }

    #[test]
    fn empty_text_is_not_spoken() {
        let (mut sync, calls) = synchronizer();
        assert!(sync.play("").is_none());
        assert!(calls.lock().unwrap().spoken.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_the_flag() {
        let (mut sync, _) = synchronizer();
        let mut rx = sync.subscribe();
        let id = sync.play("hi").unwrap();
        sync.on_event(SynthesisEvent::Started(id));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
