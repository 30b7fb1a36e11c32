//! Push-to-talk turn taking.
//!
//! Press opens a turn, release asks the capture pipeline for a flush, and the
//! flushed slice closes the turn: it is tagged, sent, and followed by exactly
//! one `finalize_turn`. Audio captured outside a turn still flows, tagged false.

use crate::encoder::exceeds_threshold;
use crate::protocol::{ChunkEnvelope, OutboundMessage};
use tracing::{debug, info, trace};

/// Phase of the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Recording,
    /// Released; waiting for the flushed slice before finalizing.
    Stopping,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Recording => "recording",
            TurnPhase::Stopping => "stopping",
        }
    }
}

/// What to put on the wire for one captured audio slice, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnOutput {
    pub chunk: Option<ChunkEnvelope>,
    /// Send `finalize_turn` after `chunk`.
    pub finalize: bool,
}

impl TurnOutput {
    pub fn into_messages(self) -> Vec<OutboundMessage> {
        let mut out = Vec::with_capacity(2);
        if let Some(chunk) = self.chunk {
            out.push(chunk.into_message());
        }
        if self.finalize {
            out.push(OutboundMessage::FinalizeTurn);
        }
        out
    }
}

/// Owns the turn-open flag. Everyone else only reads [`TurnMachine::phase`].
#[derive(Debug)]
pub struct TurnMachine {
    phase: TurnPhase,
    min_payload_len: usize,
    turns_opened: u64,
    turns_finalized: u64,
}

impl TurnMachine {
    pub fn new(min_payload_len: usize) -> Self {
        Self {
            phase: TurnPhase::Idle,
            min_payload_len,
            turns_opened: 0,
            turns_finalized: 0,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// True while captured audio belongs to a turn.
    pub fn is_turn_open(&self) -> bool {
        self.phase != TurnPhase::Idle
    }

    pub fn turns_opened(&self) -> u64 {
        self.turns_opened
    }

    pub fn turns_finalized(&self) -> u64 {
        self.turns_finalized
    }

    /// Open a turn. Returns false (and changes nothing) unless idle.
    pub fn press(&mut self) -> bool {
        if self.phase != TurnPhase::Idle {
            debug!("press ignored: turn already {}", self.phase.as_str());
            return false;
        }
        self.phase = TurnPhase::Recording;
        self.turns_opened += 1;
        info!("🎤 Turn {} opened", self.turns_opened);
        true
    }

    /// Request closure. Returns true when the caller must force a capture flush.
    pub fn release(&mut self) -> bool {
        if self.phase != TurnPhase::Recording {
            debug!("release ignored: turn {}", self.phase.as_str());
            return false;
        }
        self.phase = TurnPhase::Stopping;
        debug!("Turn {} stopping, awaiting flush", self.turns_opened);
        true
    }

    /// Tag one encoded slice. `flushed` marks the slice produced by a flush.
    ///
    /// The finalize is decided by the flush alone; a slice too small to send
    /// is dropped without suppressing it.
    pub fn on_audio(&mut self, payload: String, flushed: bool) -> TurnOutput {
        let tagged = self.is_turn_open();

        let chunk = if exceeds_threshold(&payload, self.min_payload_len) {
            Some(ChunkEnvelope::audio(payload, tagged))
        } else {
            trace!("dropping degenerate audio slice ({} chars)", payload.len());
            None
        };

        let finalize = flushed && self.phase == TurnPhase::Stopping;
        if finalize {
            self.phase = TurnPhase::Idle;
            self.turns_finalized += 1;
            info!("✅ Turn {} finalized", self.turns_finalized);
        }

        TurnOutput { chunk, finalize }
    }

    /// Drop any open turn without finalizing it. Returns whether one was open.
    pub fn abandon(&mut self) -> bool {
        let was_open = self.is_turn_open();
        if was_open {
            debug!("Turn {} abandoned", self.turns_opened);
        }
        self.phase = TurnPhase::Idle;
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big() -> String {
        "A".repeat(200)
    }

    fn tags(msgs: &[OutboundMessage]) -> Vec<String> {
        msgs.iter()
            .map(|m| match m {
                OutboundMessage::AudioChunk { is_recording_turn, .. } => {
                    format!("audio:{}", is_recording_turn)
                }
                OutboundMessage::FinalizeTurn => "finalize".to_string(),
                OutboundMessage::VideoFrame { .. } => "video".to_string(),
            })
            .collect()
    }

    #[test]
    fn press_release_flush_finalizes_after_last_chunk() {
        let mut turn = TurnMachine::new(100);
        let mut wire = Vec::new();

        assert!(turn.press());
        for _ in 0..3 {
            wire.extend(turn.on_audio(big(), false).into_messages());
        }
        assert!(turn.release());
        assert_eq!(turn.phase(), TurnPhase::Stopping);
        wire.extend(turn.on_audio(big(), true).into_messages());

        assert_eq!(
            tags(&wire),
            vec!["audio:true", "audio:true", "audio:true", "audio:true", "finalize"]
        );
        assert_eq!(turn.phase(), TurnPhase::Idle);
        assert_eq!(turn.turns_finalized(), 1);
    }

    #[test]
    fn regular_slice_while_stopping_does_not_finalize() {
        let mut turn = TurnMachine::new(100);
        turn.press();
        turn.release();

        let out = turn.on_audio(big(), false);
        assert_eq!(tags(&out.into_messages()), vec!["audio:true"]);
        assert_eq!(turn.phase(), TurnPhase::Stopping);

        let out = turn.on_audio(big(), true);
        assert_eq!(tags(&out.into_messages()), vec!["audio:true", "finalize"]);
    }

    #[test]
    fn repeated_press_is_a_noop() {
        let mut turn = TurnMachine::new(100);
        assert!(turn.press());
        assert!(!turn.press());
        assert_eq!(turn.phase(), TurnPhase::Recording);
        assert_eq!(turn.turns_opened(), 1);

        turn.release();
        assert!(!turn.press());
        assert_eq!(turn.phase(), TurnPhase::Stopping);
        assert_eq!(turn.turns_opened(), 1);
    }

    #[test]
    fn degenerate_flush_slice_still_finalizes() {
        let mut turn = TurnMachine::new(100);
        turn.press();
        turn.release();

        let out = turn.on_audio("UklGRg==".to_string(), true);
        assert!(out.chunk.is_none());
        assert!(out.finalize);
        assert_eq!(tags(&out.into_messages()), vec!["finalize"]);
    }

    #[test]
    fn idle_audio_is_sent_untagged() {
        let mut turn = TurnMachine::new(100);
        let out = turn.on_audio(big(), false);
        assert_eq!(tags(&out.into_messages()), vec!["audio:false"]);

        // A stray flush outside a turn never produces a finalize.
        let out = turn.on_audio(big(), true);
        assert!(!out.finalize);
    }

    #[test]
    fn release_without_press_is_ignored() {
        let mut turn = TurnMachine::new(100);
        assert!(!turn.release());
        assert_eq!(turn.phase(), TurnPhase::Idle);
    }

    #[test]
    fn one_finalize_per_press_release_pair() {
        let mut turn = TurnMachine::new(100);
        let mut finalizes = 0;
        for _ in 0..5 {
            turn.press();
            turn.on_audio(big(), false);
            turn.release();
            if turn.on_audio(big(), true).finalize {
                finalizes += 1;
            }
            // Late flush for the same turn.
            if turn.on_audio(String::new(), true).finalize {
                finalizes += 1;
            }
        }
        assert_eq!(finalizes, 5);
        assert_eq!(turn.turns_opened(), turn.turns_finalized());
    }

    #[test]
    fn abandon_clears_without_finalize() {
        let mut turn = TurnMachine::new(100);
        turn.press();
        assert!(turn.abandon());
        assert_eq!(turn.phase(), TurnPhase::Idle);
        assert_eq!(turn.turns_finalized(), 0);
        assert!(!turn.abandon());
    }
}
