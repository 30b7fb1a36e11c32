//! Session controller: the single owner of session state.
//!
//! Every lifecycle signal (user gestures, channel events, capture slices,
//! synthesis callbacks) lands on one queue and is handled to completion
//! before the next, so the turn machine, reply assembler and playback
//! synchronizer never observe each other half-way through an update.
//!
//! ```text
//!   user ──┐
//!   ws ────┤                       ┌─▶ ChannelMultiplexer ──▶ ws
//!   mic ───┼─▶ SessionEvent queue ─┼─▶ Conversation
//!   tts ───┘                       └─▶ PlaybackSynchronizer ──▶ tts
//! ```

use crate::capture::{CaptureDevices, CaptureEvent, CaptureHandle, CapturePipeline};
use crate::channel::{ChannelEvent, ChannelMultiplexer, ConnectionState};
use crate::config::SessionConfig;
use crate::playback::{PlaybackSynchronizer, SpeechSynthesizer, SynthesisEvent, SynthesisSink};
use crate::protocol::{ChunkEnvelope, InboundMessage, Modality, Reading};
use crate::reply::{Conversation, ConversationMessage};
use crate::turn::{TurnMachine, TurnPhase};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Gestures from the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    StartCapture,
    StopCapture,
    /// Push-to-talk down.
    Press,
    /// Push-to-talk up.
    Release,
    Shutdown,
}

/// Everything the controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    User(UserCommand),
    Channel(ChannelEvent),
    Capture(CaptureEvent),
    Synthesis(SynthesisEvent),
}

impl From<UserCommand> for SessionEvent {
    fn from(cmd: UserCommand) -> Self {
        SessionEvent::User(cmd)
    }
}

impl From<ChannelEvent> for SessionEvent {
    fn from(ev: ChannelEvent) -> Self {
        SessionEvent::Channel(ev)
    }
}

impl From<CaptureEvent> for SessionEvent {
    fn from(ev: CaptureEvent) -> Self {
        SessionEvent::Capture(ev)
    }
}

impl From<SynthesisEvent> for SessionEvent {
    fn from(ev: SynthesisEvent) -> Self {
        SessionEvent::Synthesis(ev)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Offline,
    Idle,
    Active,
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Offline => "Offline",
            SessionStatus::Idle => "Connected (Idle)",
            SessionStatus::Active => "Session Active",
            SessionStatus::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Latest reading per modality. Last write wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmotionReadings {
    pub visual: Option<Reading>,
    pub audio: Option<Reading>,
}

impl EmotionReadings {
    pub fn set(&mut self, modality: Modality, reading: Reading) {
        match modality {
            Modality::Visual => self.visual = Some(reading),
            Modality::Audio => self.audio = Some(reading),
        }
    }

    pub fn get(&self, modality: Modality) -> Option<&Reading> {
        match modality {
            Modality::Visual => self.visual.as_ref(),
            Modality::Audio => self.audio.as_ref(),
        }
    }

    /// `"label (NN%)"`, or `"..."` before the first reading.
    pub fn display(&self, modality: Modality) -> String {
        self.get(modality)
            .map(|r| r.to_string())
            .unwrap_or_else(|| "...".to_string())
    }

    pub fn clear(&mut self) {
        self.visual = None;
        self.audio = None;
    }
}

/// Snapshot published after every handled event.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub status: SessionStatus,
    pub connection: ConnectionState,
    pub turn: TurnPhase,
    pub capturing: bool,
    pub speaking: bool,
    pub emotions: EmotionReadings,
    pub messages: Vec<ConversationMessage>,
    /// Blocking notice, e.g. a device that could not be opened.
    pub notice: Option<String>,
}

pub struct SessionController {
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    channel: ChannelMultiplexer,
    turn: TurnMachine,
    conversation: Conversation,
    playback: PlaybackSynchronizer,
    devices: Box<dyn CaptureDevices>,
    capture: Option<CaptureHandle>,
    emotions: EmotionReadings,
    status: SessionStatus,
    notice: Option<String>,
    view: watch::Sender<SessionView>,
    finished: bool,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        devices: Box<dyn CaptureDevices>,
        speech: Box<dyn SpeechSynthesizer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let synthesis_tx = events_tx.clone();
        let sink: SynthesisSink = Arc::new(move |ev: SynthesisEvent| {
            let _ = synthesis_tx.send(SessionEvent::Synthesis(ev));
        });
        let playback = PlaybackSynchronizer::new(speech, config.voice(), sink);
        let conversation = Conversation::new(config.greeting.as_deref());
        let turn = TurnMachine::new(config.min_chunk_len);
        let channel = ChannelMultiplexer::new();

        let initial = SessionView {
            status: SessionStatus::Offline,
            connection: channel.state(),
            turn: turn.phase(),
            capturing: false,
            speaking: false,
            emotions: EmotionReadings::default(),
            messages: conversation.messages().to_vec(),
            notice: None,
        };
        let (view, _) = watch::channel(initial);

        Self {
            config,
            events_tx,
            events_rx,
            channel,
            turn,
            conversation,
            playback,
            devices,
            capture: None,
            emotions: EmotionReadings::default(),
            status: SessionStatus::Offline,
            notice: None,
            view,
            finished: false,
        }
    }

    /// Open the WebSocket to the configured endpoint.
    pub fn connect(&mut self) {
        let endpoint = self.config.endpoint.clone();
        self.channel.connect(&endpoint, self.events_tx.clone());
    }

    /// Use `link` as the transport instead of a WebSocket. The caller feeds
    /// [`ChannelEvent`]s back through [`SessionController::sender`].
    pub fn attach_link(&mut self, link: mpsc::UnboundedSender<String>) {
        self.channel.attach(link);
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.playback.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn turn_phase(&self) -> TurnPhase {
        self.turn.phase()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn emotions(&self) -> &EmotionReadings {
        &self.emotions
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            status: self.status,
            connection: self.channel.state(),
            turn: self.turn.phase(),
            capturing: self.capture.is_some(),
            speaking: self.playback.is_speaking(),
            emotions: self.emotions.clone(),
            messages: self.conversation.messages().to_vec(),
            notice: self.notice.clone(),
        }
    }

    /// Handle the next queued event. Returns false once the session has ended.
    pub async fn step(&mut self) -> bool {
        if self.finished {
            return false;
        }
        match self.events_rx.recv().await {
            Some(event) => self.handle(event),
            None => return false,
        }
        !self.finished
    }

    pub async fn run(mut self) {
        info!(target: "mentexa::session", "Session controller running");
        while self.step().await {}
        self.teardown();
        info!(target: "mentexa::session", "Session ended");
    }

    /// Run on the current runtime and hand back a handle for the front-end.
    pub fn spawn(self) -> SessionHandle {
        let events = self.sender();
        let view = self.subscribe();
        let speaking = self.speaking();
        let task = tokio::spawn(self.run());
        SessionHandle {
            events,
            view,
            speaking,
            task,
        }
    }

    /// Apply one event and publish the resulting view.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::User(cmd) => self.on_user(cmd),
            SessionEvent::Channel(ev) => self.on_channel(ev),
            SessionEvent::Capture(ev) => self.on_capture(ev),
            SessionEvent::Synthesis(ev) => self.playback.on_event(ev),
        }
        self.publish();
    }

    fn on_user(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::StartCapture => self.start_capture(),
            UserCommand::StopCapture => self.stop_capture(),
            UserCommand::Press => {
                if self.capture.is_none() {
                    debug!("press ignored: capture not running");
                    return;
                }
                if self.turn.press() && self.playback.is_active() {
                    info!(target: "mentexa::session", "Barge-in: cancelling playback");
                    self.playback.cancel();
                }
            }
            UserCommand::Release => {
                if !self.turn.release() {
                    return;
                }
                let flushing = self.capture.as_ref().is_some_and(|c| c.request_flush());
                if !flushing {
                    self.finalize_without_flush();
                }
            }
            UserCommand::Shutdown => {
                info!(target: "mentexa::session", "Shutdown requested");
                self.teardown();
                self.finished = true;
            }
        }
    }

    fn start_capture(&mut self) {
        if self.capture.is_some() {
            debug!("capture already running");
            return;
        }
        if !self.channel.is_open() {
            warn!(
                target: "mentexa::session",
                "Cannot start capture: channel {}",
                self.channel.state().as_str()
            );
            return;
        }
        let settings = self.config.capture_settings();
        match CapturePipeline::start(&settings, self.devices.as_mut(), self.events_tx.clone()) {
            Ok(handle) => {
                debug!("capture running at {} Hz", handle.sample_rate());
                self.capture = Some(handle);
                self.notice = None;
                self.status = SessionStatus::Active;
            }
            Err(e) => {
                error!(target: "mentexa::session", "Could not access camera/microphone: {}", e);
                self.notice = Some(format!("Could not access camera/microphone: {}", e));
            }
        }
    }

    fn stop_capture(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        // The final flush slice closes a turn that is still being held.
        if self.turn.release() && !capture.is_running() {
            self.finalize_without_flush();
        }
        capture.stop();
        self.emotions.clear();
        if self.channel.is_open() {
            self.status = SessionStatus::Idle;
        }
    }

    /// Close a stopping turn when the slicer is gone and no flush slice will come.
    fn finalize_without_flush(&mut self) {
        warn!(
            target: "mentexa::session",
            "Capture ended before the turn was flushed; finalizing now"
        );
        let output = self.turn.on_audio(String::new(), true);
        for message in output.into_messages() {
            self.channel.send(&message);
        }
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                self.channel.on_opened();
                self.status = if self.capture.is_some() {
                    SessionStatus::Active
                } else {
                    SessionStatus::Idle
                };
            }
            ChannelEvent::Message(text) => {
                if let Some(msg) = self.channel.demux(&text) {
                    self.on_inbound(msg);
                }
            }
            ChannelEvent::Error(e) => {
                warn!(target: "mentexa::session", "Channel error: {}", e);
            }
            ChannelEvent::Closed => {
                self.channel.on_closed();
                if self.turn.abandon() {
                    info!(target: "mentexa::session", "Open turn abandoned on disconnect");
                }
                self.teardown();
                self.status = SessionStatus::Disconnected;
                self.finished = true;
            }
        }
    }

    fn on_inbound(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::EmotionUpdate {
                modality,
                emotion,
                confidence,
            } => {
                let modality = Modality::from_wire(&modality);
                let reading = Reading::new(emotion, confidence);
                debug!("emotion {:?}: {}", modality, reading);
                self.emotions.set(modality, reading);
            }
            InboundMessage::Transcript { text } => {
                info!(target: "mentexa::session", "📝 Transcript: {}", text);
                self.conversation.push_user(text);
            }
            InboundMessage::ChatToken { text } => {
                self.conversation.append_token(&text);
            }
            InboundMessage::ChatEnd => match self.conversation.finish_reply() {
                Some(reply) => {
                    info!(
                        target: "mentexa::session",
                        "Reply complete ({} chars)",
                        reply.text.len()
                    );
                    self.playback.play(&reply.text);
                }
                None => debug!("chat_end without an open reply"),
            },
        }
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Audio(slice) => {
                let output = self.turn.on_audio(slice.payload, slice.flush);
                for message in output.into_messages() {
                    self.channel.send(&message);
                }
            }
            CaptureEvent::Video(frame) => {
                self.channel
                    .send(&ChunkEnvelope::video(frame.data_url).into_message());
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.playback.cancel();
        self.channel.close();
    }

    fn publish(&self) {
        let next = self.view();
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Front-end side of a spawned [`SessionController`].
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<SessionView>,
    speaking: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue an event. False once the controller is gone.
    pub fn send(&self, event: impl Into<SessionEvent>) -> bool {
        self.events.send(event.into()).is_ok()
    }

    pub fn start_capture(&self) -> bool {
        self.send(UserCommand::StartCapture)
    }

    pub fn stop_capture(&self) -> bool {
        self.send(UserCommand::StopCapture)
    }

    pub fn press(&self) -> bool {
        self.send(UserCommand::Press)
    }

    pub fn release(&self) -> bool {
        self.send(UserCommand::Release)
    }

    pub fn shutdown(&self) -> bool {
        self.send(UserCommand::Shutdown)
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(target: "mentexa::session", "Session task failed: {}", e);
        }
    }
}
