//! Mentexa CLI: a terminal front-end for one realtime session.
//!
//! Usage:
//!   cargo run -p mentexa-session -- [--endpoint ws://host:8000/ws] [--config mentexa.toml] [--still face.jpg]
//!
//! Commands on stdin: `start`, `stop`, an empty line toggles push-to-talk, `quit`.

use anyhow::{Context, Result};
use mentexa_session::{
    create_best_tts, EmotionReadings, LocalDevices, Modality, SessionConfig, SessionController,
    SessionStatus, SessionView, SinkSpeech, SpeechSynthesizer, SynthesisEvent, SynthesisSink,
    TurnPhase, Utterance,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

struct Args {
    endpoint: Option<String>,
    config: Option<PathBuf>,
    still: Option<PathBuf>,
}

/// `None` when usage was requested.
fn parse_args() -> Option<Args> {
    let mut parsed = Args {
        endpoint: None,
        config: None,
        still: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--endpoint" => parsed.endpoint = args.next(),
            "--config" => parsed.config = args.next().map(PathBuf::from),
            "--still" => parsed.still = args.next().map(PathBuf::from),
            "--help" | "-h" => return None,
            other => eprintln!("ignoring unknown argument {}", other),
        }
    }
    Some(parsed)
}

fn print_usage() {
    eprintln!("Mentexa: realtime multimodal session");
    eprintln!("  --endpoint URL     WebSocket endpoint (default ws://localhost:8000/ws, or MENTEXA_ENDPOINT)");
    eprintln!("  --config PATH      TOML configuration (default ./mentexa.toml when present)");
    eprintln!("  --still PATH       Image served as the camera feed");
    eprintln!();
    eprintln!("Commands: start | stop | <Enter> toggles push-to-talk | quit");
    eprintln!("Spoken replies need TTS_API_KEY (OpenAI-compatible /audio/speech).");
}

/// Speech engine used when there is no output device: reports an instant utterance.
struct MutedSpeech;

impl SpeechSynthesizer for MutedSpeech {
    fn speak(&mut self, utterance: Utterance, events: SynthesisSink) {
        events(SynthesisEvent::Started(utterance.id));
        events(SynthesisEvent::Ended(utterance.id));
    }

    fn cancel(&mut self) {}
}

#[derive(Default)]
struct Printer {
    status: Option<SessionStatus>,
    printed: usize,
    speaking: bool,
    notice: Option<String>,
    emotions: EmotionReadings,
}

impl Printer {
    fn show(&mut self, view: &SessionView) {
        if self.status != Some(view.status) {
            println!("● {}", view.status);
            self.status = Some(view.status);
        }
        if view.notice != self.notice {
            if let Some(notice) = &view.notice {
                println!("⚠️  {}", notice);
            }
            self.notice = view.notice.clone();
        }
        // Streaming replies are printed once sealed.
        while let Some(msg) = view.messages.get(self.printed) {
            if msg.streaming {
                break;
            }
            println!(
                "[{}] {}: {}",
                msg.at.format("%H:%M:%S"),
                msg.speaker.label(),
                msg.text
            );
            self.printed += 1;
        }
        if view.emotions != self.emotions {
            println!(
                "   face: {}   voice: {}",
                view.emotions.display(Modality::Visual),
                view.emotions.display(Modality::Audio)
            );
            self.emotions = view.emotions.clone();
        }
        if view.speaking != self.speaking {
            if view.speaking {
                println!("🔊 speaking (press Enter to interrupt)");
            }
            self.speaking = view.speaking;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(args) = parse_args() else {
        print_usage();
        return Ok(());
    };

    let mut config = SessionConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    config.validate()?;

    let speech: Box<dyn SpeechSynthesizer> = match SinkSpeech::new(create_best_tts()) {
        Ok(s) => Box::new(s),
        Err(e) => {
            warn!("No audio output ({}); replies will not be spoken", e);
            Box::new(MutedSpeech)
        }
    };

    let mut controller =
        SessionController::new(config, Box::new(LocalDevices::new(args.still)), speech);
    controller.connect();
    let session = controller.spawn();

    let mut printer = Printer::default();
    printer.show(&session.view());
    let mut view_rx = session.watch_view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "start" => {
                        session.start_capture();
                    }
                    "stop" => {
                        session.stop_capture();
                    }
                    "" => {
                        if session.view().turn == TurnPhase::Idle {
                            session.press();
                            println!("🎤 talking... (Enter to send)");
                        } else {
                            session.release();
                        }
                    }
                    "quit" | "exit" => {
                        session.shutdown();
                        break;
                    }
                    other => println!("unknown command {:?} (start | stop | <Enter> | quit)", other),
                },
                Ok(None) => {
                    session.shutdown();
                    break;
                }
                Err(e) => {
                    warn!("stdin: {}", e);
                    session.shutdown();
                    break;
                }
            },
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                printer.show(&view);
                if view.status == SessionStatus::Disconnected {
                    break;
                }
            }
        }
    }

    session.join().await;
    Ok(())
}
