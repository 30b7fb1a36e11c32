//! End-to-end over a real WebSocket: a local server plays the conversational
//! service and the controller connects to it like the CLI does.

mod common;

use common::{quiet_config, tone, wait_for_view, ScriptedDevices, ScriptedSpeech};
use futures::{SinkExt, StreamExt};
use mentexa_session::{Modality, SessionConfig, SessionController, SessionStatus, Speaker};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn push_to_talk_round_trip() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hangup_tx, hangup_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut tx, mut rx) = ws.split();

        tx.send(Message::Text(
            r#"{"type":"emotion_update","modality":"facial","emotion":"happy","confidence":90}"#
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let mut received: Vec<Value> = Vec::new();
        while let Some(msg) = rx.next().await {
            if let Message::Text(text) = msg.unwrap() {
                let v: Value = serde_json::from_str(text.as_str()).unwrap();
                let done = v["type"] == "finalize_turn";
                received.push(v);
                if done {
                    break;
                }
            }
        }

        for reply in [
            r#"{"type":"transcript","text":"hello"}"#,
            r#"{"type":"not_a_real_event"}"#,
            r#"{"type":"chat_token","text":"Hello "}"#,
            r#"{"type":"chat_token","text":"there"}"#,
            r#"{"type":"chat_end"}"#,
        ] {
            tx.send(Message::Text(reply.to_string().into())).await.unwrap();
        }

        let _ = hangup_rx.await;
        let _ = tx.close().await;
        received
    });

    let devices = ScriptedDevices::default();
    let speech = ScriptedSpeech::default();
    let config = SessionConfig {
        endpoint: format!("ws://{}/ws", addr),
        ..quiet_config()
    };
    let mut controller = SessionController::new(
        config,
        Box::new(devices.clone()),
        Box::new(speech.clone()),
    );
    controller.connect();
    let session = controller.spawn();
    let mut view = session.watch_view();

    let v = wait_for_view(&mut view, |v| v.status == SessionStatus::Idle).await;
    assert_eq!(v.status.to_string(), "Connected (Idle)");

    let v = wait_for_view(&mut view, |v| v.emotions.visual.is_some()).await;
    assert_eq!(v.emotions.display(Modality::Visual), "happy (90%)");
    assert_eq!(v.emotions.display(Modality::Audio), "...");

    session.start_capture();
    wait_for_view(&mut view, |v| v.capturing).await;

    session.press();
    devices.push(tone());
    session.release();

    let v = wait_for_view(&mut view, |v| {
        v.messages
            .iter()
            .any(|m| m.speaker == Speaker::Assistant && !m.streaming)
    })
    .await;
    let texts: Vec<(Speaker, String)> = v
        .messages
        .iter()
        .map(|m| (m.speaker, m.text.clone()))
        .collect();
    assert_eq!(
        texts,
        vec![
            (Speaker::User, "hello".to_string()),
            (Speaker::Assistant, "Hello there".to_string()),
        ]
    );
    assert_eq!(speech.spoken(), vec!["Hello there".to_string()]);

    hangup_tx.send(()).unwrap();
    let v = wait_for_view(&mut view, |v| v.status == SessionStatus::Disconnected).await;
    assert!(!v.capturing);
    timeout(Duration::from_secs(5), session.join()).await.unwrap();

    let received = server.await.unwrap();
    let types: Vec<&str> = received.iter().map(|v| v["type"].as_str().unwrap()).collect();
    assert_eq!(types.last(), Some(&"finalize_turn"));
    assert_eq!(types.iter().filter(|t| **t == "finalize_turn").count(), 1);
    for chunk in received.iter().filter(|v| v["type"] == "audio_chunk") {
        assert_eq!(chunk["is_recording_turn"], true);
        assert!(chunk["data"].as_str().unwrap().len() > 100);
    }
}

#[tokio::test]
async fn unreachable_endpoint_ends_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = SessionConfig {
        endpoint: format!("ws://{}/ws", addr),
        ..quiet_config()
    };
    let mut controller = SessionController::new(
        config,
        Box::new(ScriptedDevices::default()),
        Box::new(ScriptedSpeech::default()),
    );
    controller.connect();
    let session = controller.spawn();
    let mut view = session.watch_view();

    let v = wait_for_view(&mut view, |v| v.status == SessionStatus::Disconnected).await;
    assert!(v.messages.is_empty());
    timeout(Duration::from_secs(5), session.join()).await.unwrap();
}
