//! TriggerLink against a scripted device on an in-memory pipe.
//!
//! Run with: cargo test --test trigger_link

use camsync::trigger::link::{LinkConfig, LinkError, LinkEvent, LinkState, TriggerLink};
use camsync::trigger::protocol::{DeviceMessage, TriggerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

fn fast_config() -> LinkConfig {
    LinkConfig {
        port: None,
        baud_rate: 115_200,
        handshake_timeout: Duration::from_millis(800),
        command_timeout: Duration::from_millis(200),
    }
}

/// Device that optionally greets with `READY` and answers each received line
/// with whatever `respond` returns. Every received line is recorded.
fn scripted_device<F>(
    io: DuplexStream,
    greeting: Option<&'static str>,
    received: Arc<Mutex<Vec<String>>>,
    respond: F,
) -> JoinHandle<()>
where
    F: Fn(&str) -> Vec<String> + Send + 'static,
{
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(io);
        if let Some(greeting) = greeting {
            writer
                .write_all(format!("{greeting}\n").as_bytes())
                .await
                .unwrap();
        }
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            received.lock().await.push(line.clone());
            for reply in respond(&line) {
                if writer
                    .write_all(format!("{reply}\r\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    })
}

/// Replies like an idle board that never reset.
fn idle_board(line: &str) -> Vec<String> {
    match line {
        "PING" => vec!["PONG".into()],
        "STATUS" => vec!["STATUS:IDLE:0:30:4".into()],
        "ARM" => vec!["ARMED".into()],
        "START" => vec!["RECORDING".into(), "FRAME:1".into()],
        "STOP" => vec!["STOPPED:90".into()],
        _ => vec![],
    }
}

/// Next event, skipping late answers to handshake probes.
async fn next_event(events: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
    loop {
        match events.recv().await.unwrap() {
            LinkEvent::Message(DeviceMessage::Pong) => continue,
            event => return event,
        }
    }
}

async fn connect(
    greeting: Option<&'static str>,
    respond: fn(&str) -> Vec<String>,
) -> (TriggerLink, Arc<Mutex<Vec<String>>>) {
    let (host, device) = tokio::io::duplex(4096);
    let received = Arc::new(Mutex::new(Vec::new()));
    scripted_device(device, greeting, Arc::clone(&received), respond);
    let (reader, writer) = tokio::io::split(host);
    let link = TriggerLink::from_transport(reader, writer, "sim0", fast_config())
        .await
        .unwrap();
    (link, received)
}

#[tokio::test]
async fn test_handshake_on_ready() {
    let (link, _) = connect(Some("READY"), |_| vec![]).await;
    assert!(link.is_connected());
    assert_eq!(link.port_name(), "sim0");
    assert_eq!(link.state(), LinkState::Device(TriggerState::Idle));
}

#[tokio::test]
async fn test_handshake_on_pong_fetches_status() {
    let (link, received) = connect(None, |line| match line {
        "PING" => vec!["PONG".into()],
        "STATUS" => vec!["STATUS:ARMED:0:60:2".into()],
        _ => vec![],
    })
    .await;

    let status = link.status().unwrap();
    assert_eq!(status.state, TriggerState::Armed);
    assert_eq!(status.fps, 60);
    assert_eq!(status.active_cameras, 2);
    assert!(received.lock().await.iter().any(|l| l == "STATUS"));
}

#[tokio::test]
async fn test_handshake_times_out_on_silent_device() {
    let (host, device) = tokio::io::duplex(4096);
    let received = Arc::new(Mutex::new(Vec::new()));
    scripted_device(device, None, Arc::clone(&received), |_| vec![]);
    let (reader, writer) = tokio::io::split(host);

    let err = TriggerLink::from_transport(reader, writer, "sim0", fast_config())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LinkError::HandshakeTimeout(_)));
    // The link kept probing while it waited.
    assert!(received.lock().await.iter().all(|l| l == "PING"));
    assert!(!received.lock().await.is_empty());
}

#[tokio::test]
async fn test_ping_and_status_round_trip() {
    let (link, _) = connect(Some("READY"), idle_board).await;

    let rtt = link.ping().await.unwrap();
    assert!(rtt < Duration::from_millis(200));

    let status = link.request_status().await.unwrap();
    assert_eq!(status.state, TriggerState::Idle);
    assert_eq!(status.fps, 30);
    assert_eq!(status.active_cameras, 4);
}

#[tokio::test]
async fn test_fire_and_forget_updates_mirror_through_events() {
    let (link, received) = connect(Some("READY"), idle_board).await;
    let mut events = link.subscribe();

    link.arm().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        LinkEvent::Message(DeviceMessage::Armed)
    );
    assert_eq!(link.state(), LinkState::Device(TriggerState::Armed));

    link.start().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        LinkEvent::Message(DeviceMessage::Recording)
    );
    assert_eq!(
        next_event(&mut events).await,
        LinkEvent::Message(DeviceMessage::Frame(1))
    );
    assert_eq!(link.status().unwrap().frame_count, 1);

    let frames = link.stop_and_count().await.unwrap();
    assert_eq!(frames, 90);
    assert_eq!(link.state(), LinkState::Device(TriggerState::Idle));

    let sent = received.lock().await.clone();
    let tail: Vec<&str> = sent[sent.len() - 3..].iter().map(String::as_str).collect();
    assert_eq!(tail, ["ARM", "START", "STOP"]);
}

#[tokio::test]
async fn test_device_error_fails_pending_request() {
    let (link, _) = connect(Some("READY"), |line| match line {
        "STOP" => vec!["ERROR:Not recording".into()],
        _ => vec![],
    })
    .await;

    match link.stop_and_count().await {
        Err(LinkError::Device(msg)) => assert_eq!(msg, "Not recording"),
        other => panic!("expected device error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_request_times_out_without_reply() {
    let (link, _) = connect(Some("READY"), |_| vec![]).await;

    match link.request_status().await {
        Err(LinkError::Timeout { command, after }) => {
            assert_eq!(command, "STATUS");
            assert_eq!(after, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    // A timed out request does not poison the next one.
    assert!(matches!(
        link.ping().await,
        Err(LinkError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_wire() {
    let (link, received) = connect(Some("READY"), idle_board).await;

    assert!(matches!(
        link.set_fps(0).await,
        Err(LinkError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.set_fps(166).await,
        Err(LinkError::InvalidArgument(_))
    ));
    assert!(matches!(
        link.set_camera_count(5).await,
        Err(LinkError::InvalidArgument(_))
    ));

    link.set_fps(165).await.unwrap();
    link.set_camera_count(1).await.unwrap();
    // STATUS is answered only after everything before it was read.
    link.request_status().await.unwrap();

    let sent: Vec<String> = received
        .lock()
        .await
        .iter()
        .filter(|l| *l != "PING" && *l != "STATUS")
        .cloned()
        .collect();
    assert_eq!(sent, ["FPS:165", "CAMERAS:1"]);
}

#[tokio::test]
async fn test_device_hangup_disconnects() {
    let (host, device) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(host);
    let device_task = tokio::spawn(async move {
        let mut device = device;
        device.write_all(b"READY\n").await.unwrap();
        device
    });

    let link = TriggerLink::from_transport(reader, writer, "sim0", fast_config())
        .await
        .unwrap();
    let mut events = link.subscribe();
    drop(device_task.await.unwrap());

    assert_eq!(next_event(&mut events).await, LinkEvent::Disconnected);
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(link.status().is_none());
    assert!(matches!(link.arm().await, Err(LinkError::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_is_reported_once() {
    let (link, _) = connect(Some("READY"), idle_board).await;
    let mut events = link.subscribe();

    link.disconnect().await;
    link.disconnect().await;

    assert_eq!(next_event(&mut events).await, LinkEvent::Disconnected);
    assert!(events.try_recv().is_err());
    assert!(matches!(link.ping().await, Err(LinkError::NotConnected)));
}
