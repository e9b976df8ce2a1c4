mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

use common::{fixture, fixture_with, MemoryPicker, UnpluggedWriter};
use mcx_bridge::metadata::BasicExtractor;
use mcx_bridge::serial::PortWriter;
use mcx_bridge::{
    BridgeError, HostEvent, MediaState, RelayMessage, SerialBridge, Snapshot, SourceId,
};

type Device = Lines<BufReader<DuplexStream>>;

fn device() -> (Device, PortWriter) {
    let (device, host) = tokio::io::duplex(4096);
    (BufReader::new(device).lines(), Box::new(host))
}

async fn next_snapshot(device: &mut Device) -> Option<Snapshot> {
    let line = tokio::time::timeout(Duration::from_secs(5), device.next_line())
        .await
        .expect("device read timed out")
        .unwrap()?;
    Some(Snapshot::decode_line(&line).unwrap())
}

fn playing(title: &str) -> RelayMessage {
    RelayMessage::Hook {
        media: MediaState {
            paused: false,
            title: Some(title.to_string()),
            artist: Some("Artist".to_string()),
            ..MediaState::default()
        },
    }
}

async fn play(f: &common::Fixture, id: i64, title: &str) {
    f.host.set_context(id, true);
    f.controller
        .handle_event(HostEvent::AudibleChanged {
            id: SourceId(id),
            audible: true,
        })
        .await;
    f.controller
        .handle_event(HostEvent::Message {
            id: SourceId(id),
            message: playing(title),
        })
        .await;
}

#[tokio::test]
async fn connect_sends_current_state_then_changes() {
    let (mut device, writer) = device();
    let picker = Arc::new(MemoryPicker::new(vec![Ok(writer)]));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));

    let status = f.controller.serial_request(&[]).await.unwrap();
    assert!(status.connected);
    assert_eq!(status.info.unwrap().name, "memory");

    let idle = next_snapshot(&mut device).await.unwrap();
    assert!(idle.paused);
    assert_eq!(idle.title, None);

    play(&f, 1, "Track").await;
    let now = next_snapshot(&mut device).await.unwrap();
    assert_eq!(now.title.as_deref(), Some("Track"));
    assert_eq!(now.artist.as_deref(), Some("Artist"));
    assert_eq!(now.url.as_deref(), Some("https://site1.example/watch"));
    assert!(!now.paused);
    assert!(now.ts >= idle.ts);

    // media title wins over the page title, so nothing goes out for this
    f.controller
        .handle_event(HostEvent::TitleChanged {
            id: SourceId(1),
            title: "Other page title".to_string(),
        })
        .await;
    f.controller
        .handle_event(HostEvent::Message {
            id: SourceId(1),
            message: RelayMessage::Pause,
        })
        .await;

    let paused = next_snapshot(&mut device).await.unwrap();
    assert_eq!(paused.title.as_deref(), Some("Track"));
    assert!(paused.paused);
    assert!(paused.ts >= now.ts);
}

#[tokio::test]
async fn removing_last_source_sends_idle_snapshot() {
    let (mut device, writer) = device();
    let picker = Arc::new(MemoryPicker::new(vec![Ok(writer)]));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));
    play(&f, 1, "Track").await;

    f.controller.serial_request(&[]).await.unwrap();
    let now = next_snapshot(&mut device).await.unwrap();
    assert_eq!(now.title.as_deref(), Some("Track"));

    f.controller
        .handle_event(HostEvent::Removed { id: SourceId(1) })
        .await;
    // the forwarder may repeat the state sent on connect before catching up
    let idle = loop {
        let snapshot = next_snapshot(&mut device).await.unwrap();
        if snapshot.title.is_none() {
            break snapshot;
        }
    };
    assert!(idle.paused);
    assert_eq!(idle.url, None);
}

#[tokio::test]
async fn write_failure_drops_link_until_reconnect() {
    let (mut device, writer) = device();
    let picker = Arc::new(MemoryPicker::new(vec![
        Ok(Box::new(UnpluggedWriter) as PortWriter),
        Ok(writer),
    ]));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));

    assert!(matches!(
        f.controller.serial_request(&[]).await,
        Err(BridgeError::WriteFailed(_))
    ));
    let status = f.controller.serial_status();
    assert!(!status.connected);
    assert!(status.info.is_some());

    // not forwarded while the link is down
    play(&f, 1, "Track").await;

    let status = f.controller.serial_connect(0).await.unwrap();
    assert!(status.connected);
    let resent = next_snapshot(&mut device).await.unwrap();
    assert_eq!(resent.title.as_deref(), Some("Track"));
    assert!(!resent.paused);
}

#[tokio::test]
async fn disconnect_releases_the_device() {
    let (mut device, writer) = device();
    let picker = Arc::new(MemoryPicker::new(vec![Ok(writer)]));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));
    f.controller.serial_request(&[]).await.unwrap();
    next_snapshot(&mut device).await.unwrap();

    let status = f.controller.serial_disconnect().await;
    assert!(!status.connected);
    assert!(status.info.is_none());
    assert!(!f.controller.serial_disconnect().await.connected);

    play(&f, 1, "Track").await;
    assert_eq!(next_snapshot(&mut device).await, None);
}

#[tokio::test]
async fn open_failure_is_reported() {
    let picker = Arc::new(MemoryPicker::new(Vec::new()));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));

    assert!(matches!(
        f.controller.serial_request(&[]).await,
        Err(BridgeError::OpenFailed(_))
    ));
    assert!(!f.controller.serial_status().connected);
}

#[tokio::test]
async fn serial_unavailable_without_transport() {
    let f = fixture();

    assert!(matches!(
        f.controller.serial_request(&[]).await,
        Err(BridgeError::NotAvailable)
    ));
    assert!(matches!(
        f.controller.serial_connect(0).await,
        Err(BridgeError::NotAvailable)
    ));
    assert!(!f.controller.serial_status().connected);
}

#[tokio::test]
async fn stalled_device_does_not_block_the_controller() {
    // room for the idle line only; nobody ever reads the other end
    let (_device, host) = tokio::io::duplex(256);
    let picker = Arc::new(MemoryPicker::new(vec![Ok(Box::new(host) as PortWriter)]));
    let f = fixture_with(Arc::new(BasicExtractor), SerialBridge::new(picker));
    f.controller.serial_request(&[]).await.unwrap();

    play(&f, 1, &"x".repeat(300)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(f.controller.serial_status().connected);
    let status = tokio::time::timeout(Duration::from_secs(1), f.controller.serial_disconnect())
        .await
        .expect("disconnect waited for the stalled write");
    assert!(!status.connected);
    assert!(status.info.is_none());

    // lifecycle events still flow
    f.controller
        .handle_event(HostEvent::Removed { id: SourceId(1) })
        .await;
    assert!(f.controller.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_device_times_out() {
    let (_device, host) = tokio::io::duplex(256);
    let picker = Arc::new(MemoryPicker::new(vec![Ok(Box::new(host) as PortWriter)]));
    let bridge = SerialBridge::new(picker).with_write_timeout(Duration::from_millis(200));
    let f = fixture_with(Arc::new(BasicExtractor), bridge);
    f.controller.serial_request(&[]).await.unwrap();

    play(&f, 1, &"x".repeat(300)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = f.controller.serial_status();
    assert!(!status.connected);
    assert_eq!(status.info.unwrap().name, "memory");
}
