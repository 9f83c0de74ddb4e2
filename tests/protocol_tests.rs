mod common;

use anyhow::Result;
use base64::Engine;
use chrono::{TimeZone, Utc};
use common::*;
use loqa_link::audio::{AudioChunk, AudioFormat};
use loqa_link::protocol::{self, ChunkTransfer, ProtocolMessage, StateUpdate};
use loqa_link::sync::{RecordingState, SyncEvent, SyncService};
use loqa_link::transport::{AppLifecycle, MemoryTransport, Transport};
use loqa_link::SyncConfig;
use serde_json::json;

#[test]
fn test_peer_sync_request_with_location() {
    let wire = json!({
        "messageType": "syncRequest",
        "recordingId": "2025-10-27-1430",
        "filename": "2025-10-27-1430.wav",
        "duration": 95.5,
        "fileSize": 3056044,
        "createdAt": "2025-10-27T14:30:00Z",
        "checksum": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        "location": { "latitude": 52.37, "longitude": 4.89, "placeName": "Amsterdam" }
    });

    let message = protocol::decode_bytes(wire.to_string().as_bytes()).unwrap();
    let ProtocolMessage::SyncRequest(request) = message else {
        panic!("expected syncRequest, got {:?}", message);
    };
    assert_eq!(request.recording_id, "2025-10-27-1430");
    assert_eq!(request.file_size, 3_056_044);
    assert_eq!(
        request.created_at,
        Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap()
    );
    let location = request.location.unwrap();
    assert_eq!(location.place_name.as_deref(), Some("Amsterdam"));
    assert_eq!(location.accuracy, None);
}

#[test]
fn test_accepted_defaults_to_foreground_receiver() {
    let wire = json!({
        "messageType": "syncAccepted",
        "recordingId": "rec-1",
        "accepted": true
    });

    match protocol::decode_bytes(wire.to_string().as_bytes()).unwrap() {
        ProtocolMessage::SyncAccepted(response) => {
            assert!(response.receiver_foreground);
            assert_eq!(response.retry_after, None);
        }
        other => panic!("expected syncAccepted, got {:?}", other),
    }
}

#[test]
fn test_rejection_carries_retry_after() {
    let wire = json!({
        "messageType": "syncRejected",
        "recordingId": "rec-1",
        "accepted": false,
        "reason": "app_not_ready",
        "retryAfter": 30.0
    });

    match protocol::decode_bytes(wire.to_string().as_bytes()).unwrap() {
        ProtocolMessage::SyncRejected(response) => {
            assert_eq!(response.reason.as_deref(), Some("app_not_ready"));
            assert_eq!(response.retry_after, Some(30.0));
        }
        other => panic!("expected syncRejected, got {:?}", other),
    }
}

#[test]
fn test_chunk_transfer_payload_is_base64() {
    let chunk = AudioChunk {
        chunk_id: "c-3".to_string(),
        session_id: "s-1".to_string(),
        sequence_number: 3,
        payload: vec![1, 2, 3, 4, 5, 6],
        duration: 0.5,
        format: AudioFormat::default(),
        is_last_chunk: true,
        captured_at: Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
    };

    let envelope =
        protocol::encode(&ProtocolMessage::AudioChunkTransfer(ChunkTransfer::from_chunk(&chunk)))
            .unwrap();
    assert_eq!(envelope["messageType"], "audioChunkTransfer");
    assert_eq!(envelope["isLastChunk"], true);
    assert_eq!(
        envelope["payload"],
        base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4, 5, 6])
    );

    let ProtocolMessage::AudioChunkTransfer(transfer) = protocol::decode(envelope).unwrap() else {
        panic!("expected audioChunkTransfer");
    };
    assert_eq!(transfer.into_chunk().unwrap(), chunk);
}

#[test]
fn test_non_object_bytes_are_rejected() {
    assert!(protocol::decode_bytes(b"[1, 2, 3]").is_err());
    assert!(protocol::decode_bytes(b"{ not json").is_err());
}

#[tokio::test]
async fn test_invalid_messages_are_dropped_and_service_keeps_running() -> Result<()> {
    let (mut wearable, phone_transport, _link) = MemoryTransport::pair();
    let _wearable_inbox = wearable.start().await?;
    let phone = SyncService::spawn(
        SyncConfig::default(),
        deps(phone_transport, None, plenty_of_storage()),
    )
    .await?;
    let mut events = phone.subscribe();
    wearable.announce_presence(AppLifecycle::Foreground).await?;
    wait_connected(&phone).await?;

    for garbage in [
        json!({ "messageType": "launchMissiles" }),
        json!({ "recordingId": "rec-1" }),
        json!({ "messageType": "syncComplete" }),
    ] {
        let serde_json::Value::Object(envelope) = garbage else {
            unreachable!();
        };
        wearable.send_message(envelope).await?;
    }

    let update = ProtocolMessage::PhoneStateUpdate(StateUpdate {
        recording_state: RecordingState::Processing,
        timestamp: Utc::now(),
    });
    wearable.send_message(protocol::encode(&update)?).await?;

    let changed = wait_for(&mut events, |e| matches!(e, SyncEvent::PeerStateChanged { .. })).await?;
    assert!(matches!(
        changed,
        SyncEvent::PeerStateChanged {
            state: RecordingState::Processing,
            ..
        }
    ));
    Ok(())
}
