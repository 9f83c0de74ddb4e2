// Integration tests for the incremental chunk path
//
// Chunks arrive out of order, duplicated, or not at all; the phone must still
// produce one ordered artifact per session, gap-filled where audio is missing.

mod common;

use anyhow::Result;
use chrono::Utc;
use common::*;
use loqa_link::audio::{AudioChunk, AudioFormat, ChunkAssembler, GAP_FILL_SECS};
use loqa_link::protocol::{self, ChunkTransfer, ProtocolMessage};
use loqa_link::sync::{ArtifactOrigin, SyncEvent, SyncService};
use loqa_link::transport::{AppLifecycle, MemoryTransport, Transport};
use loqa_link::SyncConfig;
use std::collections::HashSet;
use std::sync::Arc;

fn chunk(session: &str, sequence: u32, last: bool) -> AudioChunk {
    AudioChunk {
        chunk_id: format!("{}-{}", session, sequence),
        session_id: session.to_string(),
        sequence_number: sequence,
        payload: vec![sequence as u8 + 1; 320 + sequence as usize],
        duration: 0.01,
        format: AudioFormat::default(),
        is_last_chunk: last,
        captured_at: Utc::now(),
    }
}

/// Deterministic shuffle so failures are reproducible
fn shuffled(mut items: Vec<u32>, seed: u64) -> Vec<u32> {
    let mut state = seed;
    for i in (1..items.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
    items
}

#[test]
fn test_any_permutation_with_duplicates_combines_fully() {
    let total = 12u32;
    let expected_len: usize = (0..total).map(|seq| 320 + seq as usize).sum();

    for seed in 1..=25u64 {
        let mut order: Vec<u32> = (0..total).collect();
        // Re-deliver a third of the chunks
        order.extend((0..total).filter(|seq| (seq + seed as u32) % 3 == 0));
        let order = shuffled(order, seed);

        let mut assembler = ChunkAssembler::new();
        for seq in order {
            assembler
                .add_chunk(chunk("s-perm", seq, seq == total - 1))
                .unwrap();
        }

        assert!(assembler.is_complete(), "seed {}", seed);
        assert_eq!(assembler.expected_total(), Some(total));
        let audio = assembler.combine().unwrap();
        assert_eq!(audio.bytes.len(), expected_len, "seed {}", seed);
        assert!(!audio.degraded);
        assert!(audio.filled.is_empty());
    }
}

#[test]
fn test_missing_chunks_are_silence_filled_in_place() {
    let total = 8u32;
    let missing: HashSet<u32> = [2, 5, 6].into_iter().collect();

    let mut assembler = ChunkAssembler::new();
    for seq in shuffled((0..total).collect(), 7) {
        if !missing.contains(&seq) {
            assembler
                .add_chunk(chunk("s-gap", seq, seq == total - 1))
                .unwrap();
        }
    }

    let mut expected_missing: Vec<u32> = missing.iter().copied().collect();
    expected_missing.sort();
    assert_eq!(assembler.missing_sequences(), expected_missing);

    let audio = assembler.combine().unwrap();
    let silence = AudioFormat::default().bytes_for_secs(GAP_FILL_SECS);
    let real: usize = (0..total)
        .filter(|seq| !missing.contains(seq))
        .map(|seq| 320 + seq as usize)
        .sum();

    assert_eq!(audio.filled, expected_missing);
    assert!(audio.degraded);
    assert_eq!(audio.bytes.len(), real + missing.len() * silence);

    // Chunk 3 follows chunks 0, 1 and one silence segment
    let offset = 320 + 321 + silence;
    assert_eq!(audio.bytes[offset], 4);
}

#[tokio::test]
async fn test_chunks_out_of_order_are_assembled_on_the_phone() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let mut pair = spawn_pair(SyncConfig::default(), Some(sink.clone()), plenty_of_storage()).await?;

    let total = 6u32;
    for seq in [3, 0, 5, 1, 1, 4, 2] {
        pair.wearable
            .send_chunk(chunk("s-live", seq, seq == total - 1))
            .await?;
    }

    let assembled = wait_for(&mut pair.phone_events, |e| {
        matches!(e, SyncEvent::ChunkSessionAssembled { .. })
    })
    .await?;
    assert_eq!(
        assembled,
        SyncEvent::ChunkSessionAssembled {
            session_id: "s-live".to_string(),
            degraded: false,
            filled: Vec::new(),
        }
    );

    let (bytes, metadata) = sink.first().expect("session persisted");
    let expected_len: usize = (0..total).map(|seq| 320 + seq as usize).sum();
    assert_eq!(bytes.len(), expected_len);
    assert_eq!(metadata.origin, ArtifactOrigin::Chunks);
    assert_eq!(metadata.format, Some(AudioFormat::default()));
    assert_eq!(sink.count(), 1);

    // Every chunk, duplicates included, gets acknowledged
    for _ in 0..100 {
        if pair.wearable.snapshot().await?.unacknowledged_chunks == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(pair.wearable.snapshot().await?.unacknowledged_chunks, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gap_fill_after_grace_period() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let mut pair = spawn_pair(SyncConfig::default(), Some(sink.clone()), plenty_of_storage()).await?;

    // Chunk 2 never leaves the wearable
    for seq in [0, 1, 3] {
        pair.wearable
            .send_chunk(chunk("s-lossy", seq, seq == 3))
            .await?;
    }

    let assembled = wait_for(&mut pair.phone_events, |e| {
        matches!(e, SyncEvent::ChunkSessionAssembled { .. })
    })
    .await?;
    assert_eq!(
        assembled,
        SyncEvent::ChunkSessionAssembled {
            session_id: "s-lossy".to_string(),
            degraded: true,
            filled: vec![2],
        }
    );

    let (bytes, metadata) = sink.first().expect("degraded session persisted");
    let silence = AudioFormat::default().bytes_for_secs(GAP_FILL_SECS);
    assert_eq!(bytes.len(), 320 + 321 + 323 + silence);
    assert!(metadata.degraded);
    assert_eq!(metadata.filled_sequences, vec![2]);
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_last_chunk_leaves_the_phone_running() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let config = SyncConfig {
        max_chunks_per_session: 16,
        ..SyncConfig::default()
    };
    let mut pair = spawn_pair(config, Some(sink.clone()), plenty_of_storage()).await?;

    // Refused by the codec, then by the session limit
    for sequence in [u32::MAX, 40] {
        let mut stray = chunk("s-huge", 0, true);
        stray.sequence_number = sequence;
        pair.wearable.send_chunk(stray).await?;
    }
    pair.wearable.send_chunk(chunk("s-ok", 0, true)).await?;

    let assembled = wait_for(&mut pair.phone_events, |e| {
        matches!(e, SyncEvent::ChunkSessionAssembled { .. })
    })
    .await?;
    assert_eq!(
        assembled,
        SyncEvent::ChunkSessionAssembled {
            session_id: "s-ok".to_string(),
            degraded: false,
            filled: Vec::new(),
        }
    );

    let snapshot = pair.phone.snapshot().await?;
    assert!(snapshot.chunk_session.is_none());
    assert_eq!(sink.count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_without_last_chunk_is_closed_after_inactivity() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let mut pair = spawn_pair(SyncConfig::default(), Some(sink.clone()), plenty_of_storage()).await?;

    // The wearable gave up on the last chunk; only 0 and 1 ever arrive
    for seq in [1, 0] {
        pair.wearable.send_chunk(chunk("s-cut", seq, false)).await?;
    }

    let assembled = wait_for(&mut pair.phone_events, |e| {
        matches!(e, SyncEvent::ChunkSessionAssembled { .. })
    })
    .await?;
    assert_eq!(
        assembled,
        SyncEvent::ChunkSessionAssembled {
            session_id: "s-cut".to_string(),
            degraded: true,
            filled: Vec::new(),
        }
    );

    let (bytes, metadata) = sink.first().expect("truncated session persisted");
    assert_eq!(bytes.len(), 320 + 321);
    assert!(metadata.degraded);
    assert!(pair.phone.snapshot().await?.chunk_session.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_chunk_is_retried_then_dropped() -> Result<()> {
    let (transport, mut phone, _link) = MemoryTransport::pair();
    let mut phone_inbox = phone.start().await?;
    let wearable = SyncService::spawn(
        SyncConfig::default(),
        deps(transport, None, plenty_of_storage()),
    )
    .await?;
    let mut events = wearable.subscribe();

    phone.announce_presence(AppLifecycle::Foreground).await?;
    wait_connected(&wearable).await?;

    wearable.send_chunk(chunk("s-deaf", 0, false)).await?;

    // The bare phone never acknowledges: one send plus two retries
    for _ in 0..SyncConfig::default().chunk_max_attempts {
        loop {
            if let ProtocolMessage::AudioChunkTransfer(transfer) =
                next_message(&mut phone_inbox).await?
            {
                assert_eq!(transfer.sequence_number, 0);
                break;
            }
        }
    }

    let dropped = wait_for(&mut events, |e| matches!(e, SyncEvent::ChunkDropped { .. })).await?;
    assert_eq!(
        dropped,
        SyncEvent::ChunkDropped {
            session_id: "s-deaf".to_string(),
            sequence: 0,
        }
    );
    assert_eq!(wearable.snapshot().await?.unacknowledged_chunks, 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_chunk_is_acknowledged_again() -> Result<()> {
    let (mut wearable, phone_transport, _link) = MemoryTransport::pair();
    let mut wearable_inbox = wearable.start().await?;
    let phone = SyncService::spawn(
        SyncConfig::default(),
        deps(phone_transport, None, plenty_of_storage()),
    )
    .await?;
    wearable.announce_presence(AppLifecycle::Foreground).await?;
    wait_connected(&phone).await?;

    let transfer = ProtocolMessage::AudioChunkTransfer(ChunkTransfer::from_chunk(&chunk(
        "s-dup", 0, false,
    )));
    for _ in 0..2 {
        wearable.send_message(protocol::encode(&transfer)?).await?;
        loop {
            if let ProtocolMessage::ChunkAcknowledgment(ack) =
                next_message(&mut wearable_inbox).await?
            {
                assert_eq!(ack.session_id, "s-dup");
                assert_eq!(ack.sequence_number, 0);
                break;
            }
        }
    }

    let snapshot = phone.snapshot().await?;
    let session = snapshot.chunk_session.expect("session buffered");
    assert_eq!(session.received, 1);
    assert_eq!(session.expected_total, None);
    Ok(())
}

#[tokio::test]
async fn test_new_session_discards_previous_buffer() -> Result<()> {
    let mut pair = spawn_pair(SyncConfig::default(), None, plenty_of_storage()).await?;

    pair.wearable.send_chunk(chunk("s-old", 0, false)).await?;
    pair.wearable.send_chunk(chunk("s-new", 0, false)).await?;

    let discarded = wait_for(&mut pair.phone_events, |e| {
        matches!(e, SyncEvent::ChunkSessionDiscarded { .. })
    })
    .await?;
    assert_eq!(
        discarded,
        SyncEvent::ChunkSessionDiscarded {
            session_id: "s-old".to_string(),
        }
    );
    Ok(())
}
