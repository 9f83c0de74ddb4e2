use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::RecordingState;

/// Transfer-type discriminator carried in bulk file metadata
pub const TRANSFER_TYPE_RECORDING: &str = "recording";

/// Optional capture location attached to a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMetadata {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
}

/// Offer to transfer one finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub recording_id: String,
    pub filename: String,
    /// Recording length in seconds
    pub duration: f64,
    /// Size of the artifact in bytes
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the artifact bytes
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationMetadata>,
}

/// Receiver's answer to a [`SyncRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub recording_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Seconds the sender should wait before asking again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    /// False when the receiver accepted while backgrounded (reduced readiness)
    #[serde(default = "default_true")]
    pub receiver_foreground: bool,
}

fn default_true() -> bool {
    true
}

/// Audio chunk as it travels on the wire (payload base64-encoded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTransfer {
    pub chunk_id: String,
    pub session_id: String,
    pub sequence_number: u32,
    pub payload: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub is_last_chunk: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_id: String,
    pub sequence_number: u32,
    pub session_id: String,
}

/// Broadcast of the sender's recording state and when it last changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub recording_state: RecordingState,
    pub timestamp: DateTime<Utc>,
}

/// Asks the peer to answer with its own state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncRequest {
    pub local_state: RecordingState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub recording_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Closed set of messages exchanged between the two devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ProtocolMessage {
    SyncRequest(SyncRequest),
    SyncAccepted(SyncResponse),
    SyncRejected(SyncResponse),
    AudioChunkTransfer(ChunkTransfer),
    ChunkAcknowledgment(ChunkAck),
    PhoneStateUpdate(StateUpdate),
    RequestStateSync(StateSyncRequest),
    SyncComplete(SyncOutcome),
    SyncFailed(SyncOutcome),
}

impl ProtocolMessage {
    /// Wire discriminators, in declaration order
    pub const MESSAGE_TYPES: [&'static str; 9] = [
        "syncRequest",
        "syncAccepted",
        "syncRejected",
        "audioChunkTransfer",
        "chunkAcknowledgment",
        "phoneStateUpdate",
        "requestStateSync",
        "syncComplete",
        "syncFailed",
    ];

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "syncRequest",
            Self::SyncAccepted(_) => "syncAccepted",
            Self::SyncRejected(_) => "syncRejected",
            Self::AudioChunkTransfer(_) => "audioChunkTransfer",
            Self::ChunkAcknowledgment(_) => "chunkAcknowledgment",
            Self::PhoneStateUpdate(_) => "phoneStateUpdate",
            Self::RequestStateSync(_) => "requestStateSync",
            Self::SyncComplete(_) => "syncComplete",
            Self::SyncFailed(_) => "syncFailed",
        }
    }
}

/// Metadata attached to a bulk file transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub transfer_type: String,
    pub recording_id: String,
    pub filename: String,
    pub duration: f64,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationMetadata>,
}

impl TransferMetadata {
    pub fn for_request(request: &SyncRequest) -> Self {
        Self {
            transfer_type: TRANSFER_TYPE_RECORDING.to_string(),
            recording_id: request.recording_id.clone(),
            filename: request.filename.clone(),
            duration: request.duration,
            file_size: request.file_size,
            created_at: request.created_at,
            checksum: Some(request.checksum.clone()),
            location: request.location.clone(),
        }
    }

    /// Minimal request rebuilt on a receiver that lost (or never had) the original
    pub fn reconstruct_request(&self) -> SyncRequest {
        SyncRequest {
            recording_id: self.recording_id.clone(),
            filename: self.filename.clone(),
            duration: self.duration,
            file_size: self.file_size,
            created_at: self.created_at,
            checksum: self.checksum.clone().unwrap_or_default(),
            location: self.location.clone(),
        }
    }
}
