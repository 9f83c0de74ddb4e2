//! Conversion between typed protocol messages and the transport's key/value envelope.
//!
//! Decoding fails closed: an envelope without a known `messageType`, with
//! fields of the wrong shape, or with values that make no sense for the
//! protocol is rejected before it reaches the sync service.

use base64::Engine;
use serde_json::{Map, Value};
use thiserror::Error;

use super::messages::{
    ChunkTransfer, ProtocolMessage, SyncResponse, TransferMetadata, TRANSFER_TYPE_RECORDING,
};
use crate::audio::{AudioChunk, AudioFormat};

/// Generic key/value payload carried by the transport
pub type Envelope = Map<String, Value>;

pub const MESSAGE_TYPE_KEY: &str = "messageType";

/// Largest `sequenceNumber` a chunk may carry on the wire (a day of one-second chunks)
pub const MAX_SEQUENCE_NUMBER: u32 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("envelope has no messageType")]
    MissingMessageType,

    #[error("unknown messageType {0:?}")]
    UnknownMessageType(String),

    #[error("malformed {message_type} message: {reason}")]
    Malformed {
        message_type: String,
        reason: String,
    },

    #[error("invalid {message_type} message: {reason}")]
    Invalid {
        message_type: String,
        reason: String,
    },

    #[error("failed to encode {message_type}: {reason}")]
    Encode {
        message_type: String,
        reason: String,
    },
}

pub fn encode(message: &ProtocolMessage) -> Result<Envelope, CodecError> {
    match serde_json::to_value(message) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CodecError::Encode {
            message_type: message.message_type().to_string(),
            reason: "message did not serialize to an object".to_string(),
        }),
        Err(e) => Err(CodecError::Encode {
            message_type: message.message_type().to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn decode(envelope: Envelope) -> Result<ProtocolMessage, CodecError> {
    let message_type = match envelope.get(MESSAGE_TYPE_KEY) {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) | None => return Err(CodecError::MissingMessageType),
    };

    if !ProtocolMessage::MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(CodecError::UnknownMessageType(message_type));
    }

    let message: ProtocolMessage =
        serde_json::from_value(Value::Object(envelope)).map_err(|e| CodecError::Malformed {
            message_type: message_type.clone(),
            reason: e.to_string(),
        })?;

    validate(&message).map_err(|reason| CodecError::Invalid {
        message_type,
        reason,
    })?;

    Ok(message)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<ProtocolMessage, CodecError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(envelope)) => decode(envelope),
        Ok(_) => Err(CodecError::MissingMessageType),
        Err(e) => Err(CodecError::Malformed {
            message_type: "unknown".to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn encode_metadata(metadata: &TransferMetadata) -> Result<Envelope, CodecError> {
    match serde_json::to_value(metadata) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CodecError::Encode {
            message_type: "transferMetadata".to_string(),
            reason: "metadata did not serialize to an object".to_string(),
        }),
        Err(e) => Err(CodecError::Encode {
            message_type: "transferMetadata".to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn decode_metadata(envelope: Envelope) -> Result<TransferMetadata, CodecError> {
    let metadata: TransferMetadata =
        serde_json::from_value(Value::Object(envelope)).map_err(|e| CodecError::Malformed {
            message_type: "transferMetadata".to_string(),
            reason: e.to_string(),
        })?;

    if metadata.transfer_type != TRANSFER_TYPE_RECORDING {
        return Err(CodecError::Invalid {
            message_type: "transferMetadata".to_string(),
            reason: format!("unsupported transferType {:?}", metadata.transfer_type),
        });
    }
    if metadata.recording_id.is_empty() {
        return Err(CodecError::Invalid {
            message_type: "transferMetadata".to_string(),
            reason: "empty recordingId".to_string(),
        });
    }

    Ok(metadata)
}

impl ChunkTransfer {
    pub fn from_chunk(chunk: &AudioChunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            session_id: chunk.session_id.clone(),
            sequence_number: chunk.sequence_number,
            payload: base64::engine::general_purpose::STANDARD.encode(&chunk.payload),
            duration: chunk.duration,
            sample_rate: chunk.format.sample_rate,
            channels: chunk.format.channels,
            bit_depth: chunk.format.bit_depth,
            is_last_chunk: chunk.is_last_chunk,
            captured_at: chunk.captured_at,
        }
    }

    pub fn into_chunk(self) -> Result<AudioChunk, CodecError> {
        let payload = base64::engine::general_purpose::STANDARD
            .decode(&self.payload)
            .map_err(|e| CodecError::Invalid {
                message_type: "audioChunkTransfer".to_string(),
                reason: format!("payload is not base64: {}", e),
            })?;

        Ok(AudioChunk {
            chunk_id: self.chunk_id,
            session_id: self.session_id,
            sequence_number: self.sequence_number,
            payload,
            duration: self.duration,
            format: AudioFormat {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bit_depth: self.bit_depth,
            },
            is_last_chunk: self.is_last_chunk,
            captured_at: self.captured_at,
        })
    }
}

fn validate(message: &ProtocolMessage) -> Result<(), String> {
    match message {
        ProtocolMessage::SyncRequest(request) => {
            require_id("recordingId", &request.recording_id)?;
            if request.filename.is_empty() {
                return Err("empty filename".to_string());
            }
            if request.checksum.is_empty() {
                return Err("empty checksum".to_string());
            }
            if !request.duration.is_finite() || request.duration < 0.0 {
                return Err(format!("invalid duration {}", request.duration));
            }
            Ok(())
        }
        ProtocolMessage::SyncAccepted(response) => validate_response(response, true),
        ProtocolMessage::SyncRejected(response) => validate_response(response, false),
        ProtocolMessage::AudioChunkTransfer(chunk) => {
            require_id("chunkId", &chunk.chunk_id)?;
            require_id("sessionId", &chunk.session_id)?;
            if chunk.sequence_number > MAX_SEQUENCE_NUMBER {
                return Err(format!(
                    "sequenceNumber {} exceeds {}",
                    chunk.sequence_number, MAX_SEQUENCE_NUMBER
                ));
            }
            if chunk.sample_rate == 0 || chunk.channels == 0 {
                return Err("sampleRate and channels must be positive".to_string());
            }
            if !matches!(chunk.bit_depth, 8 | 16 | 24 | 32) {
                return Err(format!("unsupported bitDepth {}", chunk.bit_depth));
            }
            base64::engine::general_purpose::STANDARD
                .decode(&chunk.payload)
                .map_err(|e| format!("payload is not base64: {}", e))?;
            Ok(())
        }
        ProtocolMessage::ChunkAcknowledgment(ack) => {
            require_id("chunkId", &ack.chunk_id)?;
            require_id("sessionId", &ack.session_id)
        }
        ProtocolMessage::PhoneStateUpdate(_) | ProtocolMessage::RequestStateSync(_) => Ok(()),
        ProtocolMessage::SyncComplete(outcome) | ProtocolMessage::SyncFailed(outcome) => {
            require_id("recordingId", &outcome.recording_id)
        }
    }
}

fn validate_response(response: &SyncResponse, accepted: bool) -> Result<(), String> {
    require_id("recordingId", &response.recording_id)?;
    if response.accepted != accepted {
        return Err(format!(
            "accepted={} contradicts the message type",
            response.accepted
        ));
    }
    if !accepted && response.reason.as_deref().map_or(true, str::is_empty) {
        return Err("rejection without a reason".to_string());
    }
    Ok(())
}

fn require_id(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("empty {}", field))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{StateUpdate, SyncRequest};
    use crate::sync::RecordingState;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn sync_request_uses_camel_case_keys() {
        let message = ProtocolMessage::SyncRequest(SyncRequest {
            recording_id: "rec-1".to_string(),
            filename: "rec-1.wav".to_string(),
            duration: 12.5,
            file_size: 4096,
            created_at: Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
            checksum: "abc123".to_string(),
            location: None,
        });

        let encoded = encode(&message).unwrap();
        assert_eq!(encoded["messageType"], "syncRequest");
        assert_eq!(encoded["recordingId"], "rec-1");
        assert_eq!(encoded["fileSize"], 4096);
        assert!(!encoded.contains_key("location"));

        assert_eq!(decode(encoded).unwrap(), message);
    }

    #[test]
    fn state_update_carries_lowercase_state() {
        let message = ProtocolMessage::PhoneStateUpdate(StateUpdate {
            recording_state: RecordingState::Paused,
            timestamp: Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
        });

        let encoded = encode(&message).unwrap();
        assert_eq!(encoded["recordingState"], "paused");
    }

    #[test]
    fn missing_discriminator_is_rejected() {
        let err = decode(envelope(json!({ "recordingId": "rec-1" }))).unwrap_err();
        assert_eq!(err, CodecError::MissingMessageType);

        let err = decode(envelope(json!({ "messageType": 7 }))).unwrap_err();
        assert_eq!(err, CodecError::MissingMessageType);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let err = decode(envelope(json!({ "messageType": "launchMissiles" }))).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnknownMessageType("launchMissiles".to_string())
        );
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = decode(envelope(json!({
            "messageType": "syncComplete",
            "timestamp": "2025-10-27T14:30:00Z"
        })))
        .unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn accepted_flag_must_match_type() {
        let err = decode(envelope(json!({
            "messageType": "syncAccepted",
            "recordingId": "rec-1",
            "accepted": false
        })))
        .unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));
    }

    #[test]
    fn rejection_requires_reason() {
        let err = decode(envelope(json!({
            "messageType": "syncRejected",
            "recordingId": "rec-1",
            "accepted": false
        })))
        .unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));
    }

    #[test]
    fn chunk_payload_must_be_base64() {
        let err = decode(envelope(json!({
            "messageType": "audioChunkTransfer",
            "chunkId": "c-0",
            "sessionId": "s-1",
            "sequenceNumber": 0,
            "payload": "not base64!!",
            "duration": 1.0,
            "sampleRate": 16000,
            "channels": 1,
            "bitDepth": 16,
            "isLastChunk": false,
            "capturedAt": "2025-10-27T14:30:00Z"
        })))
        .unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));
    }

    #[test]
    fn chunk_sequence_number_is_bounded() {
        let chunk = |sequence: u64| {
            envelope(json!({
                "messageType": "audioChunkTransfer",
                "chunkId": "c-last",
                "sessionId": "s-1",
                "sequenceNumber": sequence,
                "payload": "AAAA",
                "duration": 1.0,
                "sampleRate": 16000,
                "channels": 1,
                "bitDepth": 16,
                "isLastChunk": true,
                "capturedAt": "2025-10-27T14:30:00Z"
            }))
        };

        assert!(decode(chunk(MAX_SEQUENCE_NUMBER as u64)).is_ok());
        let err = decode(chunk(u32::MAX as u64)).unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));
        // Past u32 the field no longer deserializes at all
        let err = decode(chunk(u32::MAX as u64 + 1)).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn metadata_requires_recording_transfer_type() {
        let err = decode_metadata(envelope(json!({
            "transferType": "photo",
            "recordingId": "rec-1",
            "filename": "a.wav",
            "duration": 1.0,
            "fileSize": 10,
            "createdAt": "2025-10-27T14:30:00Z"
        })))
        .unwrap_err();
        assert!(matches!(err, CodecError::Invalid { .. }));
    }
}
