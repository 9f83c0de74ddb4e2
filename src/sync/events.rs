use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::FailureReason;
use super::orchestrator::{Role, SyncPhase};
use super::state::{RecordingState, ResolutionRule, Winner};
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeSource {
    Local,
    ConflictResolution,
}

/// Everything the sync service reports to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectionChanged {
        state: ConnectionState,
    },
    PhaseChanged {
        recording_id: String,
        role: Role,
        phase: SyncPhase,
    },
    /// Terminal success; `confirmed` is false when the receiver persisted the
    /// artifact but could not deliver `syncComplete`
    TransferCompleted {
        recording_id: String,
        role: Role,
        confirmed: bool,
    },
    TransferFailed {
        recording_id: String,
        role: Role,
        reason: FailureReason,
        retry_after_secs: Option<f64>,
    },
    ChunkAcknowledged {
        session_id: String,
        sequence: u32,
    },
    ChunkDropped {
        session_id: String,
        sequence: u32,
    },
    ChunkSessionAssembled {
        session_id: String,
        degraded: bool,
        filled: Vec<u32>,
    },
    ChunkSessionFailed {
        session_id: String,
        reason: FailureReason,
    },
    ChunkSessionDiscarded {
        session_id: String,
    },
    LocalStateChanged {
        state: RecordingState,
        changed_at: DateTime<Utc>,
        source: StateChangeSource,
    },
    PeerStateChanged {
        state: RecordingState,
        changed_at: DateTime<Utc>,
    },
    ConflictResolved {
        local: RecordingState,
        peer: RecordingState,
        resolved: RecordingState,
        winner: Winner,
        rule: ResolutionRule,
    },
}
