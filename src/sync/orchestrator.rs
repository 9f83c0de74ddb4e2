//! Per-recording sync operations and their state machine
//!
//! ```text
//! sender:   Idle -> ReadinessCheck -> RequestSent -> Transferring -> Done
//! receiver: Idle -> Transferring -> IntegrityCheck -> PersistPending -> ConfirmSent -> Done
//! any non-terminal phase -> Failed(reason)
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::error::{FailureReason, SyncError};
use crate::protocol::SyncRequest;
use crate::transport::AppLifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    /// Sender waiting for a link that can carry the request
    ReadinessCheck,
    RequestSent,
    Transferring,
    IntegrityCheck,
    PersistPending,
    ConfirmSent,
    Done,
    Failed(FailureReason),
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn can_advance_to(&self, next: &SyncPhase) -> bool {
        use SyncPhase::*;

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed(_)) => true,
            (Idle, ReadinessCheck | Transferring) => true,
            (ReadinessCheck, RequestSent) => true,
            (RequestSent, Transferring) => true,
            (Transferring, IntegrityCheck | Done) => true,
            (IntegrityCheck, PersistPending) => true,
            (PersistPending, ConfirmSent) => true,
            (ConfirmSent, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid sync transition for {recording_id}: cannot go from {from} to {to}")]
pub struct InvalidTransition {
    pub recording_id: String,
    pub from: SyncPhase,
    pub to: SyncPhase,
}

/// One in-flight transfer of a finished recording
#[derive(Debug)]
pub struct PendingSyncOperation {
    pub request: SyncRequest,
    pub role: Role,
    phase: SyncPhase,
    /// Artifact bytes held by the sender until the transfer is handed off
    pub payload: Option<Vec<u8>>,
    /// Deadline sizing: whether the receiving app was foregrounded when it accepted
    pub receiver_foreground: bool,
    /// Rebuilt from transfer metadata because no request was pending
    pub reconstructed: bool,
    pub confirmation_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl PendingSyncOperation {
    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn advance(&mut self, next: SyncPhase) -> Result<(), InvalidTransition> {
        if !self.phase.can_advance_to(&next) {
            return Err(InvalidTransition {
                recording_id: self.request.recording_id.clone(),
                from: self.phase.clone(),
                to: next,
            });
        }
        debug!(
            "{} {:?}: {} -> {}",
            self.request.recording_id, self.role, self.phase, next
        );
        self.phase = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub recording_id: String,
    pub role: Role,
    pub phase: SyncPhase,
    pub file_size: u64,
    pub reconstructed: bool,
    pub created_at: DateTime<Utc>,
}

/// Receiver's verdict on a sync request
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready {
        foreground: bool,
    },
    NotReady {
        reason: FailureReason,
        retry_after: Option<Duration>,
    },
}

/// Decide whether this device can take a transfer of `file_size` bytes right now
pub fn evaluate_readiness(
    lifecycle: AppLifecycle,
    available: Result<u64>,
    file_size: u64,
    reserve: u64,
    retry_after: Duration,
) -> Readiness {
    if !lifecycle.is_active() {
        return Readiness::NotReady {
            reason: FailureReason::AppNotReady,
            retry_after: Some(retry_after),
        };
    }

    let available = match available {
        Ok(available) => available,
        Err(e) => {
            warn!("Storage probe failed: {:#}", e);
            return Readiness::NotReady {
                reason: FailureReason::AppNotReady,
                retry_after: Some(retry_after),
            };
        }
    };

    if available < file_size.saturating_add(reserve) {
        return Readiness::NotReady {
            reason: FailureReason::InsufficientStorage,
            retry_after: None,
        };
    }

    Readiness::Ready {
        foreground: lifecycle == AppLifecycle::Foreground,
    }
}

/// Lowercase hex SHA-256 of an artifact
pub fn content_checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// All pending sync operations, keyed by recording ID
#[derive(Debug, Default)]
pub struct SyncOrchestrator {
    operations: HashMap<String, PendingSyncOperation>,
}

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound transfer in `ReadinessCheck`
    pub fn begin_outbound(
        &mut self,
        request: SyncRequest,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let recording_id = request.recording_id.clone();
        if self.operations.contains_key(&recording_id) {
            return Err(SyncError::AlreadyInFlight(recording_id));
        }

        let mut operation = PendingSyncOperation {
            request,
            role: Role::Sender,
            phase: SyncPhase::Idle,
            payload: Some(payload),
            receiver_foreground: true,
            reconstructed: false,
            confirmation_attempts: 0,
            created_at: now,
        };
        operation
            .advance(SyncPhase::ReadinessCheck)
            .map_err(|_| SyncError::AlreadyInFlight(recording_id.clone()))?;

        self.operations.insert(recording_id, operation);
        Ok(())
    }

    /// Register an accepted inbound transfer in `Transferring`.
    ///
    /// Returns false when the recording is already pending; the existing
    /// operation is left untouched.
    pub fn accept_inbound(
        &mut self,
        request: SyncRequest,
        receiver_foreground: bool,
        reconstructed: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if self.operations.contains_key(&request.recording_id) {
            return false;
        }

        let recording_id = request.recording_id.clone();
        let mut operation = PendingSyncOperation {
            request,
            role: Role::Receiver,
            phase: SyncPhase::Idle,
            payload: None,
            receiver_foreground,
            reconstructed,
            confirmation_attempts: 0,
            created_at: now,
        };
        if operation.advance(SyncPhase::Transferring).is_err() {
            return false;
        }

        self.operations.insert(recording_id, operation);
        true
    }

    pub fn get(&self, recording_id: &str) -> Option<&PendingSyncOperation> {
        self.operations.get(recording_id)
    }

    pub fn get_mut(&mut self, recording_id: &str) -> Option<&mut PendingSyncOperation> {
        self.operations.get_mut(recording_id)
    }

    pub fn remove(&mut self, recording_id: &str) -> Option<PendingSyncOperation> {
        self.operations.remove(recording_id)
    }

    pub fn contains(&self, recording_id: &str) -> bool {
        self.operations.contains_key(recording_id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// IDs of operations currently in `phase`
    pub fn in_phase(&self, phase: &SyncPhase) -> Vec<String> {
        self.operations
            .iter()
            .filter(|(_, op)| op.phase() == phase)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<OperationSummary> {
        let mut summaries: Vec<OperationSummary> = self
            .operations
            .values()
            .map(|op| OperationSummary {
                recording_id: op.request.recording_id.clone(),
                role: op.role,
                phase: op.phase().clone(),
                file_size: op.request.file_size,
                reconstructed: op.reconstructed,
                created_at: op.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }
}
