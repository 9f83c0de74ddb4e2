//! Recording transfer and recording-state synchronization between the two devices
//!
//! - `orchestrator`: per-recording handshake state machine and receiver readiness
//! - `state`: cross-device recording state with conflict resolution
//! - `timeout`: transfer deadlines and the keyed timer scheduler
//! - `lease`: background execution leases
//! - `sink` / `storage`: persistence boundary and storage headroom
//! - `service`: the actor tying it all together behind [`SyncService`]

pub mod error;
pub mod events;
pub mod lease;
pub mod orchestrator;
pub mod service;
pub mod sink;
pub mod state;
pub mod storage;
pub mod timeout;

pub use error::{FailureReason, SyncError};
pub use events::{StateChangeSource, SyncEvent};
pub use lease::{ExecutionLease, LeaseTable};
pub use orchestrator::{
    content_checksum, evaluate_readiness, OperationSummary, PendingSyncOperation, Readiness, Role,
    SyncOrchestrator, SyncPhase,
};
pub use service::{ChunkSessionSummary, SyncDependencies, SyncService, SyncSnapshot};
pub use sink::{ArtifactMetadata, ArtifactOrigin, ArtifactSink, FileArtifactSink};
pub use state::{
    resolve, ConflictPolicy, ConflictRecord, DeviceRole, PeerStateOutcome, RecordingState,
    Resolution, ResolutionRule, StateRecord, StateSynchronizer, Winner,
};
pub use storage::{FixedStorageProbe, QuotaStorageProbe, StorageProbe};
pub use timeout::{transfer_timeout, Scheduler, TimerFired, TimerKey};
