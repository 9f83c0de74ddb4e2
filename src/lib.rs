pub mod audio;
pub mod clock;
pub mod config;
pub mod http;
pub mod protocol;
pub mod sync;
pub mod transport;

pub use audio::{AssembledAudio, AudioChunk, AudioFile, AudioFormat, ChunkAssembler};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SyncConfig};
pub use http::{create_router, AppState};
pub use protocol::{ProtocolMessage, SyncRequest};
pub use sync::{
    ArtifactMetadata, ArtifactSink, ConflictPolicy, DeviceRole, FileArtifactSink,
    QuotaStorageProbe, RecordingState, SyncDependencies, SyncError, SyncEvent, SyncService, SyncSnapshot,
};
pub use transport::{AppLifecycle, ConnectionState, MemoryTransport, NatsTransport, Transport};
