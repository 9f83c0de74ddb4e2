//! Device link transport
//!
//! - `Transport`: the bidirectional message + bulk file channel between the two devices
//! - `TransportSession`: connectivity state derived from link, peer presence and local lifecycle
//! - `NatsTransport`: NATS-backed link used by the binary
//! - `MemoryTransport`: in-process linked pair for tests and local simulation

mod memory;
mod nats;
mod session;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::protocol::Envelope;

pub use memory::{MemoryLink, MemoryTransport};
pub use nats::NatsTransport;
pub use session::{AppLifecycle, ConnectionState, TransportSession};

/// State of the underlying connection, independent of the peer application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Up,
    Down,
    Failed(String),
}

/// Everything the transport can deliver to the sync service
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Envelope),
    File { bytes: Vec<u8>, metadata: Envelope },
    Link(LinkStatus),
    PeerPresence(AppLifecycle),
    PeerLost,
}

/// Bidirectional link to the peer device
///
/// Implementations may deliver and send concurrently; the sync service funnels
/// every delivered event into its own mailbox.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering inbound events
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Send a small keyed message (requires the peer to be reachable)
    async fn send_message(&self, envelope: Envelope) -> Result<()>;

    /// Hand a whole artifact to the out-of-band bulk channel
    async fn transfer_file(&self, bytes: Vec<u8>, metadata: Envelope) -> Result<()>;

    /// Tell the peer which lifecycle phase this application is in
    async fn announce_presence(&self, lifecycle: AppLifecycle) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
