use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{LinkStatus, Transport};
use crate::protocol::{self, ProtocolMessage};
use crate::sync::SyncError;

/// Lifecycle phase of the application hosting one end of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppLifecycle {
    Launching,
    #[default]
    Foreground,
    Background,
    Terminating,
}

impl AppLifecycle {
    /// Running and able to process protocol traffic
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Foreground | Self::Background)
    }
}

/// Connectivity as seen by the sync service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    PeerAppInactive,
    LocalAppInactive,
    Error,
}

impl ConnectionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::PeerAppInactive => "peerAppInactive",
            Self::LocalAppInactive => "localAppInactive",
            Self::Error => "error",
        }
    }

    /// Keyed messages need a live peer
    pub fn allows_messages(&self) -> bool {
        *self == Self::Connected
    }

    /// The bulk channel queues files for a peer whose app is not running
    pub fn allows_file_transfer(&self) -> bool {
        matches!(self, Self::Connected | Self::PeerAppInactive)
    }

    pub fn derive(link: &LinkStatus, local: AppLifecycle, peer: Option<AppLifecycle>) -> Self {
        match link {
            LinkStatus::Failed(_) => Self::Error,
            LinkStatus::Down => Self::Disconnected,
            LinkStatus::Connecting => Self::Connecting,
            LinkStatus::Up if !local.is_active() => Self::LocalAppInactive,
            LinkStatus::Up => match peer {
                Some(peer) if peer.is_active() => Self::Connected,
                _ => Self::PeerAppInactive,
            },
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wraps the transport and gates every outbound message on connectivity
pub struct TransportSession {
    transport: Arc<dyn Transport>,
    link: LinkStatus,
    local: AppLifecycle,
    peer: Option<AppLifecycle>,
    state: ConnectionState,
}

impl TransportSession {
    pub fn new(transport: Arc<dyn Transport>, local: AppLifecycle) -> Self {
        let link = LinkStatus::Connecting;
        let state = ConnectionState::derive(&link, local, None);
        Self {
            transport,
            link,
            local,
            peer: None,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_lifecycle(&self) -> AppLifecycle {
        self.local
    }

    pub fn peer_lifecycle(&self) -> Option<AppLifecycle> {
        self.peer
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Returns the new state when the link change altered connectivity
    pub fn on_link(&mut self, link: LinkStatus) -> Option<ConnectionState> {
        if let LinkStatus::Down | LinkStatus::Failed(_) = link {
            self.peer = None;
        }
        self.link = link;
        self.recompute()
    }

    pub fn on_peer_presence(&mut self, peer: AppLifecycle) -> Option<ConnectionState> {
        self.peer = Some(peer);
        self.recompute()
    }

    pub fn on_peer_lost(&mut self) -> Option<ConnectionState> {
        self.peer = None;
        self.recompute()
    }

    pub fn set_local_lifecycle(&mut self, local: AppLifecycle) -> Option<ConnectionState> {
        self.local = local;
        self.recompute()
    }

    fn recompute(&mut self) -> Option<ConnectionState> {
        let next = ConnectionState::derive(&self.link, self.local, self.peer);
        if next == self.state {
            return None;
        }
        info!("Connection state {} -> {}", self.state, next);
        self.state = next;
        Some(next)
    }

    /// Encode and send a protocol message to the peer
    pub async fn send(&self, message: &ProtocolMessage) -> Result<(), SyncError> {
        if !self.state.allows_messages() {
            debug!(
                "Not sending {} while {}",
                message.message_type(),
                self.state
            );
            return Err(SyncError::ConnectionUnavailable(self.state));
        }

        let envelope = protocol::encode(message)?;

        self.transport.send_message(envelope).await.map_err(|e| {
            debug!("{} send of {} failed: {:#}", self.transport.name(), message.message_type(), e);
            SyncError::ConnectionUnavailable(self.state)
        })
    }

    /// Answer a message the peer just sent.
    ///
    /// Only needs the link: the peer is evidently listening, and a local app
    /// that is still launching must be able to say so.
    pub async fn reply(&self, message: &ProtocolMessage) -> Result<(), SyncError> {
        if self.link != LinkStatus::Up {
            return Err(SyncError::ConnectionUnavailable(self.state));
        }

        let envelope = protocol::encode(message)?;

        self.transport.send_message(envelope).await.map_err(|e| {
            debug!("{} reply {} failed: {:#}", self.transport.name(), message.message_type(), e);
            SyncError::ConnectionUnavailable(self.state)
        })
    }

    /// Announce the local lifecycle to the peer, best effort
    pub async fn announce(&self) {
        if let Err(e) = self.transport.announce_presence(self.local).await {
            debug!("Presence announcement failed: {:#}", e);
        }
    }
}
