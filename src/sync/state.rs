//! Cross-device recording state synchronization
//!
//! Each side keeps its own latest state, the peer's latest known state, and
//! when each last changed. A disagreement is a conflict, resolved on the spot:
//!
//! - while either side is `recording` or `paused` the smart ladder decides
//!   (active recording, then error, then processing, then recency)
//! - otherwise the configured [`ConflictPolicy`] decides
//!
//! The smart ladder always takes precedence over the configured policy.
//! Policies name a device role rather than "local" or "peer", so both ends
//! evaluating the same configuration pick the same winner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Paused,
    Stopping,
    Processing,
    Error,
}

impl RecordingState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    /// States that protect an in-progress capture
    pub fn is_recording_related(&self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }

    /// Deterministic order used only to break exact timestamp ties
    fn tie_rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Paused => 1,
            Self::Stopping => 2,
            Self::Processing => 3,
            Self::Recording => 4,
            Self::Error => 5,
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which end of the link a service runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Wearable,
    #[default]
    Phone,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wearable => write!(f, "wearable"),
            Self::Phone => write!(f, "phone"),
        }
    }
}

/// Resolution used when neither side is recording or paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    WearableWins,
    PhoneWins,
    #[default]
    MostRecent,
}

/// A state and the moment it was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: RecordingState,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    ActiveRecording,
    Error,
    Processing,
    MostRecent,
    Policy(ConflictPolicy),
}

/// Transient record of a disagreement between the two sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRecord {
    pub local: StateRecord,
    pub peer: StateRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Winner,
    pub state: RecordingState,
    pub rule: ResolutionRule,
}

/// What handling a peer state message produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerStateOutcome {
    pub conflict: Option<(ConflictRecord, Resolution)>,
    /// Local state was overwritten by the peer's
    pub local_changed: bool,
    /// State to (re-)broadcast to the peer
    pub broadcast: Option<StateRecord>,
}

pub struct StateSynchronizer {
    local: StateRecord,
    peer: Option<StateRecord>,
    policy: ConflictPolicy,
    role: DeviceRole,
    broadcast_pending: bool,
    last_contested: Option<StateRecord>,
}

impl StateSynchronizer {
    pub fn new(policy: ConflictPolicy, role: DeviceRole, now: DateTime<Utc>) -> Self {
        Self {
            local: StateRecord {
                state: RecordingState::Idle,
                changed_at: now,
            },
            peer: None,
            policy,
            role,
            broadcast_pending: false,
            last_contested: None,
        }
    }

    pub fn local(&self) -> StateRecord {
        self.local
    }

    pub fn peer(&self) -> Option<StateRecord> {
        self.peer
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Record a local change; returns the record to broadcast, if the state changed
    pub fn set_local_state(&mut self, state: RecordingState, now: DateTime<Utc>) -> Option<StateRecord> {
        if state == self.local.state {
            return None;
        }

        info!("Local recording state {} -> {}", self.local.state, state);
        self.local = StateRecord {
            state,
            changed_at: now,
        };
        self.last_contested = None;
        self.broadcast_pending = true;
        Some(self.local)
    }

    /// The local state still owed to the peer after a failed send
    pub fn pending_broadcast(&self) -> Option<StateRecord> {
        self.broadcast_pending.then_some(self.local)
    }

    pub fn mark_broadcast(&mut self, delivered: bool) {
        self.broadcast_pending = !delivered;
    }

    pub fn on_peer_state_message(
        &mut self,
        state: RecordingState,
        timestamp: DateTime<Utc>,
    ) -> PeerStateOutcome {
        let incoming = StateRecord {
            state,
            changed_at: timestamp,
        };

        if let Some(known) = self.peer {
            if incoming.changed_at < known.changed_at {
                debug!(
                    "Ignoring stale peer state {} from {} (known {} from {})",
                    incoming.state, incoming.changed_at, known.state, known.changed_at
                );
                return PeerStateOutcome::default();
            }
        }

        let repeated = self.last_contested == Some(incoming);
        self.peer = Some(incoming);

        if incoming.state == self.local.state {
            self.last_contested = None;
            return PeerStateOutcome::default();
        }

        let Some(resolution) = self.resolve_conflict() else {
            return PeerStateOutcome::default();
        };

        let conflict = ConflictRecord {
            local: self.local,
            peer: incoming,
        };

        info!(
            "Recording state conflict: local {} vs peer {} -> {} wins ({:?}) with {}",
            conflict.local.state, conflict.peer.state, resolution.state, resolution.rule,
            match resolution.winner {
                Winner::Local => "local",
                Winner::Peer => "peer",
            }
        );

        match resolution.winner {
            Winner::Peer => {
                self.local = incoming;
                self.last_contested = None;
                self.broadcast_pending = true;
                PeerStateOutcome {
                    conflict: Some((conflict, resolution)),
                    local_changed: true,
                    broadcast: Some(self.local),
                }
            }
            Winner::Local => {
                self.last_contested = Some(incoming);
                if repeated {
                    debug!("Peer repeated a contested state; not re-broadcasting");
                    return PeerStateOutcome {
                        conflict: Some((conflict, resolution)),
                        local_changed: false,
                        broadcast: None,
                    };
                }
                self.broadcast_pending = true;
                PeerStateOutcome {
                    conflict: Some((conflict, resolution)),
                    local_changed: false,
                    broadcast: Some(self.local),
                }
            }
        }
    }

    /// Decide the current conflict, if any
    pub fn resolve_conflict(&self) -> Option<Resolution> {
        let peer = self.peer?;
        if peer.state == self.local.state {
            return None;
        }
        Some(resolve(self.local, peer, self.policy, self.role))
    }
}

/// Conflict resolution between two differing records, seen from a device in `role`
pub fn resolve(
    local: StateRecord,
    peer: StateRecord,
    policy: ConflictPolicy,
    role: DeviceRole,
) -> Resolution {
    use RecordingState::*;

    let pick = |winner: Winner, rule: ResolutionRule| Resolution {
        winner,
        state: match winner {
            Winner::Local => local.state,
            Winner::Peer => peer.state,
        },
        rule,
    };
    let side_in = |state: RecordingState| {
        if local.state == state {
            Some(Winner::Local)
        } else if peer.state == state {
            Some(Winner::Peer)
        } else {
            None
        }
    };

    if local.state.is_recording_related() || peer.state.is_recording_related() {
        let error_side = side_in(Error);

        if error_side.is_none() && (local.state == Recording) != (peer.state == Recording) {
            if let Some(winner) = side_in(Recording) {
                return pick(winner, ResolutionRule::ActiveRecording);
            }
        }
        if let Some(winner) = error_side {
            return pick(winner, ResolutionRule::Error);
        }
        if let Some(winner) = side_in(Processing) {
            return pick(winner, ResolutionRule::Processing);
        }
        return pick(most_recent(local, peer), ResolutionRule::MostRecent);
    }

    let side_of = |device: DeviceRole| {
        if device == role {
            Winner::Local
        } else {
            Winner::Peer
        }
    };
    let winner = match policy {
        ConflictPolicy::WearableWins => side_of(DeviceRole::Wearable),
        ConflictPolicy::PhoneWins => side_of(DeviceRole::Phone),
        ConflictPolicy::MostRecent => most_recent(local, peer),
    };
    pick(winner, ResolutionRule::Policy(policy))
}

fn most_recent(local: StateRecord, peer: StateRecord) -> Winner {
    match local.changed_at.cmp(&peer.changed_at) {
        std::cmp::Ordering::Greater => Winner::Local,
        std::cmp::Ordering::Less => Winner::Peer,
        std::cmp::Ordering::Equal => {
            if local.state.tie_rank() >= peer.state.tie_rank() {
                Winner::Local
            } else {
                Winner::Peer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 27, 14, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn record(state: RecordingState, secs: i64) -> StateRecord {
        StateRecord {
            state,
            changed_at: at(secs),
        }
    }

    #[test]
    fn recording_beats_idle() {
        let resolution = resolve(
            record(RecordingState::Recording, 0),
            record(RecordingState::Idle, 10),
            ConflictPolicy::WearableWins,
            DeviceRole::Phone,
        );
        assert_eq!(resolution.winner, Winner::Local);
        assert_eq!(resolution.state, RecordingState::Recording);
        assert_eq!(resolution.rule, ResolutionRule::ActiveRecording);
    }

    #[test]
    fn error_beats_peer_recording() {
        let resolution = resolve(
            record(RecordingState::Error, 0),
            record(RecordingState::Recording, 10),
            ConflictPolicy::MostRecent,
            DeviceRole::Phone,
        );
        assert_eq!(resolution.state, RecordingState::Error);
        assert_eq!(resolution.winner, Winner::Local);
    }

    #[test]
    fn both_sides_agree_on_the_same_winner() {
        let a = record(RecordingState::Recording, 5);
        let b = record(RecordingState::Error, 3);

        let from_a = resolve(a, b, ConflictPolicy::MostRecent, DeviceRole::Wearable);
        let from_b = resolve(b, a, ConflictPolicy::MostRecent, DeviceRole::Phone);
        assert_eq!(from_a.state, from_b.state);
        assert_eq!(from_a.state, RecordingState::Error);
    }

    #[test]
    fn every_policy_picks_one_state_from_both_ends() {
        let wearable = record(RecordingState::Processing, 4);
        let phone = record(RecordingState::Stopping, 8);

        for policy in [
            ConflictPolicy::WearableWins,
            ConflictPolicy::PhoneWins,
            ConflictPolicy::MostRecent,
        ] {
            let on_wearable = resolve(wearable, phone, policy, DeviceRole::Wearable);
            let on_phone = resolve(phone, wearable, policy, DeviceRole::Phone);
            assert_eq!(on_wearable.state, on_phone.state, "{:?}", policy);
            assert_ne!(on_wearable.winner, on_phone.winner, "{:?}", policy);
        }
    }

    #[test]
    fn processing_beats_paused() {
        let resolution = resolve(
            record(RecordingState::Paused, 10),
            record(RecordingState::Processing, 0),
            ConflictPolicy::PhoneWins,
            DeviceRole::Phone,
        );
        assert_eq!(resolution.state, RecordingState::Processing);
        assert_eq!(resolution.rule, ResolutionRule::Processing);
    }

    #[test]
    fn paused_vs_stopping_falls_to_recency() {
        let resolution = resolve(
            record(RecordingState::Paused, 10),
            record(RecordingState::Stopping, 20),
            ConflictPolicy::PhoneWins,
            DeviceRole::Phone,
        );
        assert_eq!(resolution.winner, Winner::Peer);
        assert_eq!(resolution.rule, ResolutionRule::MostRecent);
    }

    #[test]
    fn default_policy_applies_without_active_recording() {
        let local = record(RecordingState::Idle, 20);
        let peer = record(RecordingState::Processing, 10);

        let on_phone = |policy| resolve(local, peer, policy, DeviceRole::Phone).winner;

        assert_eq!(on_phone(ConflictPolicy::PhoneWins), Winner::Local);
        assert_eq!(on_phone(ConflictPolicy::WearableWins), Winner::Peer);
        assert_eq!(on_phone(ConflictPolicy::MostRecent), Winner::Local);
    }

    #[test]
    fn local_change_is_broadcast_once() {
        let mut sync = StateSynchronizer::new(ConflictPolicy::MostRecent, DeviceRole::Phone, at(0));
        assert!(sync.set_local_state(RecordingState::Recording, at(1)).is_some());
        assert!(sync.set_local_state(RecordingState::Recording, at(2)).is_none());

        assert!(sync.pending_broadcast().is_some());
        sync.mark_broadcast(true);
        assert!(sync.pending_broadcast().is_none());
    }

    #[test]
    fn losing_side_adopts_winner_and_rebroadcasts() {
        let mut sync = StateSynchronizer::new(ConflictPolicy::MostRecent, DeviceRole::Phone, at(0));

        let outcome = sync.on_peer_state_message(RecordingState::Recording, at(5));

        assert!(outcome.local_changed);
        assert_eq!(sync.local().state, RecordingState::Recording);
        assert_eq!(sync.local().changed_at, at(5));
        assert_eq!(outcome.broadcast.map(|r| r.state), Some(RecordingState::Recording));
        assert!(sync.resolve_conflict().is_none());
    }

    #[test]
    fn winning_side_rebroadcasts_to_peer() {
        let mut sync = StateSynchronizer::new(ConflictPolicy::MostRecent, DeviceRole::Phone, at(0));
        sync.set_local_state(RecordingState::Recording, at(1));
        sync.mark_broadcast(true);

        let outcome = sync.on_peer_state_message(RecordingState::Idle, at(9));

        assert!(!outcome.local_changed);
        assert_eq!(sync.local().state, RecordingState::Recording);
        assert_eq!(outcome.broadcast.map(|r| r.state), Some(RecordingState::Recording));
    }

    #[test]
    fn repeated_contested_state_is_not_rebroadcast() {
        let mut sync = StateSynchronizer::new(ConflictPolicy::PhoneWins, DeviceRole::Phone, at(0));
        sync.set_local_state(RecordingState::Stopping, at(1));

        assert!(sync
            .on_peer_state_message(RecordingState::Processing, at(2))
            .broadcast
            .is_some());
        assert!(sync
            .on_peer_state_message(RecordingState::Processing, at(2))
            .broadcast
            .is_none());
    }

    #[test]
    fn stale_peer_message_is_ignored() {
        let mut sync = StateSynchronizer::new(ConflictPolicy::MostRecent, DeviceRole::Phone, at(0));
        sync.on_peer_state_message(RecordingState::Processing, at(10));

        let outcome = sync.on_peer_state_message(RecordingState::Recording, at(5));
        assert_eq!(outcome, PeerStateOutcome::default());
        assert_eq!(sync.peer().map(|r| r.state), Some(RecordingState::Processing));
    }
}
