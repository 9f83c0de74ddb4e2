//! The sync service: one actor owning every piece of mutable protocol state
//!
//! - API calls arrive as [`Command`]s through the [`SyncService`] handle
//! - transport deliveries, timer expiries and finished background work
//!   (bulk sends, persistence) are funneled into the same `select!` loop
//! - every operation ends exactly once, through `finish_operation` or
//!   `fail_operation`, which release its timers and lease

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::error::{FailureReason, SyncError};
use super::events::{StateChangeSource, SyncEvent};
use super::lease::LeaseTable;
use super::orchestrator::{
    content_checksum, evaluate_readiness, OperationSummary, Readiness, Role, SyncOrchestrator,
    SyncPhase,
};
use super::sink::{ArtifactMetadata, ArtifactSink};
use super::state::{PeerStateOutcome, RecordingState, StateRecord, StateSynchronizer};
use super::storage::StorageProbe;
use super::timeout::{transfer_timeout, Scheduler, TimerFired, TimerKey};
use crate::audio::{AudioChunk, AudioFile, ChunkAssembler};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::protocol::{
    self, ChunkAck, ChunkTransfer, ProtocolMessage, StateSyncRequest, StateUpdate, SyncOutcome,
    SyncRequest, SyncResponse, TransferMetadata,
};
use crate::transport::{
    AppLifecycle, ConnectionState, LinkStatus, Transport, TransportEvent, TransportSession,
};

const EVENT_CAPACITY: usize = 256;

/// Finished sessions remembered so late retransmissions are acknowledged, not re-assembled
const COMPLETED_SESSION_MEMORY: usize = 32;

/// Collaborators injected into the service
pub struct SyncDependencies {
    pub transport: Box<dyn Transport>,
    /// Persistence boundary; may also be registered later
    pub sink: Option<Arc<dyn ArtifactSink>>,
    pub storage: Arc<dyn StorageProbe>,
    pub clock: Arc<dyn Clock>,
}

/// Point-in-time view of the service
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub connection: ConnectionState,
    pub local_lifecycle: AppLifecycle,
    pub peer_lifecycle: Option<AppLifecycle>,
    pub local_state: StateRecord,
    pub peer_state: Option<StateRecord>,
    pub operations: Vec<OperationSummary>,
    pub chunk_session: Option<ChunkSessionSummary>,
    pub unacknowledged_chunks: usize,
    pub sink_registered: bool,
    pub active_leases: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSessionSummary {
    pub session_id: String,
    pub received: usize,
    pub expected_total: Option<u32>,
    pub missing: Vec<u32>,
}

enum Command {
    StartSync {
        request: SyncRequest,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    SendChunk {
        chunk: AudioChunk,
        reply: oneshot::Sender<()>,
    },
    SetLocalState {
        state: RecordingState,
        reply: oneshot::Sender<StateRecord>,
    },
    SetLifecycle {
        lifecycle: AppLifecycle,
        reply: oneshot::Sender<ConnectionState>,
    },
    Cancel {
        recording_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    RegisterSink {
        sink: Arc<dyn ArtifactSink>,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SyncSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results of work the actor handed to spawned tasks
enum Completion {
    FileSent {
        recording_id: String,
        result: Result<(), String>,
    },
    Persisted {
        recording_id: String,
        result: Result<()>,
    },
    ChunksPersisted {
        session_id: String,
        degraded: bool,
        filled: Vec<u32>,
        result: Result<()>,
    },
}

struct OutboundChunk {
    chunk: AudioChunk,
    attempts: u32,
}

/// Cloneable handle to the running sync actor
#[derive(Clone)]
pub struct SyncService {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncService {
    /// Start the transport and spawn the actor
    pub async fn spawn(config: SyncConfig, deps: SyncDependencies) -> Result<Self> {
        let SyncDependencies {
            mut transport,
            sink,
            storage,
            clock,
        } = deps;

        let transport_events = transport
            .start()
            .await
            .with_context(|| format!("Failed to start {} transport", transport.name()))?;
        let transport: Arc<dyn Transport> = Arc::from(transport);
        info!(
            "Sync service starting as {} on {} transport",
            config.role,
            transport.name()
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (scheduler, timers_rx) = Scheduler::new();

        let actor = SyncActor {
            session: TransportSession::new(transport, AppLifecycle::Foreground),
            orchestrator: SyncOrchestrator::new(),
            states: StateSynchronizer::new(config.conflict_policy, config.role, clock.now()),
            assembler: ChunkAssembler::with_limit(config.max_chunks_per_session),
            completed_sessions: VecDeque::new(),
            outbound_chunks: HashMap::new(),
            leases: LeaseTable::new(config.background_lease()),
            scheduler,
            events: events_tx.clone(),
            completions: completions_tx,
            config,
            sink,
            storage,
            clock,
        };

        tokio::spawn(actor.run(commands_rx, transport_events, timers_rx, completions_rx));

        Ok(Self {
            commands: commands_tx,
            events: events_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| SyncError::ServiceStopped)?;
        rx.await.map_err(|_| SyncError::ServiceStopped)
    }

    /// Offer a finished recording to the peer
    pub async fn start_sync(&self, request: SyncRequest, bytes: Vec<u8>) -> Result<(), SyncError> {
        self.call(|reply| Command::StartSync {
            request,
            bytes,
            reply,
        })
        .await?
    }

    /// Probe a WAV recording on disk and start syncing it
    pub async fn sync_file(&self, path: impl AsRef<Path>) -> Result<SyncRequest> {
        let path = path.as_ref().to_path_buf();
        let audio = tokio::task::spawn_blocking(move || AudioFile::open(&path))
            .await
            .context("Recording probe panicked")??;

        let recording_id = Path::new(&audio.filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let request = SyncRequest {
            recording_id,
            filename: audio.filename.clone(),
            duration: audio.duration_seconds,
            file_size: audio.bytes.len() as u64,
            created_at: audio.created_at,
            checksum: content_checksum(&audio.bytes),
            location: None,
        };

        self.start_sync(request.clone(), audio.bytes).await?;
        Ok(request)
    }

    /// Send one chunk on the incremental path; unacknowledged chunks are retried
    pub async fn send_chunk(&self, chunk: AudioChunk) -> Result<(), SyncError> {
        self.call(|reply| Command::SendChunk { chunk, reply }).await
    }

    pub async fn set_local_state(&self, state: RecordingState) -> Result<StateRecord, SyncError> {
        self.call(|reply| Command::SetLocalState { state, reply })
            .await
    }

    pub async fn set_lifecycle(&self, lifecycle: AppLifecycle) -> Result<ConnectionState, SyncError> {
        self.call(|reply| Command::SetLifecycle { lifecycle, reply })
            .await
    }

    pub async fn cancel(&self, recording_id: &str) -> Result<(), SyncError> {
        let recording_id = recording_id.to_string();
        self.call(|reply| Command::Cancel {
            recording_id,
            reply,
        })
        .await?
    }

    pub async fn register_sink(&self, sink: Arc<dyn ArtifactSink>) -> Result<(), SyncError> {
        self.call(|reply| Command::RegisterSink { sink, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// Cancel everything in flight and stop the actor
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

struct SyncActor {
    config: SyncConfig,
    session: TransportSession,
    sink: Option<Arc<dyn ArtifactSink>>,
    storage: Arc<dyn StorageProbe>,
    clock: Arc<dyn Clock>,
    orchestrator: SyncOrchestrator,
    states: StateSynchronizer,
    assembler: ChunkAssembler,
    completed_sessions: VecDeque<String>,
    outbound_chunks: HashMap<(String, u32), OutboundChunk>,
    scheduler: Scheduler,
    leases: LeaseTable,
    events: broadcast::Sender<SyncEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl SyncActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("All service handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport(event).await,
                Some(fired) = timers.recv() => self.handle_timer(fired).await,
                Some(completion) = completions.recv() => self.handle_completion(completion).await,
            }
        }
        info!("Sync service stopped");
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Returns false once the actor should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartSync {
                request,
                bytes,
                reply,
            } => {
                let _ = reply.send(self.start_outbound(request, bytes).await);
            }
            Command::SendChunk { chunk, reply } => {
                self.send_chunk(chunk).await;
                let _ = reply.send(());
            }
            Command::SetLocalState { state, reply } => {
                let now = self.clock.now();
                if let Some(record) = self.states.set_local_state(state, now) {
                    self.emit(SyncEvent::LocalStateChanged {
                        state: record.state,
                        changed_at: record.changed_at,
                        source: StateChangeSource::Local,
                    });
                    self.broadcast_state().await;
                }
                let _ = reply.send(self.states.local());
            }
            Command::SetLifecycle { lifecycle, reply } => {
                self.set_lifecycle(lifecycle).await;
                let _ = reply.send(self.session.state());
            }
            Command::Cancel {
                recording_id,
                reply,
            } => {
                let result = if self.orchestrator.contains(&recording_id) {
                    self.fail_operation(&recording_id, SyncError::Cancelled, true)
                        .await;
                    Ok(())
                } else {
                    Err(SyncError::UnknownRecording(recording_id))
                };
                let _ = reply.send(result);
            }
            Command::RegisterSink { sink, reply } => {
                info!("Artifact sink registered");
                self.sink = Some(sink);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn snapshot(&self) -> SyncSnapshot {
        let chunk_session = self
            .assembler
            .session_id()
            .map(|session_id| ChunkSessionSummary {
                session_id: session_id.to_string(),
                received: self.assembler.received_count(),
                expected_total: self.assembler.expected_total(),
                missing: self.assembler.missing_sequences(),
            });

        SyncSnapshot {
            connection: self.session.state(),
            local_lifecycle: self.session.local_lifecycle(),
            peer_lifecycle: self.session.peer_lifecycle(),
            local_state: self.states.local(),
            peer_state: self.states.peer(),
            operations: self.orchestrator.summaries(),
            chunk_session,
            unacknowledged_chunks: self.outbound_chunks.len(),
            sink_registered: self.sink.is_some(),
            active_leases: self.leases.len(),
        }
    }

    async fn shutdown(&mut self) {
        for recording_id in self.orchestrator.ids() {
            self.fail_operation(&recording_id, SyncError::Cancelled, true)
                .await;
        }
        self.outbound_chunks.clear();
        self.scheduler.cancel_where(|_| true);
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Link(status) => {
                let up = status == LinkStatus::Up;
                if let Some(state) = self.session.on_link(status) {
                    self.on_connection_change(state).await;
                }
                if up {
                    self.session.announce().await;
                }
            }
            TransportEvent::PeerPresence(lifecycle) => {
                let first_contact = self.session.peer_lifecycle().is_none();
                if let Some(state) = self.session.on_peer_presence(lifecycle) {
                    self.on_connection_change(state).await;
                }
                if first_contact {
                    self.session.announce().await;
                }
            }
            TransportEvent::PeerLost => {
                if let Some(state) = self.session.on_peer_lost() {
                    self.on_connection_change(state).await;
                }
            }
            TransportEvent::Message(envelope) => match protocol::decode(envelope) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => warn!("Dropping message from peer: {}", e),
            },
            TransportEvent::File { bytes, metadata } => self.handle_file(bytes, metadata).await,
        }
    }

    async fn on_connection_change(&mut self, state: ConnectionState) {
        self.emit(SyncEvent::ConnectionChanged { state });

        match state {
            ConnectionState::Connected => {
                self.broadcast_state().await;

                let local = self.states.local();
                let request = ProtocolMessage::RequestStateSync(StateSyncRequest {
                    local_state: local.state,
                    timestamp: local.changed_at,
                });
                if let Err(e) = self.session.send(&request).await {
                    debug!("State sync request not sent: {}", e);
                }

                for recording_id in self.orchestrator.in_phase(&SyncPhase::ReadinessCheck) {
                    self.send_request(&recording_id).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                let mut lost = self.orchestrator.in_phase(&SyncPhase::RequestSent);
                lost.extend(self.orchestrator.in_phase(&SyncPhase::Transferring));
                for recording_id in lost {
                    self.fail_operation(&recording_id, SyncError::ConnectionLost, false)
                        .await;
                }
            }
            _ => {}
        }
    }

    async fn set_lifecycle(&mut self, lifecycle: AppLifecycle) {
        if lifecycle == AppLifecycle::Terminating {
            for recording_id in self.orchestrator.ids() {
                self.fail_operation(&recording_id, SyncError::Cancelled, true)
                    .await;
            }
        }

        self.leases
            .set_backgrounded(lifecycle == AppLifecycle::Background, &mut self.scheduler);

        if let Some(state) = self.session.set_local_lifecycle(lifecycle) {
            self.on_connection_change(state).await;
        }
        self.session.announce().await;
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    async fn handle_message(&mut self, message: ProtocolMessage) {
        debug!("Received {}", message.message_type());

        match message {
            ProtocolMessage::SyncRequest(request) => self.on_sync_request(request).await,
            ProtocolMessage::SyncAccepted(response) => self.on_sync_accepted(response).await,
            ProtocolMessage::SyncRejected(response) => {
                if !self.is_outbound(&response.recording_id) {
                    debug!("Rejection for unknown recording {}", response.recording_id);
                    return;
                }
                let reason = FailureReason::from_code(response.reason.as_deref().unwrap_or_default());
                let retry_after = response
                    .retry_after
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(std::time::Duration::from_secs_f64);
                self.fail_operation(
                    &response.recording_id,
                    SyncError::Rejected {
                        reason,
                        retry_after,
                    },
                    false,
                )
                .await;
            }
            ProtocolMessage::SyncComplete(outcome) => {
                let waiting = self
                    .orchestrator
                    .get(&outcome.recording_id)
                    .is_some_and(|op| {
                        op.role == Role::Sender && *op.phase() == SyncPhase::Transferring
                    });
                if !waiting {
                    debug!("Confirmation for unknown recording {}", outcome.recording_id);
                    return;
                }
                if self.advance(&outcome.recording_id, SyncPhase::Done) {
                    self.finish_operation(&outcome.recording_id, true);
                }
            }
            ProtocolMessage::SyncFailed(outcome) => {
                if !self.orchestrator.contains(&outcome.recording_id) {
                    debug!("Failure report for unknown recording {}", outcome.recording_id);
                    return;
                }
                let reason = FailureReason::from_code(outcome.reason.as_deref().unwrap_or("unknown"));
                self.fail_operation(&outcome.recording_id, SyncError::PeerFailed(reason), false)
                    .await;
            }
            ProtocolMessage::AudioChunkTransfer(transfer) => self.on_chunk(transfer).await,
            ProtocolMessage::ChunkAcknowledgment(ack) => {
                let key = (ack.session_id.clone(), ack.sequence_number);
                if self.outbound_chunks.remove(&key).is_some() {
                    self.scheduler.cancel(&TimerKey::ChunkAck {
                        session_id: ack.session_id.clone(),
                        sequence: ack.sequence_number,
                    });
                    self.emit(SyncEvent::ChunkAcknowledged {
                        session_id: ack.session_id,
                        sequence: ack.sequence_number,
                    });
                }
            }
            ProtocolMessage::PhoneStateUpdate(update) => {
                self.apply_peer_state(update.recording_state, update.timestamp)
                    .await;
            }
            ProtocolMessage::RequestStateSync(request) => {
                let outcome = self
                    .apply_peer_state(request.local_state, request.timestamp)
                    .await;
                if outcome.broadcast.is_none() {
                    self.reply_state().await;
                }
            }
        }
    }

    fn is_outbound(&self, recording_id: &str) -> bool {
        self.orchestrator
            .get(recording_id)
            .is_some_and(|op| op.role == Role::Sender)
    }

    // ------------------------------------------------------------------
    // Sender side of the handshake
    // ------------------------------------------------------------------

    async fn start_outbound(&mut self, mut request: SyncRequest, bytes: Vec<u8>) -> Result<(), SyncError> {
        request.file_size = bytes.len() as u64;
        if request.checksum.is_empty() {
            request.checksum = content_checksum(&bytes);
        }
        let recording_id = request.recording_id.clone();

        self.orchestrator
            .begin_outbound(request, bytes, self.clock.now())?;
        self.leases.acquire(&recording_id, &mut self.scheduler);
        self.scheduler.schedule(
            TimerKey::Operation(recording_id.clone()),
            self.config.readiness_timeout(),
        );
        self.emit(SyncEvent::PhaseChanged {
            recording_id: recording_id.clone(),
            role: Role::Sender,
            phase: SyncPhase::ReadinessCheck,
        });
        info!("Queued sync of recording {}", recording_id);

        if self.session.state().allows_messages() {
            self.send_request(&recording_id).await;
        } else {
            info!(
                "Waiting for the peer before offering {} ({})",
                recording_id,
                self.session.state()
            );
        }
        Ok(())
    }

    async fn send_request(&mut self, recording_id: &str) {
        let Some(request) = self.orchestrator.get(recording_id).map(|op| op.request.clone()) else {
            return;
        };

        match self.session.send(&ProtocolMessage::SyncRequest(request)).await {
            Ok(()) => {
                if self.advance(recording_id, SyncPhase::RequestSent) {
                    self.scheduler.schedule(
                        TimerKey::Operation(recording_id.to_string()),
                        self.config.request_timeout(),
                    );
                }
            }
            Err(e) => debug!("Sync request for {} deferred: {}", recording_id, e),
        }
    }

    async fn on_sync_accepted(&mut self, response: SyncResponse) {
        let recording_id = response.recording_id.clone();
        let Some(op) = self.orchestrator.get_mut(&recording_id) else {
            debug!("Acceptance for unknown recording {}", recording_id);
            return;
        };
        if op.role != Role::Sender || *op.phase() != SyncPhase::RequestSent {
            debug!("Ignoring repeated acceptance of {}", recording_id);
            return;
        }

        let state = self.session.state();
        if !state.allows_file_transfer() {
            warn!(
                "Peer accepted {} but the link is {}; not transferring",
                recording_id, state
            );
            self.fail_operation(&recording_id, SyncError::ConnectionUnavailable(state), false)
                .await;
            return;
        }

        op.receiver_foreground = response.receiver_foreground;
        let payload = op.payload.take().unwrap_or_default();
        let metadata = TransferMetadata::for_request(&op.request);
        let deadline = transfer_timeout(op.request.file_size, op.receiver_foreground);

        if !self.advance(&recording_id, SyncPhase::Transferring) {
            return;
        }
        self.scheduler
            .schedule(TimerKey::Operation(recording_id.clone()), deadline);

        info!(
            "Peer accepted {} ({}), transferring {} bytes, deadline {:?}",
            recording_id,
            if response.receiver_foreground {
                "foreground"
            } else {
                "background"
            },
            payload.len(),
            deadline
        );

        let metadata = match protocol::encode_metadata(&metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail_operation(&recording_id, SyncError::Codec(e), true)
                    .await;
                return;
            }
        };

        let transport = self.session.transport();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport
                .transfer_file(payload, metadata)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = completions.send(Completion::FileSent {
                recording_id,
                result,
            });
        });
    }

    // ------------------------------------------------------------------
    // Receiver side of the handshake
    // ------------------------------------------------------------------

    async fn on_sync_request(&mut self, request: SyncRequest) {
        let recording_id = request.recording_id.clone();

        if let Some(op) = self.orchestrator.get(&recording_id) {
            if op.role == Role::Receiver && *op.phase() == SyncPhase::Transferring {
                debug!("Repeated request for {}, re-sending acceptance", recording_id);
                let foreground = op.receiver_foreground;
                self.send_or_log(ProtocolMessage::SyncAccepted(SyncResponse {
                    recording_id,
                    accepted: true,
                    reason: None,
                    retry_after: None,
                    receiver_foreground: foreground,
                }))
                .await;
            } else {
                debug!("Ignoring request for {} already in progress", recording_id);
            }
            return;
        }

        let lifecycle = self.session.local_lifecycle();
        let readiness = evaluate_readiness(
            lifecycle,
            self.storage.available_bytes(),
            request.file_size,
            self.config.storage_reserve_bytes,
            self.config.rejected_retry_after(),
        );

        match readiness {
            Readiness::NotReady {
                reason,
                retry_after,
            } => {
                info!("Rejecting sync of {}: {}", recording_id, reason);
                self.reply_or_log(ProtocolMessage::SyncRejected(SyncResponse {
                    recording_id,
                    accepted: false,
                    reason: Some(reason.code().to_string()),
                    retry_after: retry_after.map(|d| d.as_secs_f64()),
                    receiver_foreground: lifecycle == AppLifecycle::Foreground,
                }))
                .await;
            }
            Readiness::Ready { foreground } => {
                let deadline = transfer_timeout(request.file_size, foreground);
                let now = self.clock.now();
                if !self
                    .orchestrator
                    .accept_inbound(request, foreground, false, now)
                {
                    return;
                }
                self.leases.acquire(&recording_id, &mut self.scheduler);
                self.scheduler
                    .schedule(TimerKey::Operation(recording_id.clone()), deadline);
                self.emit(SyncEvent::PhaseChanged {
                    recording_id: recording_id.clone(),
                    role: Role::Receiver,
                    phase: SyncPhase::Transferring,
                });

                if !foreground {
                    info!("Accepting {} while backgrounded", recording_id);
                } else {
                    info!("Accepting {}", recording_id);
                }
                self.send_or_log(ProtocolMessage::SyncAccepted(SyncResponse {
                    recording_id,
                    accepted: true,
                    reason: None,
                    retry_after: None,
                    receiver_foreground: foreground,
                }))
                .await;
            }
        }
    }

    async fn handle_file(&mut self, bytes: Vec<u8>, metadata: protocol::Envelope) {
        let metadata = match protocol::decode_metadata(metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Dropping bulk transfer with bad metadata: {}", e);
                return;
            }
        };
        let recording_id = metadata.recording_id.clone();

        match self.orchestrator.get(&recording_id) {
            Some(op) if op.role == Role::Receiver && *op.phase() == SyncPhase::Transferring => {}
            Some(op) => {
                debug!(
                    "Ignoring transfer of {} in phase {} ({:?})",
                    recording_id,
                    op.phase(),
                    op.role
                );
                return;
            }
            None => {
                info!(
                    "No pending request for {}, reconstructing it from transfer metadata",
                    recording_id
                );
                let foreground = self.session.local_lifecycle() == AppLifecycle::Foreground;
                let now = self.clock.now();
                self.orchestrator
                    .accept_inbound(metadata.reconstruct_request(), foreground, true, now);
                self.leases.acquire(&recording_id, &mut self.scheduler);
            }
        }

        self.scheduler
            .cancel(&TimerKey::Operation(recording_id.clone()));
        if !self.advance(&recording_id, SyncPhase::IntegrityCheck) {
            return;
        }

        let Some(op) = self.orchestrator.get(&recording_id) else {
            return;
        };
        let expected = op.request.checksum.clone();
        let artifact = ArtifactMetadata::for_transfer(&op.request, op.reconstructed);
        if expected.is_empty() {
            warn!("Transfer of {} carries no checksum; skipping integrity check", recording_id);
        } else {
            let actual = content_checksum(&bytes);
            if actual != expected {
                warn!("Checksum mismatch for {}, discarding {} bytes", recording_id, bytes.len());
                self.fail_operation(
                    &recording_id,
                    SyncError::ChecksumMismatch { expected, actual },
                    true,
                )
                .await;
                return;
            }
        }

        if !self.advance(&recording_id, SyncPhase::PersistPending) {
            return;
        }

        let Some(sink) = self.sink.clone() else {
            error!(
                "Received {} but no artifact sink is registered; the recording cannot be persisted",
                recording_id
            );
            self.fail_operation(&recording_id, SyncError::CallbackNotConfigured, true)
                .await;
            return;
        };

        self.scheduler.schedule(
            TimerKey::Operation(recording_id.clone()),
            self.config.persist_timeout(),
        );

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = sink.on_artifact_ready(bytes, artifact).await;
            let _ = completions.send(Completion::Persisted {
                recording_id,
                result,
            });
        });
    }

    async fn send_confirmation(&mut self, recording_id: &str) {
        let Some(op) = self.orchestrator.get_mut(recording_id) else {
            return;
        };
        op.confirmation_attempts += 1;
        let attempt = op.confirmation_attempts;

        let message = ProtocolMessage::SyncComplete(SyncOutcome {
            recording_id: recording_id.to_string(),
            reason: None,
            timestamp: self.clock.now(),
        });

        match self.session.send(&message).await {
            Ok(()) => {
                if self.advance(recording_id, SyncPhase::Done) {
                    self.finish_operation(recording_id, true);
                }
            }
            Err(e) if attempt >= self.config.confirmation_attempts => {
                warn!(
                    "Recording {} persisted but confirmation undelivered after {} attempts: {}",
                    recording_id, attempt, e
                );
                if self.advance(recording_id, SyncPhase::Done) {
                    self.finish_operation(recording_id, false);
                }
            }
            Err(e) => {
                debug!(
                    "Confirmation of {} failed (attempt {}): {}",
                    recording_id, attempt, e
                );
                self.scheduler.schedule(
                    TimerKey::Operation(recording_id.to_string()),
                    self.config.confirmation_interval(),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Operation lifecycle
    // ------------------------------------------------------------------

    /// Move an operation to `next` and report it; false if the transition is invalid
    fn advance(&mut self, recording_id: &str, next: SyncPhase) -> bool {
        let Some(op) = self.orchestrator.get_mut(recording_id) else {
            return false;
        };
        let role = op.role;
        if let Err(e) = op.advance(next.clone()) {
            error!("{}", e);
            return false;
        }
        self.emit(SyncEvent::PhaseChanged {
            recording_id: recording_id.to_string(),
            role,
            phase: next,
        });
        true
    }

    fn finish_operation(&mut self, recording_id: &str, confirmed: bool) {
        let Some(op) = self.orchestrator.remove(recording_id) else {
            return;
        };
        self.scheduler
            .cancel(&TimerKey::Operation(recording_id.to_string()));
        self.leases.release(recording_id, &mut self.scheduler);

        info!(
            "Sync of {} completed as {:?}{}",
            recording_id,
            op.role,
            if confirmed { "" } else { " (unconfirmed)" }
        );
        self.emit(SyncEvent::TransferCompleted {
            recording_id: recording_id.to_string(),
            role: op.role,
            confirmed,
        });
    }

    /// The single terminal-failure path: explicit cancel, timeouts, lease
    /// expiry, connection loss, peer reports and local errors all end here
    async fn fail_operation(&mut self, recording_id: &str, error: SyncError, notify_peer: bool) {
        let Some(mut op) = self.orchestrator.remove(recording_id) else {
            return;
        };
        let reason = error.reason();

        if let Err(e) = op.advance(SyncPhase::Failed(reason.clone())) {
            debug!("{}", e);
        }
        self.scheduler
            .cancel(&TimerKey::Operation(recording_id.to_string()));
        self.leases.release(recording_id, &mut self.scheduler);

        warn!("Sync of {} failed as {:?}: {}", recording_id, op.role, error);

        if notify_peer {
            let message = ProtocolMessage::SyncFailed(SyncOutcome {
                recording_id: recording_id.to_string(),
                reason: Some(reason.code().to_string()),
                timestamp: self.clock.now(),
            });
            if let Err(e) = self.session.send(&message).await {
                debug!("Peer not told about failure of {}: {}", recording_id, e);
            }
        }

        let retry_after_secs = match &error {
            SyncError::Rejected { retry_after, .. } => retry_after.map(|d| d.as_secs_f64()),
            _ => None,
        };
        self.emit(SyncEvent::TransferFailed {
            recording_id: recording_id.to_string(),
            role: op.role,
            reason,
            retry_after_secs,
        });
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.scheduler.accept(&fired) {
            return;
        }

        match fired.key {
            TimerKey::Operation(recording_id) => {
                let Some(phase) = self.orchestrator.get(&recording_id).map(|op| op.phase().clone())
                else {
                    return;
                };
                if phase == SyncPhase::ConfirmSent {
                    self.send_confirmation(&recording_id).await;
                } else {
                    warn!("Sync of {} timed out in {}", recording_id, phase);
                    self.fail_operation(&recording_id, SyncError::Timeout, true)
                        .await;
                }
            }
            TimerKey::Lease(recording_id) => {
                self.fail_operation(&recording_id, SyncError::LeaseExpired, true)
                    .await;
            }
            TimerKey::ChunkAck {
                session_id,
                sequence,
            } => self.retry_chunk(session_id, sequence).await,
            TimerKey::GapFill(session_id) => {
                if self.assembler.session_id() == Some(session_id.as_str()) {
                    info!(
                        "No chunks for session {} within {:?}, closing with {} gaps{}",
                        session_id,
                        self.config.chunk_gap_grace(),
                        self.assembler.missing_sequences().len(),
                        if self.assembler.expected_total().is_some() {
                            ""
                        } else {
                            " and no last chunk"
                        }
                    );
                    self.finalize_chunk_session();
                }
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::FileSent {
                recording_id,
                result,
            } => match result {
                Ok(()) => debug!("Bulk transfer of {} handed to the transport", recording_id),
                Err(e) => {
                    warn!("Bulk transfer of {} failed: {}", recording_id, e);
                    let state = self.session.state();
                    self.fail_operation(
                        &recording_id,
                        SyncError::ConnectionUnavailable(state),
                        true,
                    )
                    .await;
                }
            },
            Completion::Persisted {
                recording_id,
                result,
            } => {
                let pending = self
                    .orchestrator
                    .get(&recording_id)
                    .is_some_and(|op| *op.phase() == SyncPhase::PersistPending);
                if !pending {
                    warn!(
                        "Late persistence result for {} ignored (ok={})",
                        recording_id,
                        result.is_ok()
                    );
                    return;
                }
                self.scheduler
                    .cancel(&TimerKey::Operation(recording_id.clone()));

                match result {
                    Ok(()) => {
                        if self.advance(&recording_id, SyncPhase::ConfirmSent) {
                            self.send_confirmation(&recording_id).await;
                        }
                    }
                    Err(e) => {
                        error!("Persisting {} failed: {:#}", recording_id, e);
                        self.fail_operation(
                            &recording_id,
                            SyncError::PersistenceFailure(format!("{:#}", e)),
                            true,
                        )
                        .await;
                    }
                }
            }
            Completion::ChunksPersisted {
                session_id,
                degraded,
                filled,
                result,
            } => match result {
                Ok(()) => self.emit(SyncEvent::ChunkSessionAssembled {
                    session_id,
                    degraded,
                    filled,
                }),
                Err(e) => {
                    error!("Persisting chunk session {} failed: {:#}", session_id, e);
                    self.emit(SyncEvent::ChunkSessionFailed {
                        session_id,
                        reason: FailureReason::PersistenceFailure,
                    });
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Chunk path
    // ------------------------------------------------------------------

    async fn send_chunk(&mut self, chunk: AudioChunk) {
        let session_id = chunk.session_id.clone();
        let sequence = chunk.sequence_number;
        let message = ProtocolMessage::AudioChunkTransfer(ChunkTransfer::from_chunk(&chunk));

        self.outbound_chunks
            .insert((session_id.clone(), sequence), OutboundChunk { chunk, attempts: 1 });
        self.scheduler.schedule(
            TimerKey::ChunkAck {
                session_id: session_id.clone(),
                sequence,
            },
            self.config.chunk_ack_timeout(),
        );

        if let Err(e) = self.session.send(&message).await {
            debug!("Chunk {} of {} not sent yet: {}", sequence, session_id, e);
        }
    }

    async fn retry_chunk(&mut self, session_id: String, sequence: u32) {
        let key = (session_id.clone(), sequence);
        let Some(outbound) = self.outbound_chunks.get_mut(&key) else {
            return;
        };

        if outbound.attempts >= self.config.chunk_max_attempts {
            self.outbound_chunks.remove(&key);
            warn!(
                "Dropping chunk {} of {} after {} unacknowledged attempts",
                sequence, session_id, self.config.chunk_max_attempts
            );
            self.emit(SyncEvent::ChunkDropped {
                session_id,
                sequence,
            });
            return;
        }

        outbound.attempts += 1;
        let attempt = outbound.attempts;
        let message =
            ProtocolMessage::AudioChunkTransfer(ChunkTransfer::from_chunk(&outbound.chunk));

        self.scheduler.schedule(
            TimerKey::ChunkAck {
                session_id: session_id.clone(),
                sequence,
            },
            self.config.chunk_ack_timeout(),
        );
        debug!("Resending chunk {} of {} (attempt {})", sequence, session_id, attempt);
        if let Err(e) = self.session.send(&message).await {
            debug!("Chunk resend failed: {}", e);
        }
    }

    async fn on_chunk(&mut self, transfer: ChunkTransfer) {
        let ack = ProtocolMessage::ChunkAcknowledgment(ChunkAck {
            chunk_id: transfer.chunk_id.clone(),
            sequence_number: transfer.sequence_number,
            session_id: transfer.session_id.clone(),
        });

        if self.completed_sessions.contains(&transfer.session_id) {
            debug!(
                "Chunk {} of finished session {}, acknowledging only",
                transfer.sequence_number, transfer.session_id
            );
            self.reply_or_log(ack).await;
            return;
        }

        let chunk = match transfer.into_chunk() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Dropping chunk: {}", e);
                return;
            }
        };
        let session_id = chunk.session_id.clone();

        let receipt = match self.assembler.add_chunk(chunk) {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Rejected chunk for session {}: {}", session_id, e);
                return;
            }
        };

        if let Some(discarded) = receipt.discarded_session {
            self.scheduler.cancel(&TimerKey::GapFill(discarded.clone()));
            self.emit(SyncEvent::ChunkSessionDiscarded {
                session_id: discarded,
            });
        }

        self.reply_or_log(ack).await;

        if receipt.duplicate {
            return;
        }

        if self.assembler.is_complete() {
            self.finalize_chunk_session();
        } else {
            // Inactivity window: restarts with every new chunk, end known or not
            self.scheduler
                .schedule(TimerKey::GapFill(session_id), self.config.chunk_gap_grace());
        }
    }

    /// Combine the buffered session (gap-filling if needed) and hand it to the sink
    fn finalize_chunk_session(&mut self) {
        let Some(session_id) = self.assembler.session_id().map(str::to_string) else {
            return;
        };
        self.scheduler.cancel(&TimerKey::GapFill(session_id.clone()));

        let combined = self.assembler.combine();
        let end_seen = self.assembler.expected_total().is_some();
        self.assembler.reset();
        self.completed_sessions.push_back(session_id.clone());
        if self.completed_sessions.len() > COMPLETED_SESSION_MEMORY {
            self.completed_sessions.pop_front();
        }

        let audio = match combined {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Could not assemble session {}: {}", session_id, e);
                self.emit(SyncEvent::ChunkSessionFailed {
                    session_id,
                    reason: SyncError::from(e).reason(),
                });
                return;
            }
        };

        let Some(sink) = self.sink.clone() else {
            error!(
                "Session {} assembled but no artifact sink is registered; audio dropped",
                session_id
            );
            self.emit(SyncEvent::ChunkSessionFailed {
                session_id,
                reason: FailureReason::CallbackNotSet,
            });
            return;
        };

        info!(
            "Session {} assembled: {} bytes, {:.1}s",
            session_id,
            audio.bytes.len(),
            audio.duration_secs
        );
        if audio.degraded {
            let partial = SyncError::PartialData {
                missing: audio.filled.clone(),
                end_seen,
            };
            warn!("Session {} stored as degraded: {}", session_id, partial);
        }

        let metadata = ArtifactMetadata::for_chunks(&audio);
        let degraded = audio.degraded;
        let filled = audio.filled.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = sink.on_artifact_ready(audio.bytes, metadata).await;
            let _ = completions.send(Completion::ChunksPersisted {
                session_id,
                degraded,
                filled,
                result,
            });
        });
    }

    // ------------------------------------------------------------------
    // Recording state
    // ------------------------------------------------------------------

    async fn apply_peer_state(
        &mut self,
        state: RecordingState,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> PeerStateOutcome {
        let before = self.states.peer();
        let outcome = self.states.on_peer_state_message(state, timestamp);

        if let Some(peer) = self.states.peer().filter(|peer| Some(*peer) != before) {
            self.emit(SyncEvent::PeerStateChanged {
                state: peer.state,
                changed_at: peer.changed_at,
            });
        }

        if let Some((conflict, resolution)) = outcome.conflict {
            self.emit(SyncEvent::ConflictResolved {
                local: conflict.local.state,
                peer: conflict.peer.state,
                resolved: resolution.state,
                winner: resolution.winner,
                rule: resolution.rule,
            });
        }

        if outcome.local_changed {
            let local = self.states.local();
            self.emit(SyncEvent::LocalStateChanged {
                state: local.state,
                changed_at: local.changed_at,
                source: StateChangeSource::ConflictResolution,
            });
        }

        if outcome.broadcast.is_some() {
            self.broadcast_state().await;
        }
        outcome
    }

    /// Send the local state if the peer has not seen it yet
    async fn broadcast_state(&mut self) {
        let Some(record) = self.states.pending_broadcast() else {
            return;
        };
        let delivered = self.send_state(record).await;
        self.states.mark_broadcast(delivered);
    }

    /// Answer a state sync request with the current local state
    async fn reply_state(&mut self) {
        let record = self.states.local();
        if self.send_state(record).await {
            self.states.mark_broadcast(true);
        }
    }

    async fn send_state(&self, record: StateRecord) -> bool {
        let message = ProtocolMessage::PhoneStateUpdate(StateUpdate {
            recording_state: record.state,
            timestamp: record.changed_at,
        });
        match self.session.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                debug!("State {} deferred: {}", record.state, e);
                false
            }
        }
    }

    async fn send_or_log(&self, message: ProtocolMessage) {
        if let Err(e) = self.session.send(&message).await {
            debug!("{} not delivered: {}", message.message_type(), e);
        }
    }

    async fn reply_or_log(&self, message: ProtocolMessage) {
        if let Err(e) = self.session.reply(&message).await {
            debug!("{} reply not delivered: {}", message.message_type(), e);
        }
    }
}
