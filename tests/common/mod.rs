// Shared fixtures for the sync integration tests

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use loqa_link::protocol::{self, ProtocolMessage};
use loqa_link::sync::{
    ArtifactMetadata, ArtifactSink, DeviceRole, FixedStorageProbe, StorageProbe,
    SyncDependencies, SyncEvent, SyncService,
};
use loqa_link::transport::{MemoryLink, MemoryTransport, TransportEvent};
use loqa_link::{ConnectionState, SyncConfig, SystemClock};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub const WAIT: Duration = Duration::from_secs(900);

/// Sink that keeps every artifact in memory
#[derive(Default)]
pub struct RecordingSink {
    pub artifacts: Mutex<Vec<(Vec<u8>, ArtifactMetadata)>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn first(&self) -> Option<(Vec<u8>, ArtifactMetadata)> {
        self.artifacts.lock().unwrap().first().cloned()
    }
}

#[async_trait::async_trait]
impl ArtifactSink for RecordingSink {
    async fn on_artifact_ready(&self, bytes: Vec<u8>, metadata: ArtifactMetadata) -> Result<()> {
        self.artifacts.lock().unwrap().push((bytes, metadata));
        Ok(())
    }
}

/// Sink that always fails
pub struct FailingSink;

#[async_trait::async_trait]
impl ArtifactSink for FailingSink {
    async fn on_artifact_ready(&self, _bytes: Vec<u8>, _metadata: ArtifactMetadata) -> Result<()> {
        bail!("disk full")
    }
}

/// Sink that holds every artifact until released
#[derive(Default)]
pub struct GatedSink {
    pub release: Notify,
    pub stored: RecordingSink,
}

#[async_trait::async_trait]
impl ArtifactSink for GatedSink {
    async fn on_artifact_ready(&self, bytes: Vec<u8>, metadata: ArtifactMetadata) -> Result<()> {
        self.release.notified().await;
        self.stored.on_artifact_ready(bytes, metadata).await
    }
}

pub fn deps(
    transport: MemoryTransport,
    sink: Option<Arc<dyn ArtifactSink>>,
    storage: Arc<dyn StorageProbe>,
) -> SyncDependencies {
    SyncDependencies {
        transport: Box::new(transport),
        sink,
        storage,
        clock: Arc::new(SystemClock),
    }
}

pub fn plenty_of_storage() -> Arc<dyn StorageProbe> {
    Arc::new(FixedStorageProbe(u64::MAX))
}

/// Two services wired back to back: the wearable (sender) and the phone (receiver)
pub struct Pair {
    pub wearable: SyncService,
    pub phone: SyncService,
    pub wearable_events: broadcast::Receiver<SyncEvent>,
    pub phone_events: broadcast::Receiver<SyncEvent>,
    pub link: MemoryLink,
}

/// Both services share `config`; only the device role differs
pub async fn spawn_pair(
    config: SyncConfig,
    phone_sink: Option<Arc<dyn ArtifactSink>>,
    phone_storage: Arc<dyn StorageProbe>,
) -> Result<Pair> {
    let (wearable_transport, phone_transport, link) = MemoryTransport::pair();

    let wearable_config = SyncConfig {
        role: DeviceRole::Wearable,
        ..config.clone()
    };
    let phone_config = SyncConfig {
        role: DeviceRole::Phone,
        ..config
    };

    let wearable = SyncService::spawn(
        wearable_config,
        deps(wearable_transport, None, plenty_of_storage()),
    )
    .await?;
    let phone = SyncService::spawn(
        phone_config,
        deps(phone_transport, phone_sink, phone_storage),
    )
    .await?;

    let wearable_events = wearable.subscribe();
    let phone_events = phone.subscribe();

    wait_connected(&wearable).await?;
    wait_connected(&phone).await?;

    Ok(Pair {
        wearable,
        phone,
        wearable_events,
        phone_events,
        link,
    })
}

/// Poll until the service reports a connected peer
pub async fn wait_connected(service: &SyncService) -> Result<()> {
    tokio::time::timeout(WAIT, async {
        loop {
            if service.snapshot().await?.connection == ConnectionState::Connected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("service never connected"))?
}

/// Next event matching `predicate`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SyncEvent>, mut predicate: F) -> Result<SyncEvent>
where
    F: FnMut(&SyncEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow!("event stream ended: {}", e)),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for event"))?
}

/// Next protocol message delivered to a bare transport
pub async fn next_message(inbox: &mut mpsc::Receiver<TransportEvent>) -> Result<ProtocolMessage> {
    tokio::time::timeout(WAIT, async {
        loop {
            match inbox.recv().await {
                Some(TransportEvent::Message(envelope)) => return Ok(protocol::decode(envelope)?),
                Some(_) => continue,
                None => return Err(anyhow!("transport closed")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for a message"))?
}

/// Fake WAV-ish payload of `len` bytes
pub fn artifact(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
