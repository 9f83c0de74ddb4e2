use anyhow::{Context, Result};
use async_nats::Client;
use base64::Engine;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AppLifecycle, LinkStatus, Transport, TransportEvent};
use crate::protocol::Envelope;

/// Largest raw slice of a file carried by one NATS message (default max payload is 1 MiB)
const FILE_FRAME_BYTES: usize = 512 * 1024;

/// Partially received files older than this are dropped
const PARTIAL_FILE_TTL: Duration = Duration::from_secs(600);

/// Missed heartbeats before the peer is considered gone
const PRESENCE_MISSES: u32 = 3;

/// One slice of a bulk file transfer
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFrame {
    transfer_id: String,
    index: u32,
    total: u32,
    data: String, // Base64-encoded slice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Envelope>,
}

/// Heartbeat published by each device
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceMessage {
    device_id: String,
    lifecycle: AppLifecycle,
    timestamp: String, // RFC3339 timestamp
}

struct PartialFile {
    total: u32,
    frames: BTreeMap<u32, Vec<u8>>,
    metadata: Option<Envelope>,
    started: Instant,
}

/// Device link over NATS subjects `loqa.link.<device>.{message,file,presence}`
pub struct NatsTransport {
    client: Client,
    device_id: String,
    peer_id: String,
    presence_interval: Duration,
    lifecycle: Arc<Mutex<AppLifecycle>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkStatus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NatsTransport {
    /// Connect to NATS server
    pub async fn connect(
        url: &str,
        device_id: String,
        peer_id: String,
        presence_interval: Duration,
    ) -> Result<Self> {
        info!("Connecting to NATS at {} as {}", url, device_id);

        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let link_tx = link_tx.clone();
                async move {
                    let status = match event {
                        async_nats::Event::Connected => LinkStatus::Up,
                        async_nats::Event::Disconnected => LinkStatus::Down,
                        async_nats::Event::ClientError(e) => LinkStatus::Failed(e.to_string()),
                        other => {
                            debug!("NATS event: {}", other);
                            return;
                        }
                    };
                    let _ = link_tx.send(status);
                }
            })
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            device_id,
            peer_id,
            presence_interval,
            lifecycle: Arc::new(Mutex::new(AppLifecycle::Foreground)),
            link_rx: Some(link_rx),
            tasks: Vec::new(),
        })
    }

    fn subject(device: &str, kind: &str) -> String {
        format!("loqa.link.{}.{}", device, kind)
    }

    async fn publish_presence(client: &Client, device_id: &str, lifecycle: AppLifecycle) -> Result<()> {
        let message = PresenceMessage {
            device_id: device_id.to_string(),
            lifecycle,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec(&message)?;

        client
            .publish(Self::subject(device_id, "presence"), payload.into())
            .await
            .context("Failed to publish presence")?;

        Ok(())
    }

    async fn spawn_messages(&mut self, tx: mpsc::Sender<TransportEvent>) -> Result<()> {
        let subject = Self::subject(&self.device_id, "message");
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to messages")?;
        info!("Subscribed to {}", subject);

        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match serde_json::from_slice::<Envelope>(&msg.payload) {
                    Ok(envelope) => {
                        if tx.send(TransportEvent::Message(envelope)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping non-JSON message on {}: {}", msg.subject, e),
                }
            }
        }));

        Ok(())
    }

    async fn spawn_files(&mut self, tx: mpsc::Sender<TransportEvent>) -> Result<()> {
        let subject = Self::subject(&self.device_id, "file");
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to file frames")?;
        info!("Subscribed to {}", subject);

        self.tasks.push(tokio::spawn(async move {
            let mut partials: HashMap<String, PartialFile> = HashMap::new();

            while let Some(msg) = subscriber.next().await {
                let frame = match serde_json::from_slice::<FileFrame>(&msg.payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping malformed file frame: {}", e);
                        continue;
                    }
                };

                partials.retain(|id, partial| {
                    let fresh = partial.started.elapsed() < PARTIAL_FILE_TTL;
                    if !fresh {
                        warn!("Dropping stale partial transfer {}", id);
                    }
                    fresh
                });

                let Some(event) = Self::accept_frame(&mut partials, frame) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    fn accept_frame(
        partials: &mut HashMap<String, PartialFile>,
        frame: FileFrame,
    ) -> Option<TransportEvent> {
        let data = match base64::engine::general_purpose::STANDARD.decode(&frame.data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping file frame with bad payload: {}", e);
                return None;
            }
        };

        let partial = partials
            .entry(frame.transfer_id.clone())
            .or_insert_with(|| PartialFile {
                total: frame.total,
                frames: BTreeMap::new(),
                metadata: None,
                started: Instant::now(),
            });

        if frame.metadata.is_some() {
            partial.metadata = frame.metadata;
        }
        partial.frames.insert(frame.index, data);

        if partial.frames.len() < partial.total as usize || partial.metadata.is_none() {
            return None;
        }

        let partial = partials.remove(&frame.transfer_id)?;
        let metadata = partial.metadata?;
        let bytes: Vec<u8> = partial.frames.into_values().flatten().collect();

        info!(
            "Received file transfer {} ({} bytes)",
            frame.transfer_id,
            bytes.len()
        );

        Some(TransportEvent::File { bytes, metadata })
    }

    async fn spawn_presence(&mut self, tx: mpsc::Sender<TransportEvent>) -> Result<()> {
        let subject = Self::subject(&self.peer_id, "presence");
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to peer presence")?;
        info!("Subscribed to {}", subject);

        let silence = self.presence_interval * PRESENCE_MISSES;
        let watcher_tx = tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut peer_seen = false;
            loop {
                tokio::select! {
                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        match serde_json::from_slice::<PresenceMessage>(&msg.payload) {
                            Ok(presence) => {
                                peer_seen = true;
                                if watcher_tx
                                    .send(TransportEvent::PeerPresence(presence.lifecycle))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping malformed presence message: {}", e),
                        }
                    }
                    _ = tokio::time::sleep(silence), if peer_seen => {
                        warn!("No presence from peer for {:?}", silence);
                        peer_seen = false;
                        if watcher_tx.send(TransportEvent::PeerLost).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        let client = self.client.clone();
        let device_id = self.device_id.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let interval = self.presence_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let current = *lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = Self::publish_presence(&client, &device_id, current).await {
                    error!("Presence heartbeat failed: {:#}", e);
                }
            }
        }));

        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut link_rx = self
            .link_rx
            .take()
            .context("NATS transport already started")?;

        let (tx, rx) = mpsc::channel(256);

        tx.send(TransportEvent::Link(LinkStatus::Up))
            .await
            .context("Transport event channel closed")?;

        let link_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(status) = link_rx.recv().await {
                info!("NATS link status: {:?}", status);
                if link_tx.send(TransportEvent::Link(status)).await.is_err() {
                    break;
                }
            }
        }));

        self.spawn_messages(tx.clone()).await?;
        self.spawn_files(tx.clone()).await?;
        self.spawn_presence(tx).await?;

        Ok(rx)
    }

    async fn send_message(&self, envelope: Envelope) -> Result<()> {
        let subject = Self::subject(&self.peer_id, "message");
        let payload = serde_json::to_vec(&envelope)?;

        self.client
            .publish(subject, payload.into())
            .await
            .context("Failed to publish message")?;

        Ok(())
    }

    async fn transfer_file(&self, bytes: Vec<u8>, metadata: Envelope) -> Result<()> {
        let subject = Self::subject(&self.peer_id, "file");
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let total = bytes.len().div_ceil(FILE_FRAME_BYTES).max(1) as u32;

        info!(
            "Sending file transfer {} to {} ({} bytes, {} frames)",
            transfer_id,
            self.peer_id,
            bytes.len(),
            total
        );

        let mut slices: Vec<&[u8]> = bytes.chunks(FILE_FRAME_BYTES).collect();
        if slices.is_empty() {
            slices.push(&[]);
        }

        let mut metadata = Some(metadata);
        for (index, slice) in slices.into_iter().enumerate() {
            let frame = FileFrame {
                transfer_id: transfer_id.clone(),
                index: index as u32,
                total,
                data: base64::engine::general_purpose::STANDARD.encode(slice),
                metadata: metadata.take(),
            };
            let payload = serde_json::to_vec(&frame)?;

            self.client
                .publish(subject.clone(), payload.into())
                .await
                .context("Failed to publish file frame")?;
        }

        self.client
            .flush()
            .await
            .context("Failed to flush file transfer")?;

        Ok(())
    }

    async fn announce_presence(&self, lifecycle: AppLifecycle) -> Result<()> {
        {
            let mut current = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            *current = lifecycle;
        }
        debug!("Announcing {:?} to {}", lifecycle, self.peer_id);
        Self::publish_presence(&self.client, &self.device_id, lifecycle).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str, index: u32, total: u32, data: &[u8], meta: bool) -> FileFrame {
        FileFrame {
            transfer_id: id.to_string(),
            index,
            total,
            data: base64::engine::general_purpose::STANDARD.encode(data),
            metadata: meta.then(|| {
                serde_json::json!({ "recordingId": "rec-1" })
                    .as_object()
                    .cloned()
                    .unwrap()
            }),
        }
    }

    #[test]
    fn reassembles_out_of_order_frames() {
        let mut partials = HashMap::new();

        assert!(NatsTransport::accept_frame(&mut partials, frame("t", 1, 2, b"def", false)).is_none());
        let event = NatsTransport::accept_frame(&mut partials, frame("t", 0, 2, b"abc", true));

        match event {
            Some(TransportEvent::File { bytes, metadata }) => {
                assert_eq!(bytes, b"abcdef");
                assert_eq!(metadata["recordingId"], "rec-1");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(partials.is_empty());
    }
}
