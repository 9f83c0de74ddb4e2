use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{AppLifecycle, LinkStatus, Transport, TransportEvent};
use crate::protocol::Envelope;

const INBOX_CAPACITY: usize = 1024;

/// Shared control over a linked pair of in-memory transports
#[derive(Clone)]
pub struct MemoryLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    reachable: AtomicBool,
    inboxes: [mpsc::Sender<TransportEvent>; 2],
    delivered_files: Mutex<usize>,
}

impl MemoryLink {
    /// Toggle reachability; both ends observe the link going up or down
    pub fn set_reachable(&self, reachable: bool) {
        let previous = self.inner.reachable.swap(reachable, Ordering::SeqCst);
        if previous == reachable {
            return;
        }

        let status = if reachable {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        };
        debug!("Memory link now {:?}", status);

        for inbox in &self.inner.inboxes {
            let _ = inbox.try_send(TransportEvent::Link(status.clone()));
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Number of bulk transfers delivered across the link
    pub fn delivered_files(&self) -> usize {
        *self
            .inner
            .delivered_files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-process link
pub struct MemoryTransport {
    name: String,
    side: usize,
    link: MemoryLink,
    inbox: Option<mpsc::Receiver<TransportEvent>>,
}

impl MemoryTransport {
    /// Create two transports wired to each other, initially reachable
    pub fn pair() -> (MemoryTransport, MemoryTransport, MemoryLink) {
        let (a_tx, a_rx) = mpsc::channel(INBOX_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(INBOX_CAPACITY);

        let link = MemoryLink {
            inner: Arc::new(LinkInner {
                reachable: AtomicBool::new(true),
                inboxes: [a_tx, b_tx],
                delivered_files: Mutex::new(0),
            }),
        };

        let a = MemoryTransport {
            name: "memory-a".to_string(),
            side: 0,
            link: link.clone(),
            inbox: Some(a_rx),
        };
        let b = MemoryTransport {
            name: "memory-b".to_string(),
            side: 1,
            link: link.clone(),
            inbox: Some(b_rx),
        };

        (a, b, link)
    }

    fn peer_inbox(&self) -> &mpsc::Sender<TransportEvent> {
        &self.link.inner.inboxes[1 - self.side]
    }

    async fn deliver(&self, event: TransportEvent) -> Result<()> {
        if !self.link.is_reachable() {
            bail!("peer unreachable");
        }
        if self.peer_inbox().send(event).await.is_err() {
            bail!("peer transport closed");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        let Some(inbox) = self.inbox.take() else {
            bail!("{} already started", self.name);
        };

        let status = if self.link.is_reachable() {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        };
        let _ = self.link.inner.inboxes[self.side]
            .send(TransportEvent::Link(status))
            .await;

        Ok(inbox)
    }

    async fn send_message(&self, envelope: Envelope) -> Result<()> {
        self.deliver(TransportEvent::Message(envelope)).await
    }

    async fn transfer_file(&self, bytes: Vec<u8>, metadata: Envelope) -> Result<()> {
        self.deliver(TransportEvent::File { bytes, metadata }).await?;
        let mut delivered = self
            .link
            .inner
            .delivered_files
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *delivered += 1;
        Ok(())
    }

    async fn announce_presence(&self, lifecycle: AppLifecycle) -> Result<()> {
        self.deliver(TransportEvent::PeerPresence(lifecycle)).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
