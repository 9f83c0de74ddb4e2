use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::timeout::{Scheduler, TimerKey};

/// Time-bounded grant to keep an operation running while the host app is backgrounded
#[derive(Debug, Clone)]
pub struct ExecutionLease {
    pub id: Uuid,
    pub recording_id: String,
    /// The expiry timer only runs while the app is in the background
    pub armed: bool,
}

/// Leases of all in-flight sync operations.
///
/// A lease is acquired when an operation starts and released when it reaches
/// a terminal outcome. While the app is backgrounded every lease runs down
/// `duration`; expiry arrives as a [`TimerKey::Lease`] timer.
pub struct LeaseTable {
    leases: HashMap<String, ExecutionLease>,
    duration: Duration,
    backgrounded: bool,
}

impl LeaseTable {
    pub fn new(duration: Duration) -> Self {
        Self {
            leases: HashMap::new(),
            duration,
            backgrounded: false,
        }
    }

    pub fn acquire(&mut self, recording_id: &str, scheduler: &mut Scheduler) -> Uuid {
        let lease = ExecutionLease {
            id: Uuid::new_v4(),
            recording_id: recording_id.to_string(),
            armed: self.backgrounded,
        };
        if lease.armed {
            scheduler.schedule(TimerKey::Lease(recording_id.to_string()), self.duration);
        }
        debug!("Acquired lease {} for {}", lease.id, recording_id);

        let id = lease.id;
        self.leases.insert(recording_id.to_string(), lease);
        id
    }

    pub fn release(&mut self, recording_id: &str, scheduler: &mut Scheduler) -> bool {
        scheduler.cancel(&TimerKey::Lease(recording_id.to_string()));
        match self.leases.remove(recording_id) {
            Some(lease) => {
                debug!("Released lease {} for {}", lease.id, recording_id);
                true
            }
            None => false,
        }
    }

    pub fn holds(&self, recording_id: &str) -> bool {
        self.leases.contains_key(recording_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Start (or stop) the expiry clock of every lease
    pub fn set_backgrounded(&mut self, backgrounded: bool, scheduler: &mut Scheduler) {
        if self.backgrounded == backgrounded {
            return;
        }
        self.backgrounded = backgrounded;

        if !self.leases.is_empty() {
            info!(
                "App {} with {} active leases",
                if backgrounded { "backgrounded" } else { "foregrounded" },
                self.leases.len()
            );
        }

        for (recording_id, lease) in self.leases.iter_mut() {
            let key = TimerKey::Lease(recording_id.clone());
            if backgrounded {
                scheduler.schedule(key, self.duration);
            } else {
                scheduler.cancel(&key);
            }
            lease.armed = backgrounded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_only_runs_down_in_background() {
        let (mut scheduler, mut rx) = Scheduler::new();
        let mut leases = LeaseTable::new(Duration::from_secs(30));

        leases.acquire("rec-1", &mut scheduler);
        assert!(!scheduler.is_armed(&TimerKey::Lease("rec-1".to_string())));

        leases.set_backgrounded(true, &mut scheduler);
        tokio::time::advance(Duration::from_secs(31)).await;

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.key, TimerKey::Lease("rec-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn release_cancels_expiry() {
        let (mut scheduler, _rx) = Scheduler::new();
        let mut leases = LeaseTable::new(Duration::from_secs(30));
        leases.set_backgrounded(true, &mut scheduler);

        leases.acquire("rec-1", &mut scheduler);
        assert!(scheduler.is_armed(&TimerKey::Lease("rec-1".to_string())));

        assert!(leases.release("rec-1", &mut scheduler));
        assert!(scheduler.is_empty());
        assert!(leases.is_empty());
    }
}
