use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How long to wait for a transfer of `file_size` bytes.
///
/// `base = 60 + 10 * MB` seconds; foreground receivers are clamped to
/// 120..=300 s, background receivers get `base * 2` clamped to 180..=600 s.
pub fn transfer_timeout(file_size: u64, receiver_foreground: bool) -> Duration {
    let size_mb = file_size as f64 / BYTES_PER_MB;
    let base = 60.0 + 10.0 * size_mb;

    let secs = if receiver_foreground {
        base.clamp(120.0, 300.0)
    } else {
        (base * 2.0).clamp(180.0, 600.0)
    };

    Duration::from_secs_f64(secs)
}

/// What a timer guards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// The single deadline of a pending sync operation, whichever phase it is in
    Operation(String),
    /// Background execution lease of a sync operation
    Lease(String),
    /// Acknowledgment wait for one outbound chunk
    ChunkAck { session_id: String, sequence: u32 },
    /// Grace period for straggling chunks once the last chunk is known
    GapFill(String),
}

/// Delivered to the owner's mailbox when a timer expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    generation: u64,
}

struct Armed {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// At most one live timer per key; re-arming or cancelling aborts the previous one.
///
/// Expiry is delivered as a [`TimerFired`] message rather than a callback so the
/// owner handles it on its own task. A message that raced with a cancel is
/// recognised as stale by [`Scheduler::accept`].
pub struct Scheduler {
    timers: HashMap<TimerKey, Armed>,
    next_generation: u64,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: HashMap::new(),
                next_generation: 0,
                tx,
            },
            rx,
        )
    }

    pub fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.cancel(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + after;
        let tx = self.tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            generation,
        };

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(fired);
        });

        debug!("Armed {:?} for {:?}", key, after);
        self.timers.insert(
            key,
            Armed {
                generation,
                deadline,
                handle,
            },
        );
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.timers.remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer whose key matches
    pub fn cancel_where(&mut self, mut matches: impl FnMut(&TimerKey) -> bool) -> usize {
        let keys: Vec<TimerKey> = self.timers.keys().filter(|k| matches(k)).cloned().collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    /// Consume an expiry; false when the timer was re-armed or cancelled meanwhile
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        match self.timers.get(&fired.key) {
            Some(armed) if armed.generation == fired.generation => {
                self.timers.remove(&fired.key);
                true
            }
            _ => {
                debug!("Ignoring stale expiry of {:?}", fired.key);
                false
            }
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn remaining(&self, key: &TimerKey) -> Option<Duration> {
        self.timers
            .get(key)
            .map(|armed| armed.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.handle.abort();
        }
    }
}
