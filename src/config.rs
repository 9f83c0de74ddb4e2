use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::chunk::DEFAULT_MAX_CHUNKS;
use crate::sync::{ConflictPolicy, DeviceRole};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub link: LinkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// This device's identity on the link
    pub device_id: String,
    /// The paired device
    pub peer_id: String,
    pub nats_url: String,
    #[serde(default = "default_presence_interval")]
    pub presence_interval_secs: u64,
}

fn default_presence_interval() -> u64 {
    5
}

impl LinkConfig {
    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs.max(1))
    }
}

/// Protocol timing and policy knobs; every field has a default
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a sender waits for the link before giving up on a request
    pub readiness_timeout_secs: u64,
    /// How long a sender waits for `syncAccepted` / `syncRejected`
    pub request_timeout_secs: u64,
    /// How long the persistence sink may take
    pub persist_timeout_secs: u64,
    pub confirmation_attempts: u32,
    pub confirmation_interval_secs: u64,
    /// Budget of an operation while the app is backgrounded
    pub background_lease_secs: u64,
    pub chunk_ack_timeout_secs: u64,
    pub chunk_max_attempts: u32,
    /// Inactivity window after which a chunk session is gap-filled and closed
    pub chunk_gap_grace_secs: u64,
    /// Highest sequence number (exclusive) accepted for one chunk session
    pub max_chunks_per_session: u32,
    /// Headroom kept free on top of the advertised file size
    pub storage_reserve_bytes: u64,
    /// `retryAfter` advertised with `app_not_ready`
    pub rejected_retry_after_secs: u64,
    /// Which end of the link this service is; both ends read the conflict
    /// policy in these terms
    pub role: DeviceRole,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 30,
            request_timeout_secs: 30,
            persist_timeout_secs: 60,
            confirmation_attempts: 3,
            confirmation_interval_secs: 2,
            background_lease_secs: 180,
            chunk_ack_timeout_secs: 5,
            chunk_max_attempts: 3,
            chunk_gap_grace_secs: 10,
            max_chunks_per_session: DEFAULT_MAX_CHUNKS,
            storage_reserve_bytes: 10 * 1024 * 1024,
            rejected_retry_after_secs: 30,
            role: DeviceRole::Phone,
            conflict_policy: ConflictPolicy::MostRecent,
        }
    }
}

impl SyncConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }

    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_interval_secs)
    }

    pub fn background_lease(&self) -> Duration {
        Duration::from_secs(self.background_lease_secs)
    }

    pub fn chunk_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_ack_timeout_secs)
    }

    pub fn chunk_gap_grace(&self) -> Duration {
        Duration::from_secs(self.chunk_gap_grace_secs)
    }

    pub fn rejected_retry_after(&self) -> Duration {
        Duration::from_secs(self.rejected_retry_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub recordings_path: String,
    /// Space the recordings directory may occupy
    pub quota_bytes: u64,
}

impl StorageConfig {
    /// `recordings_path` with `~` and environment variables expanded
    pub fn recordings_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.recordings_path)
            .with_context(|| format!("Failed to expand {}", self.recordings_path))?;
        Ok(PathBuf::from(expanded.into_owned()))
    }
}

impl Config {
    /// Load from a config file (extension optional) with `LOQA_LINK__` env overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("LOQA_LINK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        Ok(settings.try_deserialize()?)
    }
}
