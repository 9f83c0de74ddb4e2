use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Reports how many bytes the receiver can still store
pub trait StorageProbe: Send + Sync {
    fn available_bytes(&self) -> Result<u64>;
}

/// Storage budget: a fixed quota minus what the recordings directory already uses
pub struct QuotaStorageProbe {
    dir: PathBuf,
    quota_bytes: u64,
}

impl QuotaStorageProbe {
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes,
        }
    }
}

impl StorageProbe for QuotaStorageProbe {
    fn available_bytes(&self) -> Result<u64> {
        if !self.dir.exists() {
            return Ok(self.quota_bytes);
        }
        let used = dir_size(&self.dir)?;
        Ok(self.quota_bytes.saturating_sub(used))
    }
}

/// Constant availability, for tests and hosts that manage storage themselves
pub struct FixedStorageProbe(pub u64);

impl StorageProbe for FixedStorageProbe {
    fn available_bytes(&self) -> Result<u64> {
        Ok(self.0)
    }
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
