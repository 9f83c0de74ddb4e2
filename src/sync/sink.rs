use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::audio::{write_wav, AssembledAudio, AudioFormat};
use crate::protocol::{LocationMetadata, SyncRequest};

/// How an artifact reached this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// Whole file over the bulk channel, checksum verified
    FileTransfer,
    /// Reassembled from incrementally sent chunks (raw PCM)
    Chunks,
}

/// Everything the persistence layer gets alongside the bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub recording_id: String,
    pub filename: String,
    pub duration_secs: f64,
    pub created_at: DateTime<Utc>,
    pub origin: ArtifactOrigin,
    pub checksum: Option<String>,
    pub location: Option<LocationMetadata>,
    /// PCM format for chunk-assembled artifacts
    pub format: Option<AudioFormat>,
    /// Gaps were filled with silence or the end of the recording never arrived
    pub degraded: bool,
    /// Sequence numbers replaced by silence
    pub filled_sequences: Vec<u32>,
    /// The request was rebuilt from transfer metadata (no pending operation existed)
    pub reconstructed: bool,
}

impl ArtifactMetadata {
    pub fn for_transfer(request: &SyncRequest, reconstructed: bool) -> Self {
        Self {
            recording_id: request.recording_id.clone(),
            filename: request.filename.clone(),
            duration_secs: request.duration,
            created_at: request.created_at,
            origin: ArtifactOrigin::FileTransfer,
            checksum: (!request.checksum.is_empty()).then(|| request.checksum.clone()),
            location: request.location.clone(),
            format: None,
            degraded: false,
            filled_sequences: Vec::new(),
            reconstructed,
        }
    }

    pub fn for_chunks(audio: &AssembledAudio) -> Self {
        Self {
            recording_id: audio.session_id.clone(),
            filename: format!("{}.wav", audio.session_id),
            duration_secs: audio.duration_secs,
            created_at: audio.started_at,
            origin: ArtifactOrigin::Chunks,
            checksum: None,
            location: None,
            format: Some(audio.format),
            degraded: audio.degraded,
            filled_sequences: audio.filled.clone(),
            reconstructed: false,
        }
    }
}

/// The single downstream boundary: durably store a finished artifact.
///
/// Returning `Ok` means the artifact is safe; only then is the sender told the
/// transfer completed.
#[async_trait::async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn on_artifact_ready(&self, bytes: Vec<u8>, metadata: ArtifactMetadata) -> Result<()>;
}

/// Stores artifacts under a directory with a JSON metadata sidecar
pub struct FileArtifactSink {
    dir: PathBuf,
}

impl FileArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create recordings directory {:?}", dir))?;
        Ok(Self { dir })
    }

    fn artifact_path(&self, metadata: &ArtifactMetadata) -> PathBuf {
        let name = std::path::Path::new(&metadata.filename)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.wav", metadata.recording_id));
        self.dir.join(name)
    }
}

#[async_trait::async_trait]
impl ArtifactSink for FileArtifactSink {
    async fn on_artifact_ready(&self, bytes: Vec<u8>, metadata: ArtifactMetadata) -> Result<()> {
        let path = self.artifact_path(&metadata);
        let sidecar = path.with_extension("json");
        let sidecar_json = serde_json::to_vec_pretty(&metadata)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            match (metadata.origin, metadata.format) {
                (ArtifactOrigin::Chunks, Some(format)) => {
                    let audio = AssembledAudio {
                        session_id: metadata.recording_id.clone(),
                        bytes,
                        format,
                        filled: metadata.filled_sequences.clone(),
                        degraded: metadata.degraded,
                        duration_secs: metadata.duration_secs,
                        started_at: metadata.created_at,
                    };
                    write_wav(&path, &audio)?;
                }
                _ => {
                    fs::write(&path, &bytes)
                        .with_context(|| format!("Failed to write artifact {:?}", path))?;
                }
            }

            fs::write(&sidecar, sidecar_json)
                .with_context(|| format!("Failed to write metadata {:?}", sidecar))?;

            info!(
                "Stored recording {} at {} (degraded={})",
                metadata.recording_id,
                path.display(),
                metadata.degraded
            );
            Ok(())
        })
        .await
        .context("Artifact writer panicked")?
    }
}
