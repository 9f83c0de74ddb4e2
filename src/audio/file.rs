use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hound::{WavReader, WavSpec, WavWriter};
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

use super::chunk::AssembledAudio;

/// A finished recording on disk, probed for the metadata a sync request needs
pub struct AudioFile {
    pub path: String,
    pub filename: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub created_at: DateTime<Utc>,
    /// Raw file contents, sent as-is on the bulk transfer channel
    pub bytes: Vec<u8>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

        let spec = reader.spec();
        let duration_seconds = reader.duration() as f64 / spec.sample_rate as f64;
        drop(reader);

        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read recording: {}", path.display()))?;

        let created_at = fs::metadata(path)
            .and_then(|meta| meta.created().or_else(|_| meta.modified()))
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.wav".to_string());

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} bytes",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            bytes.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            filename,
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            created_at,
            bytes,
        })
    }
}

/// Write chunk-assembled PCM (little-endian, interleaved) as a WAV file
pub fn write_wav(path: impl AsRef<Path>, audio: &AssembledAudio) -> Result<()> {
    let path = path.as_ref();

    let spec = WavSpec {
        channels: audio.format.channels,
        sample_rate: audio.format.sample_rate,
        bits_per_sample: audio.format.bit_depth,
        sample_format: hound::SampleFormat::Int,
    };

    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create WAV file: {:?}", path))?;
    let mut writer = WavWriter::new(BufWriter::new(file), spec)
        .with_context(|| format!("Failed to create WAV writer: {:?}", path))?;

    match audio.format.bit_depth {
        16 => {
            for pair in audio.bytes.chunks_exact(2) {
                writer
                    .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                    .context("Failed to write sample to WAV")?;
            }
        }
        8 => {
            for &byte in &audio.bytes {
                writer
                    .write_sample(byte as i8)
                    .context("Failed to write sample to WAV")?;
            }
        }
        32 => {
            for quad in audio.bytes.chunks_exact(4) {
                writer
                    .write_sample(i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                    .context("Failed to write sample to WAV")?;
            }
        }
        other => anyhow::bail!("Unsupported bit depth for WAV output: {}", other),
    }

    writer.finalize().context("Failed to finalize WAV file")?;

    Ok(())
}
