use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Duration of the silence inserted for each chunk that never arrived
pub const GAP_FILL_SECS: f64 = 1.0;

/// Sequence numbers a session may use unless configured otherwise
pub const DEFAULT_MAX_CHUNKS: u32 = 3600;

/// Raw PCM format of a chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bits per sample (16 for the wearable's PCM)
    pub bit_depth: u16,
}

impl AudioFormat {
    /// Size in bytes of one interleaved frame
    pub fn frame_size(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// Byte count for `secs` of audio, rounded down to a whole frame
    pub fn bytes_for_secs(&self, secs: f64) -> usize {
        let frames = (self.sample_rate as f64 * secs).floor() as usize;
        frames * self.frame_size()
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// One sequenced fragment of a recording sent on the incremental path
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub chunk_id: String,
    pub session_id: String,
    pub sequence_number: u32,
    pub payload: Vec<u8>,
    /// Captured duration in seconds
    pub duration: f64,
    pub format: AudioFormat,
    pub is_last_chunk: bool,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("chunk {sequence} lies beyond the last chunk (expected total {expected_total})")]
    SequenceBeyondEnd { sequence: u32, expected_total: u32 },

    #[error("chunk {sequence} claims to be last but the session already ends at {expected_total}")]
    ConflictingLastChunk { sequence: u32, expected_total: u32 },

    #[error("chunk {sequence} format {found:?} does not match session format {expected:?}")]
    FormatMismatch {
        sequence: u32,
        expected: AudioFormat,
        found: AudioFormat,
    },

    #[error("chunk {sequence} is outside the session limit of {limit} chunks")]
    SequenceOutOfRange { sequence: u32, limit: u32 },

    #[error("no chunks buffered")]
    Empty,
}

/// Result of offering a chunk to the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// The sequence number was already buffered; nothing changed
    pub duplicate: bool,
    /// Session whose buffer was dropped because this chunk started a new one
    pub discarded_session: Option<String>,
}

/// Best-effort ordered audio produced from a chunk buffer
#[derive(Debug, Clone)]
pub struct AssembledAudio {
    pub session_id: String,
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    /// Sequence numbers replaced by synthesized silence
    pub filled: Vec<u32>,
    /// Set when any gap was filled or the end of the session was never seen
    pub degraded: bool,
    pub duration_secs: f64,
    pub started_at: DateTime<Utc>,
}

/// Reassembles one recording session from out-of-order, possibly duplicated chunks.
///
/// Only one session is buffered at a time; a chunk for another session discards
/// the current buffer. Sequence numbers at or above the chunk limit are
/// refused so gap-filling never runs past a bounded size.
#[derive(Debug)]
pub struct ChunkAssembler {
    session_id: Option<String>,
    chunks: BTreeMap<u32, AudioChunk>,
    expected_total: Option<u32>,
    max_chunks: u32,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_CHUNKS)
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_chunks: u32) -> Self {
        Self {
            session_id: None,
            chunks: BTreeMap::new(),
            expected_total: None,
            max_chunks,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Known once the chunk flagged `is_last_chunk` has arrived
    pub fn expected_total(&self) -> Option<u32> {
        self.expected_total
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn add_chunk(&mut self, chunk: AudioChunk) -> Result<ChunkReceipt, AssemblyError> {
        let out_of_range = AssemblyError::SequenceOutOfRange {
            sequence: chunk.sequence_number,
            limit: self.max_chunks,
        };
        if chunk.sequence_number >= self.max_chunks {
            return Err(out_of_range);
        }

        let mut discarded_session = None;

        if self.session_id.as_deref() != Some(chunk.session_id.as_str()) {
            if let Some(previous) = self.session_id.take() {
                warn!(
                    "Discarding {} buffered chunks of session {} for new session {}",
                    self.chunks.len(),
                    previous,
                    chunk.session_id
                );
                discarded_session = Some(previous);
            }
            self.chunks.clear();
            self.expected_total = None;
            self.session_id = Some(chunk.session_id.clone());
            info!("Started assembling session {}", chunk.session_id);
        }

        let sequence = chunk.sequence_number;

        if self.chunks.contains_key(&sequence) {
            debug!("Duplicate chunk {} for session {}", sequence, chunk.session_id);
            return Ok(ChunkReceipt {
                duplicate: true,
                discarded_session,
            });
        }

        if let Some(first) = self.chunks.values().next() {
            if first.format != chunk.format {
                return Err(AssemblyError::FormatMismatch {
                    sequence,
                    expected: first.format,
                    found: chunk.format,
                });
            }
        }

        if chunk.is_last_chunk {
            let total = sequence.checked_add(1).ok_or(out_of_range)?;
            if let Some(expected_total) = self.expected_total {
                if expected_total != total {
                    return Err(AssemblyError::ConflictingLastChunk {
                        sequence,
                        expected_total,
                    });
                }
            }
            if let Some((&highest, _)) = self.chunks.iter().next_back() {
                if highest >= total {
                    return Err(AssemblyError::ConflictingLastChunk {
                        sequence,
                        expected_total: highest.saturating_add(1),
                    });
                }
            }
            self.expected_total = Some(total);
        } else if let Some(expected_total) = self.expected_total {
            if sequence >= expected_total {
                return Err(AssemblyError::SequenceBeyondEnd {
                    sequence,
                    expected_total,
                });
            }
        }

        self.chunks.insert(sequence, chunk);

        Ok(ChunkReceipt {
            duplicate: false,
            discarded_session,
        })
    }

    pub fn has_chunk(&self, sequence: u32) -> bool {
        self.chunks.contains_key(&sequence)
    }

    /// Missing sequence numbers.
    ///
    /// Before the last chunk is known this only reports gaps below the highest
    /// sequence seen so far.
    pub fn missing_sequences(&self) -> Vec<u32> {
        let end = match (self.expected_total, self.chunks.keys().next_back()) {
            (Some(total), _) => total,
            (None, Some(&highest)) => highest.saturating_add(1),
            (None, None) => return Vec::new(),
        };

        (0..end).filter(|seq| !self.chunks.contains_key(seq)).collect()
    }

    pub fn is_complete(&self) -> bool {
        match self.expected_total {
            Some(total) => self.chunks.len() == total as usize,
            None => false,
        }
    }

    /// Concatenate payloads in sequence order, filling each gap with one second
    /// of silence in the session's format.
    pub fn combine(&self) -> Result<AssembledAudio, AssemblyError> {
        let (Some(session_id), Some(first)) = (&self.session_id, self.chunks.values().next())
        else {
            return Err(AssemblyError::Empty);
        };

        let format = first.format;
        let end = match self.expected_total {
            Some(total) => total,
            None => self
                .chunks
                .keys()
                .next_back()
                .map_or(0, |&highest| highest.saturating_add(1)),
        };

        let silence_len = format.bytes_for_secs(GAP_FILL_SECS);
        let mut bytes = Vec::new();
        let mut filled = Vec::new();
        let mut duration_secs = 0.0;

        for sequence in 0..end {
            match self.chunks.get(&sequence) {
                Some(chunk) => {
                    bytes.extend_from_slice(&chunk.payload);
                    duration_secs += chunk.duration;
                }
                None => {
                    bytes.resize(bytes.len() + silence_len, 0);
                    duration_secs += GAP_FILL_SECS;
                    filled.push(sequence);
                }
            }
        }

        let started_at = self
            .chunks
            .values()
            .map(|chunk| chunk.captured_at)
            .min()
            .unwrap_or(first.captured_at);

        if !filled.is_empty() {
            warn!(
                "Session {} assembled with {} silence-filled gaps: {:?}",
                session_id,
                filled.len(),
                filled
            );
        }

        Ok(AssembledAudio {
            session_id: session_id.clone(),
            bytes,
            format,
            degraded: !filled.is_empty() || self.expected_total.is_none(),
            filled,
            duration_secs,
            started_at,
        })
    }

    /// Drop the buffered session
    pub fn reset(&mut self) {
        self.session_id = None;
        self.chunks.clear();
        self.expected_total = None;
    }
}
