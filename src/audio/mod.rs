pub mod chunk;
pub mod file;

pub use chunk::{
    AssembledAudio, AssemblyError, AudioChunk, AudioFormat, ChunkAssembler, ChunkReceipt,
    DEFAULT_MAX_CHUNKS, GAP_FILL_SECS,
};
pub use file::{write_wav, AudioFile};
