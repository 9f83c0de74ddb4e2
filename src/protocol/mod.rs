pub mod codec;
pub mod messages;

pub use codec::{
    decode, decode_bytes, decode_metadata, encode, encode_metadata, CodecError, Envelope,
    MAX_SEQUENCE_NUMBER,
};
pub use messages::{
    ChunkAck, ChunkTransfer, LocationMetadata, ProtocolMessage, StateSyncRequest, StateUpdate,
    SyncOutcome, SyncRequest, SyncResponse, TransferMetadata, TRANSFER_TYPE_RECORDING,
};
