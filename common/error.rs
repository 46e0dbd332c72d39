use crate::Digest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddaxError {
    #[error("Digest format not valid: {0}")]
    InvalidDigest(String),
    #[error("Chunk not valid: {0}")]
    InvalidChunk(String),
    #[error("Missing input chunk for digest {0}")]
    MissingInputChunk(Digest),
    #[error("First chunk contains no digest")]
    FirstChunkWithoutDigest,
    #[error("Received {received} bytes for digest {digest}")]
    ChunkOverflow { digest: Digest, received: u64 },
    #[error("Digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: Digest, computed: Digest },
}
