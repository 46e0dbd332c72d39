//! Types shared by the addax cache node and its clients.

pub mod chunk;
pub mod digest;
pub mod error;

pub use chunk::{Chunk, ChunkAssembler, Chunker};
pub use digest::Digest;
pub use error::AddaxError;
