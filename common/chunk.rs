//! Streaming representation of blobs.
//!
//! A blob travels as a sequence of [`Chunk`]s. The first chunk of a blob
//! carries its digest, every chunk carries the offset at which its data
//! starts. Several blobs may share one stream, back to back.

use crate::{AddaxError, Digest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Only set on the first chunk of a blob.
    pub digest: Option<Digest>,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl From<Chunk> for protos::remote::BlobChunk {
    fn from(chunk: Chunk) -> Self {
        protos::remote::BlobChunk {
            digest: chunk.digest.map(Into::into),
            offset: chunk.offset as i64,
            data: chunk.data,
        }
    }
}

impl TryFrom<protos::remote::BlobChunk> for Chunk {
    type Error = AddaxError;

    fn try_from(chunk: protos::remote::BlobChunk) -> Result<Self, Self::Error> {
        let offset = u64::try_from(chunk.offset)
            .map_err(|_| AddaxError::InvalidChunk(format!("negative offset {}", chunk.offset)))?;
        Ok(Chunk {
            digest: chunk.digest.map(Digest::try_from).transpose()?,
            offset,
            data: chunk.data,
        })
    }
}

/// Splits a blob into chunks of at most `max_chunk_size` bytes.
///
/// Chunks are produced lazily. Cloning a fresh `Chunker` gives an
/// independent pass over the same blob. An empty blob yields no chunks.
#[derive(Clone, Debug)]
pub struct Chunker<B> {
    digest: Digest,
    data: B,
    max_chunk_size: usize,
    offset: usize,
}

impl<B: AsRef<[u8]>> Chunker<B> {
    pub fn new(data: B, max_chunk_size: usize) -> Self {
        let digest = Digest::of_bytes(data.as_ref());
        Chunker::with_digest(digest, data, max_chunk_size)
    }

    /// Like [`Chunker::new`] for callers that already hashed `data`.
    pub fn with_digest(digest: Digest, data: B, max_chunk_size: usize) -> Self {
        debug_assert_eq!(digest.size_bytes(), data.as_ref().len() as u64);
        Chunker {
            digest,
            data,
            max_chunk_size: max_chunk_size.max(1),
            offset: 0,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl<B: AsRef<[u8]>> Iterator for Chunker<B> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let data = self.data.as_ref();
        if self.offset >= data.len() {
            return None;
        }
        let end = data.len().min(self.offset + self.max_chunk_size);
        let chunk = Chunk {
            digest: (self.offset == 0).then(|| self.digest.clone()),
            offset: self.offset as u64,
            data: data[self.offset..end].to_vec(),
        };
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.as_ref().len().saturating_sub(self.offset);
        let chunks = (remaining + self.max_chunk_size - 1) / self.max_chunk_size;
        (chunks, Some(chunks))
    }
}

#[derive(Debug, Default)]
enum StreamState {
    #[default]
    AwaitingDigest,
    Receiving {
        digest: Digest,
        blob: Vec<u8>,
    },
}

/// Reassembles blobs from a stream of chunks.
///
/// Chunks must be fed in arrival order. After an error the stream is
/// unusable and must be abandoned.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    state: StreamState,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        ChunkAssembler::default()
    }

    /// Feed the next chunk. Returns the blob once its last chunk arrived and
    /// its contents hash to the declared digest.
    pub fn ingest(&mut self, chunk: Chunk) -> Result<Option<(Digest, Vec<u8>)>, AddaxError> {
        let (digest, mut blob) = match (std::mem::take(&mut self.state), chunk.digest) {
            // A new blob started before the previous one was complete.
            (StreamState::Receiving { digest, .. }, Some(_)) => {
                return Err(AddaxError::MissingInputChunk(digest))
            }
            (StreamState::AwaitingDigest, Some(digest)) => (digest, Vec::new()),
            (StreamState::Receiving { digest, blob }, None) => (digest, blob),
            (StreamState::AwaitingDigest, None) => return Err(AddaxError::FirstChunkWithoutDigest),
        };

        if chunk.offset != blob.len() as u64 {
            return Err(AddaxError::MissingInputChunk(digest));
        }
        let received = blob.len() as u64 + chunk.data.len() as u64;
        if received > digest.size_bytes() {
            return Err(AddaxError::ChunkOverflow { digest, received });
        }
        blob.extend_from_slice(&chunk.data);

        if received < digest.size_bytes() {
            self.state = StreamState::Receiving { digest, blob };
            return Ok(None);
        }

        let computed = Digest::of_bytes(&blob);
        if computed != digest {
            return Err(AddaxError::DigestMismatch {
                declared: digest,
                computed,
            });
        }
        Ok(Some((digest, blob)))
    }

    /// Call at the end of the stream; fails if it stopped mid-blob.
    pub fn finish(self) -> Result<(), AddaxError> {
        match self.state {
            StreamState::AwaitingDigest => Ok(()),
            StreamState::Receiving { digest, .. } => Err(AddaxError::MissingInputChunk(digest)),
        }
    }
}
