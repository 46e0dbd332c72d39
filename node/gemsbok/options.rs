use crate::CacheError;
use serde::Deserialize;
use std::time::Duration;

/// Limits applied to every call made by [`crate::Gemsbok`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Largest `data` payload of a single chunk.
    pub max_chunk_size_bytes: usize,
    /// Most digests or blobs sent in one batch.
    pub max_batch_inputs: usize,
    /// Most blob bytes sent in one batch. A single larger blob still gets a
    /// batch of its own.
    pub max_batch_size_bytes: u64,
    /// Deadline for a whole logical call, across all of its batches.
    pub timeout_seconds: u64,
    /// Batches of one call that may be in flight at the same time.
    pub max_concurrent_batches: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_chunk_size_bytes: 400_000,
            max_batch_inputs: 100,
            max_batch_size_bytes: 10 * 1024 * 1024,
            timeout_seconds: 60,
            max_concurrent_batches: 4,
        }
    }
}

impl CacheOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        let zero = [
            ("max_chunk_size_bytes", self.max_chunk_size_bytes as u64),
            ("max_batch_inputs", self.max_batch_inputs as u64),
            ("max_batch_size_bytes", self.max_batch_size_bytes),
            ("timeout_seconds", self.timeout_seconds),
            ("max_concurrent_batches", self.max_concurrent_batches as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        match zero {
            Some((name, _)) => Err(CacheError::InvalidOptions(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}
