use common::Digest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("Blob not found for: {0}")]
    BlobNotFound(Digest),
}
