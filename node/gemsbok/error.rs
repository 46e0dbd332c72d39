use common::{AddaxError, Digest};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: Digest, computed: Digest },
    #[error("Missing digests: {}", join(.0))]
    MissingDigests(Vec<Digest>),
    #[error("Remote cache unavailable: {0}")]
    Unavailable(tonic::Status),
    #[error("Transport failure: {0}")]
    Transport(#[from] tonic::Status),
    #[error("Remote cache call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote cache failure: {0}")]
    Remote(String),
    #[error("Filesystem failure on {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Path {path:?} is not inside output root {root:?}")]
    PathOutsideRoot { root: PathBuf, path: PathBuf },
    #[error("Path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("Invalid cache options: {0}")]
    InvalidOptions(String),
}

impl From<AddaxError> for CacheError {
    fn from(err: AddaxError) -> Self {
        match err {
            AddaxError::DigestMismatch { declared, computed } => {
                CacheError::DigestMismatch { declared, computed }
            }
            err => CacheError::Protocol(err.to_string()),
        }
    }
}

impl CacheError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CacheError::Filesystem { path, source }
    }
}

fn join(digests: &[Digest]) -> String {
    digests
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
