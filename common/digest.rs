use crate::error::AddaxError;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

static DIGEST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new("^([0-9a-f]{64})/([0-9]+)$").expect("Failed to compile digest regex"));

static HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[0-9a-f]{64}$").expect("Failed to compile hash regex"));

static EMPTY_DIGEST: Lazy<Digest> = Lazy::new(|| Digest::of_bytes(&[]));

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Content identifier of a blob: the SHA-256 of its bytes plus its length.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Digest {
    hash: String,
    size_bytes: u64,
}

// Intentionally using getters so that Digest creation is forced through
// hashing or the validation logic in FromStr / TryFrom.
impl Digest {
    pub fn of_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Digest {
            hash: base16ct::lower::encode_string(&hash),
            size_bytes: data.len() as u64,
        }
    }

    /// Hash a file without loading it into memory.
    pub async fn of_file(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0; READ_BUFFER_SIZE];
        let mut size_bytes = 0u64;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size_bytes += read as u64;
        }
        Ok(Digest {
            hash: base16ct::lower::encode_string(&hasher.finalize()),
            size_bytes,
        })
    }

    /// Digest of the empty blob. It is never sent over the wire.
    pub fn empty() -> Self {
        EMPTY_DIGEST.clone()
    }

    pub fn is_empty(&self) -> bool {
        *self == *EMPTY_DIGEST
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Key under which the blob is stored.
    pub fn to_key(&self) -> String {
        self.to_string()
    }

    fn from_parts(hash: String, size_bytes: i64) -> Result<Self, AddaxError> {
        if !HASH_REGEX.is_match(&hash) {
            return Err(AddaxError::InvalidDigest(format!("bad hash '{hash}'")));
        }
        let size_bytes = u64::try_from(size_bytes)
            .map_err(|_| AddaxError::InvalidDigest(format!("negative size {size_bytes}")))?;
        Ok(Digest { hash, size_bytes })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl From<Digest> for protos::remote::ContentDigest {
    fn from(d: Digest) -> Self {
        protos::remote::ContentDigest {
            hash: d.hash,
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl TryFrom<protos::remote::ContentDigest> for Digest {
    type Error = AddaxError;

    fn try_from(d: protos::remote::ContentDigest) -> Result<Self, Self::Error> {
        Digest::from_parts(d.hash, d.size_bytes)
    }
}

impl std::str::FromStr for Digest {
    type Err = AddaxError;

    fn from_str(digest: &str) -> Result<Digest, Self::Err> {
        let matches = DIGEST_REGEX
            .captures(digest)
            .ok_or_else(|| AddaxError::InvalidDigest(digest.to_string()))?;
        Ok(Digest {
            hash: matches[1].to_string(),
            size_bytes: matches[2]
                .parse::<u64>()
                .map_err(|_| AddaxError::InvalidDigest(digest.to_string()))?,
        })
    }
}
