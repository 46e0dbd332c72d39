use async_trait::async_trait;
use common::Digest;

mod error;
mod memory;

pub use error::CasError;
pub use memory::InMemory;

/// Server-side blob storage, keyed by digest.
///
/// Implementations are shared between concurrent RPCs, so cloning must give
/// a handle onto the same storage.
#[async_trait]
pub trait ContentAddressableStorage: Clone + Send + Sync + 'static {
    /// Store `data` under `digest`. The caller has already verified that
    /// `data` hashes to `digest`. Writing a digest that is already stored
    /// leaves the existing entry untouched.
    async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<(), CasError>;

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, CasError>;

    async fn has_blob(&self, digest: &Digest) -> Result<bool, CasError>;
}
