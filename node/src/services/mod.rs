//! gRPC services of the addax cache node

use serde::Deserialize;

mod action_cache;
pub use action_cache::ActionCacheService;

mod content_storage;
pub use content_storage::ContentStorageService;

/// Tunables of the node's services, the `[node.service]` configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Largest `data` payload of a chunk sent by `DownloadBlob`.
    pub max_chunk_size_bytes: usize,
    /// Stream downloaded blobs in reverse request order. Clients must not
    /// depend on the order blobs arrive in; this makes that easy to check.
    pub reverse_download_order: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            max_chunk_size_bytes: 1024 * 1024,
            reverse_download_order: false,
        }
    }
}
