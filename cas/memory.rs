use crate::error::CasError;
use async_trait::async_trait;
use common::Digest;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default, Debug)]
pub struct InMemory {
    cas: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl InMemory {
    /// Hash and store `data`, returning its digest.
    pub async fn put(&self, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);
        self.cas
            .write()
            .await
            .entry(digest.to_key())
            .or_insert_with(|| Arc::new(data.to_vec()));
        digest
    }

    pub async fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        let cas = self.cas.read().await;
        cas.get(&digest.to_key()).map(|data| data.to_vec())
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.cas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cas.read().await.is_empty()
    }
}

#[async_trait]
impl crate::ContentAddressableStorage for InMemory {
    async fn write_blob(&self, digest: &Digest, data: Vec<u8>) -> Result<(), CasError> {
        let mut cas = self.cas.write().await;
        if cas.contains_key(&digest.to_key()) {
            log::debug!("write: {} already stored", digest);
            return Ok(());
        }
        log::info!("write: {}", digest);
        cas.insert(digest.to_key(), Arc::new(data));
        Ok(())
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, CasError> {
        let data = {
            let cas = self.cas.read().await;
            cas.get(&digest.to_key())
                .cloned()
                .ok_or_else(|| CasError::BlobNotFound(digest.clone()))?
        };
        log::info!("read: {}", digest);
        Ok(data.to_vec())
    }

    async fn has_blob(&self, digest: &Digest) -> Result<bool, CasError> {
        let cas = self.cas.read().await;
        let r = cas.contains_key(&digest.to_key());
        log::info!("check: {} / {}", digest, r);
        Ok(r)
    }
}
