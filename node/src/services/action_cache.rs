use cas::ContentAddressableStorage;
use common::Digest;
use protos::remote;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

/// Cached action results, keyed by action digest. Results only reference
/// blobs in `cas`.
#[derive(Debug)]
pub struct ActionCacheService<T> {
    cas: T,
    results: Arc<RwLock<HashMap<Digest, remote::ActionResult>>>,
}

impl<T> ActionCacheService<T> {
    pub fn new(cas: T) -> Self {
        ActionCacheService {
            cas,
            results: Default::default(),
        }
    }
}

fn action_digest(digest: Option<remote::ContentDigest>) -> Result<Digest, Status> {
    let digest = digest.ok_or_else(|| Status::invalid_argument("No action digest"))?;
    Digest::try_from(digest).map_err(|e| Status::invalid_argument(e.to_string()))
}

#[tonic::async_trait]
impl<T: ContentAddressableStorage> protos::ExecutionCacheService for ActionCacheService<T> {
    #[instrument(skip_all)]
    async fn get_cached_result(
        &self,
        request: Request<remote::ExecutionCacheRequest>,
    ) -> Result<Response<remote::ExecutionCacheReply>, Status> {
        let digest = action_digest(request.into_inner().action_digest)?;
        let result = self.results.read().await.get(&digest).cloned();
        info!(%digest, hit = result.is_some(), "action cache lookup");
        Ok(Response::new(remote::ExecutionCacheReply { result }))
    }

    #[instrument(skip_all)]
    async fn set_cached_result(
        &self,
        request: Request<remote::ExecutionCacheSetRequest>,
    ) -> Result<Response<remote::ExecutionCacheSetReply>, Status> {
        let request = request.into_inner();
        let digest = action_digest(request.action_digest)?;
        let result = request
            .result
            .ok_or_else(|| Status::invalid_argument("No action result"))?;

        let mut missing = vec![];
        for output in &result.output {
            let output_digest = output
                .file_metadata
                .as_ref()
                .and_then(|metadata| metadata.digest.clone())
                .ok_or_else(|| {
                    Status::invalid_argument(format!("Output {} has no digest", output.path))
                })?;
            let output_digest = Digest::try_from(output_digest)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            if output_digest.is_empty() {
                continue;
            }
            if !self
                .cas
                .has_blob(&output_digest)
                .await
                .map_err(|e| Status::internal(e.to_string()))?
            {
                missing.push(format!("{} ({output_digest})", output.path));
            }
        }
        if !missing.is_empty() {
            return Err(Status::failed_precondition(format!(
                "Outputs missing from the CAS: {}",
                missing.join(", ")
            )));
        }

        info!(%digest, outputs = result.output.len(), "cached action result");
        self.results.write().await.insert(digest, result);
        Ok(Response::new(remote::ExecutionCacheSetReply {}))
    }
}
