use super::ServiceOptions;
use cas::ContentAddressableStorage;
use common::{AddaxError, Chunk, ChunkAssembler, Chunker, Digest};
use protos::{remote, ErrorCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, event, info, instrument, warn, Level};

#[derive(Debug)]
pub struct ContentStorageService<T> {
    cas: T,
    options: ServiceOptions,
}

impl<T> ContentStorageService<T> {
    pub fn new(cas: T, options: ServiceOptions) -> Self {
        ContentStorageService { cas, options }
    }
}

type CasResult<T> = Result<Response<T>, Status>;
type DownloadReplies = ReceiverStream<Result<remote::CasDownloadReply, Status>>;

impl<T: ContentAddressableStorage> ContentStorageService<T> {
    async fn missing(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        let mut missing = vec![];
        for digest in digests {
            if digest.is_empty() {
                continue;
            }
            if !self
                .cas
                .has_blob(digest)
                .await
                .map_err(|e| Status::internal(e.to_string()))?
            {
                event!(Level::DEBUG, %digest, "digest missing");
                missing.push(digest.clone());
            }
        }
        Ok(missing)
    }
}

#[tonic::async_trait]
impl<T: ContentAddressableStorage> protos::CasService for ContentStorageService<T> {
    type DownloadBlobStream = DownloadReplies;

    #[instrument(skip_all, fields(digests = request.get_ref().digest.len()))]
    async fn lookup(
        &self,
        request: Request<remote::CasLookupRequest>,
    ) -> CasResult<remote::CasLookupReply> {
        let status = match parse_digests(request.into_inner().digest) {
            Ok(digests) => {
                let missing = self.missing(&digests).await?;
                debug!(missing = missing.len(), "lookup done");
                remote::CasStatus {
                    missing_digest: missing.into_iter().map(Into::into).collect(),
                    ..success()
                }
            }
            Err(e) => failure(&e),
        };
        Ok(Response::new(remote::CasLookupReply {
            status: Some(status),
        }))
    }

    #[instrument(skip_all, fields(digests = request.get_ref().digest.len()))]
    async fn download_blob(
        &self,
        request: Request<remote::CasDownloadBlobRequest>,
    ) -> CasResult<Self::DownloadBlobStream> {
        let mut digests = match parse_digests(request.into_inner().digest) {
            Ok(digests) => digests,
            Err(e) => return single_reply(failure(&e)).await,
        };

        let missing = self.missing(&digests).await?;
        if !missing.is_empty() {
            info!(missing = missing.len(), "download of absent blobs refused");
            let mut status = remote::CasStatus {
                succeeded: false,
                error_detail: format!("{} requested blobs are not stored", missing.len()),
                missing_digest: missing.into_iter().map(Into::into).collect(),
                ..Default::default()
            };
            status.set_error(ErrorCode::MissingDigest);
            return single_reply(status).await;
        }

        if self.options.reverse_download_order {
            digests.reverse();
        }

        let (tx, rx) = mpsc::channel(32);
        let cas = self.cas.clone();
        let max_chunk_size = self.options.max_chunk_size_bytes;
        tokio::spawn(async move {
            for digest in digests {
                let blob = if digest.is_empty() {
                    vec![]
                } else {
                    match cas.read_blob(&digest).await {
                        Ok(blob) => blob,
                        Err(e) => {
                            let _ = tx.send(Err(Status::not_found(e.to_string()))).await;
                            return;
                        }
                    }
                };
                // An empty blob still needs one chunk to announce its digest.
                let announce_empty = digest.is_empty().then(|| Chunk {
                    digest: Some(digest.clone()),
                    offset: 0,
                    data: vec![],
                });
                for chunk in Chunker::with_digest(digest, blob, max_chunk_size).chain(announce_empty) {
                    let reply = remote::CasDownloadReply {
                        status: Some(success()),
                        data: Some(chunk.into()),
                    };
                    if tx.send(Ok(reply)).await.is_err() {
                        debug!("client went away mid download");
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    /// Commits every blob of the stream as soon as it is complete and
    /// verified. The first bad chunk ends the upload.
    #[instrument(skip_all)]
    async fn upload_blob(
        &self,
        request: Request<Streaming<remote::CasUploadBlobRequest>>,
    ) -> CasResult<remote::CasUploadBlobReply> {
        let mut stream = request.into_inner();
        let mut assembler = ChunkAssembler::new();
        let mut committed = 0;

        while let Some(message) = stream.next().await {
            let ingested = message?
                .data
                .ok_or_else(|| AddaxError::InvalidChunk("upload request carries no data".to_string()))
                .and_then(Chunk::try_from)
                .and_then(|chunk| assembler.ingest(chunk));
            match ingested {
                Ok(Some((digest, blob))) => {
                    self.cas
                        .write_blob(&digest, blob)
                        .await
                        .map_err(|e| Status::internal(e.to_string()))?;
                    info!(%digest, "committed blob");
                    committed += 1;
                }
                Ok(None) => {}
                Err(e) => return Ok(upload_failed(&e, committed)),
            }
        }
        if let Err(e) = assembler.finish() {
            return Ok(upload_failed(&e, committed));
        }

        debug!(committed, "upload stream complete");
        Ok(Response::new(remote::CasUploadBlobReply {
            status: Some(success()),
        }))
    }
}

fn upload_failed(err: &AddaxError, committed: usize) -> Response<remote::CasUploadBlobReply> {
    warn!(error = %err, committed, "abandoning upload stream");
    Response::new(remote::CasUploadBlobReply {
        status: Some(failure(err)),
    })
}

async fn single_reply(status: remote::CasStatus) -> CasResult<DownloadReplies> {
    let (tx, rx) = mpsc::channel(1);
    tx.send(Ok(remote::CasDownloadReply {
        status: Some(status),
        data: None,
    }))
    .await
    .map_err(|_| Status::internal("download reply channel closed"))?;
    Ok(Response::new(ReceiverStream::new(rx)))
}

fn parse_digests(digests: Vec<remote::ContentDigest>) -> Result<Vec<Digest>, AddaxError> {
    digests.into_iter().map(Digest::try_from).collect()
}

fn success() -> remote::CasStatus {
    remote::CasStatus {
        succeeded: true,
        ..Default::default()
    }
}

fn failure(err: &AddaxError) -> remote::CasStatus {
    let mut status = remote::CasStatus {
        succeeded: false,
        error_detail: err.to_string(),
        ..Default::default()
    };
    match err {
        AddaxError::DigestMismatch { declared, computed } => {
            status.set_error(ErrorCode::DigestMismatch);
            status.declared_digest = Some(declared.clone().into());
            status.computed_digest = Some(computed.clone().into());
        }
        _ => status.set_error(ErrorCode::InvalidArgument),
    }
    status
}
