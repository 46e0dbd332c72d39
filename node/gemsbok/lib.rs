//! A client for the addax remote cache.
//!
//! [`Gemsbok`] moves blobs and action outputs between a build and the cache
//! node with as little traffic as possible: empty blobs never leave the
//! process, blobs the node already holds are not uploaded again, and the
//! remaining transfers are packed into bounded, chunked batches.

use common::{Chunk, ChunkAssembler, Chunker, Digest};
use futures::{stream, Future, StreamExt};
use protos::{CasServiceClient, ErrorCode, ExecutionCacheServiceClient};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{transport::Channel, Request};
use tracing::{debug, info, instrument};

mod action_result;
mod batch;
mod error;
mod options;

use action_result::{output_location, relative_output_path};

pub use action_result::{ActionResult, Output};
pub use batch::{plan_batches, Batch};
pub use error::CacheError;
pub use options::CacheOptions;

/// Upload requests buffered between the task reading blob contents and the
/// RPC sending them.
const CHUNKS_IN_FLIGHT: usize = 8;

#[derive(Clone, Debug)]
pub struct Gemsbok {
    cas: CasServiceClient<Channel>,
    action_cache: ExecutionCacheServiceClient<Channel>,
    options: CacheOptions,
}

impl Gemsbok {
    pub fn new(channel: Channel) -> Self {
        Gemsbok {
            cas: CasServiceClient::new(channel.clone()),
            action_cache: ExecutionCacheServiceClient::new(channel),
            options: CacheOptions::default(),
        }
    }

    pub fn with_options(channel: Channel, options: CacheOptions) -> Result<Self, CacheError> {
        options.validate()?;
        Ok(Gemsbok {
            options,
            ..Gemsbok::new(channel)
        })
    }

    /// Upload `blobs`, returning their digests in the same order.
    ///
    /// Blobs the cache already holds, and empty blobs, are not sent.
    #[instrument(skip_all, fields(blobs = blobs.len()))]
    pub async fn upload_blobs<B: AsRef<[u8]>>(&self, blobs: &[B]) -> Result<Vec<Digest>, CacheError> {
        let digests: Vec<Digest> = blobs.iter().map(|b| Digest::of_bytes(b.as_ref())).collect();
        let candidates = digests
            .iter()
            .cloned()
            .zip(blobs.iter().map(|b| Content::Bytes(b.as_ref())))
            .collect();
        self.with_deadline(|deadline| self.upload_missing(candidates, deadline))
            .await?;
        Ok(digests)
    }

    /// Download the blobs for `digests`. `result[i]` holds the contents of
    /// `digests[i]`. Fails as a whole if the cache lacks any of them.
    #[instrument(skip_all, fields(digests = digests.len()))]
    pub async fn download_blobs(&self, digests: &[Digest]) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut seen = HashSet::new();
        let wanted: Vec<Digest> = digests
            .iter()
            .filter(|d| !d.is_empty() && seen.insert(*d))
            .cloned()
            .collect();

        let blobs = if wanted.is_empty() {
            HashMap::new()
        } else {
            self.with_deadline(|deadline| self.download_all(wanted, deadline))
                .await?
        };

        digests
            .iter()
            .map(|digest| {
                if digest.is_empty() {
                    return Ok(vec![]);
                }
                blobs
                    .get(digest)
                    .cloned()
                    .ok_or_else(|| CacheError::MissingDigests(vec![digest.clone()]))
            })
            .collect()
    }

    pub async fn download_blob(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        if digest.is_empty() {
            return Ok(vec![]);
        }
        let mut blobs = self.download_blobs(std::slice::from_ref(digest)).await?;
        blobs
            .pop()
            .ok_or_else(|| CacheError::MissingDigests(vec![digest.clone()]))
    }

    /// Upload `files` and record them, in order, in `result` with paths
    /// relative to `root`. `result` is only touched once every upload
    /// succeeded.
    ///
    /// Files are hashed as a stream and only read again, a chunk at a time,
    /// by the batch that sends them.
    #[instrument(skip_all, fields(root = %root.display(), files = files.len()))]
    pub async fn upload_all_results<P: AsRef<Path>>(
        &self,
        root: &Path,
        files: &[P],
        result: &mut ActionResult,
    ) -> Result<(), CacheError> {
        let mut outputs = Vec::with_capacity(files.len());
        let mut candidates = Vec::with_capacity(files.len());
        for file in files {
            let file = file.as_ref();
            let path = relative_output_path(root, file)?;
            let metadata = tokio::fs::metadata(file)
                .await
                .map_err(CacheError::filesystem(file))?;
            let digest = Digest::of_file(file)
                .await
                .map_err(CacheError::filesystem(file))?;
            outputs.push(Output {
                path,
                digest: digest.clone(),
                executable: metadata.permissions().mode() & 0o111 != 0,
            });
            candidates.push((digest, Content::File(file.to_path_buf())));
        }

        self.with_deadline(|deadline| self.upload_missing(candidates, deadline))
            .await?;

        info!(outputs = outputs.len(), "recorded action outputs");
        result.extend(outputs);
        Ok(())
    }

    /// Write every output of `result` below `root`, creating directories as
    /// needed. Nothing is written unless every blob could be downloaded.
    #[instrument(skip_all, fields(root = %root.display(), outputs = result.outputs().len()))]
    pub async fn download_all_results(
        &self,
        result: &ActionResult,
        root: &Path,
    ) -> Result<(), CacheError> {
        let locations = result
            .outputs()
            .iter()
            .map(|output| output_location(root, &output.path))
            .collect::<Result<Vec<_>, _>>()?;
        let digests: Vec<Digest> = result.outputs().iter().map(|o| o.digest.clone()).collect();
        let blobs = self.download_blobs(&digests).await?;

        for ((output, location), blob) in result.outputs().iter().zip(locations).zip(blobs) {
            if let Some(parent) = location.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(CacheError::filesystem(parent))?;
            }
            tokio::fs::write(&location, &blob)
                .await
                .map_err(CacheError::filesystem(&location))?;
            if output.executable {
                tokio::fs::set_permissions(&location, std::fs::Permissions::from_mode(0o755))
                    .await
                    .map_err(CacheError::filesystem(&location))?;
            }
            debug!(path = %output.path, digest = %output.digest, "wrote output");
        }
        Ok(())
    }

    /// Look up the result cached for an action. `None` on a cache miss.
    #[instrument(skip(self))]
    pub async fn get_cached_result(
        &self,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>, CacheError> {
        let reply = self
            .with_deadline(|deadline| async move {
                let mut request = Request::new(protos::remote::ExecutionCacheRequest {
                    action_digest: Some(action_digest.clone().into()),
                });
                request.set_timeout(self.remaining(deadline)?);
                let reply = self
                    .action_cache
                    .clone()
                    .get_cached_result(request)
                    .await?;
                Ok::<_, CacheError>(reply.into_inner())
            })
            .await?;
        reply.result.map(ActionResult::try_from).transpose()
    }

    /// Cache `result` for an action. Its outputs must already be uploaded.
    #[instrument(skip(self, result))]
    pub async fn set_cached_result(
        &self,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<(), CacheError> {
        self.with_deadline(|deadline| async move {
            let mut request = Request::new(protos::remote::ExecutionCacheSetRequest {
                action_digest: Some(action_digest.clone().into()),
                result: Some(result.clone().into()),
            });
            request.set_timeout(self.remaining(deadline)?);
            self.action_cache.clone().set_cached_result(request).await?;
            Ok::<_, CacheError>(())
        })
        .await
    }

    async fn upload_missing(
        &self,
        candidates: Vec<(Digest, Content<'_>)>,
        deadline: Instant,
    ) -> Result<(), CacheError> {
        let mut seen = HashSet::new();
        let candidates: Vec<(Digest, Content)> = candidates
            .into_iter()
            .filter(|(digest, _)| !digest.is_empty() && seen.insert(digest.clone()))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let digests = candidates.iter().map(|(d, _)| d.clone()).collect();
        let missing = self.find_missing(digests, deadline).await?;
        let uploads: Vec<(Digest, Content)> = candidates
            .into_iter()
            .filter(|(digest, _)| missing.contains(digest))
            .collect();
        debug!(missing = uploads.len(), present = seen.len() - uploads.len(), "deduplicated upload");

        let batches = plan_batches(
            uploads,
            |(digest, _)| digest.size_bytes(),
            self.options.max_batch_inputs,
            self.options.max_batch_size_bytes,
        );
        self.run_batches(batches.into_iter().map(|batch| self.upload_batch(batch, deadline)))
            .await?;
        Ok(())
    }

    /// Ask the cache which of `digests` it does not hold.
    async fn find_missing(
        &self,
        digests: Vec<Digest>,
        deadline: Instant,
    ) -> Result<HashSet<Digest>, CacheError> {
        // Lookups carry no blob bytes, only the item count bounds them.
        let batches = plan_batches(
            digests,
            |_| 0,
            self.options.max_batch_inputs,
            self.options.max_batch_size_bytes,
        );
        let missing = self
            .run_batches(batches.into_iter().map(|batch| self.lookup_batch(batch, deadline)))
            .await?;
        Ok(missing.into_iter().flatten().collect())
    }

    async fn lookup_batch(
        &self,
        batch: Batch<Digest>,
        deadline: Instant,
    ) -> Result<Vec<Digest>, CacheError> {
        let mut request = Request::new(protos::remote::CasLookupRequest {
            digest: batch.into_items().into_iter().map(Into::into).collect(),
        });
        request.set_timeout(self.remaining(deadline)?);
        let reply = self
            .cas
            .clone()
            .lookup(request)
            .await
            .map_err(CacheError::Unavailable)?
            .into_inner();
        let status = check_status(reply.status, "lookup")?;
        status
            .missing_digest
            .into_iter()
            .map(|d| Digest::try_from(d).map_err(CacheError::from))
            .collect()
    }

    /// Upload one batch. Blob contents are only materialized here, and a
    /// file no more than a few chunks at a time.
    #[instrument(skip_all, fields(blobs = batch.len(), bytes = batch.total_bytes()))]
    async fn upload_batch(
        &self,
        batch: Batch<(Digest, Content<'_>)>,
        deadline: Instant,
    ) -> Result<(), CacheError> {
        let timeout = self.remaining(deadline)?;
        let blobs: Vec<(Digest, Payload)> = batch
            .into_items()
            .into_iter()
            .map(|(digest, content)| (digest, content.into()))
            .collect();
        let (tx, rx) = mpsc::channel(CHUNKS_IN_FLIGHT);
        let producer = tokio::spawn(send_chunks(blobs, self.options.max_chunk_size_bytes, tx));

        let mut request = Request::new(ReceiverStream::new(rx));
        request.set_timeout(timeout);
        let reply = self.cas.clone().upload_blob(request).await;

        // Only a successful reply means the whole stream was consumed.
        let accepted = matches!(
            &reply,
            Ok(reply) if reply.get_ref().status.as_ref().map_or(false, |s| s.succeeded)
        );
        if !accepted {
            producer.abort();
        }
        match producer.await {
            Ok(sent) => sent?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
        check_status(reply?.into_inner().status, "upload")?;
        Ok(())
    }

    async fn download_all(
        &self,
        digests: Vec<Digest>,
        deadline: Instant,
    ) -> Result<HashMap<Digest, Vec<u8>>, CacheError> {
        let batches = plan_batches(
            digests,
            Digest::size_bytes,
            self.options.max_batch_inputs,
            self.options.max_batch_size_bytes,
        );
        let downloaded = self
            .run_batches(batches.into_iter().map(|batch| self.download_batch(batch, deadline)))
            .await?;
        Ok(downloaded.into_iter().flatten().collect())
    }

    /// Download one batch. Blobs may arrive in any order.
    #[instrument(skip_all, fields(blobs = batch.len(), bytes = batch.total_bytes()))]
    async fn download_batch(
        &self,
        batch: Batch<Digest>,
        deadline: Instant,
    ) -> Result<HashMap<Digest, Vec<u8>>, CacheError> {
        let mut expected: HashSet<Digest> = batch.items().iter().cloned().collect();
        let mut request = Request::new(protos::remote::CasDownloadBlobRequest {
            digest: batch.into_items().into_iter().map(Into::into).collect(),
        });
        request.set_timeout(self.remaining(deadline)?);
        let mut replies = self.cas.clone().download_blob(request).await?.into_inner();

        let mut assembler = ChunkAssembler::new();
        let mut blobs = HashMap::new();
        while let Some(reply) = replies.message().await? {
            check_status(reply.status, "download")?;
            let chunk = reply
                .data
                .ok_or_else(|| CacheError::Protocol("download reply carries no data".to_string()))?;
            if let Some((digest, blob)) = assembler.ingest(Chunk::try_from(chunk)?)? {
                if !expected.remove(&digest) {
                    return Err(CacheError::Protocol(format!(
                        "received unrequested blob {digest}"
                    )));
                }
                blobs.insert(digest, blob);
            }
        }
        assembler.finish()?;

        if !expected.is_empty() {
            let mut outstanding: Vec<String> = expected.iter().map(ToString::to_string).collect();
            outstanding.sort();
            return Err(CacheError::Protocol(format!(
                "download stream ended without {}",
                outstanding.join(", ")
            )));
        }
        Ok(blobs)
    }

    /// Run the batches of one call, a bounded number at a time. The first
    /// failure drops every batch still pending.
    async fn run_batches<T, Fut>(
        &self,
        calls: impl IntoIterator<Item = Fut>,
    ) -> Result<Vec<T>, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut in_flight =
            stream::iter(calls).buffer_unordered(self.options.max_concurrent_batches);
        let mut results = vec![];
        while let Some(result) = in_flight.next().await {
            results.push(result?);
        }
        Ok(results)
    }

    /// Run one logical call under the configured timeout. Every RPC of the
    /// call gets the time left until the shared deadline.
    async fn with_deadline<T, F, Fut>(&self, call: F) -> Result<T, CacheError>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let timeout = self.options.timeout();
        let deadline = Instant::now() + timeout;
        tokio::time::timeout_at(deadline, call(deadline))
            .await
            .map_err(|_| CacheError::Timeout(timeout))?
    }

    fn remaining(&self, deadline: Instant) -> Result<Duration, CacheError> {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(CacheError::Timeout(self.options.timeout()))
    }
}

/// Where the bytes of a blob to upload come from.
#[derive(Debug)]
enum Content<'a> {
    Bytes(&'a [u8]),
    File(PathBuf),
}

/// [`Content`] detached from the caller, so it can move into the task that
/// feeds an upload stream.
#[derive(Debug)]
enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl From<Content<'_>> for Payload {
    fn from(content: Content<'_>) -> Self {
        match content {
            Content::Bytes(data) => Payload::Bytes(data.to_vec()),
            Content::File(path) => Payload::File(path),
        }
    }
}

/// Feed the chunks of `blobs` into an upload stream. Stops quietly once the
/// stream is gone.
async fn send_chunks(
    blobs: Vec<(Digest, Payload)>,
    max_chunk_size: usize,
    tx: mpsc::Sender<protos::remote::CasUploadBlobRequest>,
) -> Result<(), CacheError> {
    let request = |chunk: Chunk| protos::remote::CasUploadBlobRequest {
        data: Some(chunk.into()),
    };
    for (digest, payload) in blobs {
        match payload {
            Payload::Bytes(blob) => {
                for chunk in Chunker::with_digest(digest, blob, max_chunk_size) {
                    if tx.send(request(chunk)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Payload::File(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(CacheError::filesystem(&path))?;
                let size = digest.size_bytes();
                let mut first = Some(digest);
                let mut offset = 0;
                while offset < size {
                    let len = (size - offset).min(max_chunk_size as u64) as usize;
                    let mut data = vec![0; len];
                    file.read_exact(&mut data)
                        .await
                        .map_err(CacheError::filesystem(&path))?;
                    let chunk = Chunk {
                        digest: first.take(),
                        offset,
                        data,
                    };
                    offset += chunk.data.len() as u64;
                    if tx.send(request(chunk)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Unpack a reply status, turning a failure into the matching error.
fn check_status(
    status: Option<protos::remote::CasStatus>,
    rpc: &str,
) -> Result<protos::remote::CasStatus, CacheError> {
    let status =
        status.ok_or_else(|| CacheError::Protocol(format!("{rpc} reply carries no status")))?;
    if status.succeeded {
        return Ok(status);
    }
    Err(match status.error() {
        ErrorCode::MissingDigest => {
            match status
                .missing_digest
                .into_iter()
                .map(Digest::try_from)
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(missing) => CacheError::MissingDigests(missing),
                Err(e) => e.into(),
            }
        }
        ErrorCode::DigestMismatch => match (status.declared_digest, status.computed_digest) {
            (Some(declared), Some(computed)) => {
                match (Digest::try_from(declared), Digest::try_from(computed)) {
                    (Ok(declared), Ok(computed)) => CacheError::DigestMismatch { declared, computed },
                    _ => CacheError::Protocol(status.error_detail),
                }
            }
            _ => CacheError::Protocol(status.error_detail),
        },
        ErrorCode::InvalidArgument => CacheError::Protocol(status.error_detail),
        ErrorCode::Unknown => CacheError::Remote(format!("{rpc} failed: {}", status.error_detail)),
    })
}
