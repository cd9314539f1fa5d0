//! Multipart transfer orchestration
//!
//! Large sources are cut into fixed-size chunks that upload as numbered
//! parts of one server-side session. Part numbers are assigned from chunk
//! order before scheduling, so completion order does not matter.
//!
//! Sources:
//! - local files: part `i` is the byte range `[(i-1)*C, min(S, i*C))`,
//!   re-read from disk on every attempt
//! - streams: chunks are spooled into temp files owned by their upload task
//! - objects: parts are server-side range copies
//!
//! A source of at most one chunk skips the session and goes out as a
//! single request.

use crate::s3::client::StorageClient;
use crate::s3::error::{Result, StorageError};
use crate::s3::listing::ListPartsRequest;
use crate::s3::metadata::ObjectMetadata;
use crate::s3::types::{MultipartUpload, Part, PartSummary};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default chunk size: 1 GiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 30;

/// Prefix of spooled chunk files
pub const TEMP_FILE_PREFIX: &str = "stowage-";

/// Chunking and concurrency settings of multipart transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    pub chunk_size: u64,
    /// Part uploads in flight per transfer
    pub concurrency: usize,
    /// Directory for spooled stream chunks
    pub temp_dir: PathBuf,
    /// Abort the session when a part or the completion fails
    pub abort_on_failure: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 1,
            temp_dir: std::env::temp_dir(),
            abort_on_failure: true,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StorageError::InvalidArgument("chunk size must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(StorageError::InvalidArgument("concurrency must be positive".to_string()));
        }
        Ok(())
    }
}

/// Number of parts of a source: `ceil(size / chunk_size)`, at least one.
pub fn part_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size).max(1) as u32
}

/// Offset and length of a part
pub fn part_range(part_number: u32, size: u64, chunk_size: u64) -> (u64, u64) {
    let offset = u64::from(part_number - 1) * chunk_size;
    let end = size.min(offset + chunk_size);
    (offset, end.saturating_sub(offset))
}

/// Lifecycle of one multipart session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Initiated,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Idle => "idle",
            TransferState::Initiated => "initiated",
            TransferState::Completing => "completing",
            TransferState::Completed => "completed",
            TransferState::Aborting => "aborting",
            TransferState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of a high-level upload or copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Session id; `None` when the source went out as a single request
    pub upload_id: Option<String>,
    pub parts: usize,
    pub etag: Option<String>,
    pub location: Option<String>,
}

impl UploadOutcome {
    fn single(etag: Option<String>) -> Self {
        Self {
            upload_id: None,
            parts: 1,
            etag,
            location: None,
        }
    }
}

struct Transfer {
    upload: MultipartUpload,
    state: TransferState,
}

impl Transfer {
    fn new(upload: MultipartUpload) -> Self {
        let mut transfer = Self {
            upload,
            state: TransferState::Idle,
        };
        transfer.advance(TransferState::Initiated);
        transfer
    }

    fn advance(&mut self, next: TransferState) {
        debug!(
            bucket = %self.upload.bucket,
            key = %self.upload.key,
            upload_id = %self.upload.upload_id,
            from = %self.state,
            to = %next,
            "Transfer state changed"
        );
        self.state = next;
    }
}

type PartResult = (u32, Result<Part>);

/// Bounded pool of part tasks
struct PartScheduler {
    permits: Arc<Semaphore>,
    tasks: JoinSet<PartResult>,
    parts: BTreeMap<u32, Part>,
    failures: Vec<(u32, StorageError)>,
}

impl PartScheduler {
    fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            parts: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    fn with_parts(mut self, parts: impl IntoIterator<Item = Part>) -> Self {
        self.parts.extend(parts.into_iter().map(|p| (p.part_number, p)));
        self
    }

    /// Wait for a free upload slot.
    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Transport("part scheduler closed".to_string()))
    }

    /// Start a part in a slot taken with [`acquire`](Self::acquire).
    fn start<Fut>(&mut self, part_number: u32, permit: OwnedSemaphorePermit, upload: Fut)
    where
        Fut: Future<Output = Result<Part>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let result = upload.await;
            drop(permit);
            (part_number, result)
        });
    }

    /// Wait for a free slot, then start the part.
    async fn spawn<Fut>(&mut self, part_number: u32, upload: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<Part>> + Send + 'static,
    {
        let permit = self.acquire().await?;
        self.start(part_number, permit, upload);
        Ok(())
    }

    fn record(&mut self, joined: std::result::Result<PartResult, tokio::task::JoinError>) {
        match joined {
            Ok((part_number, Ok(part))) => {
                debug!(part_number, etag = %part.etag, "Part uploaded");
                self.parts.insert(part_number, part);
            }
            Ok((part_number, Err(e))) => {
                warn!(part_number, error = %e, "Part upload failed");
                self.failures.push((part_number, e));
            }
            Err(e) => {
                error!(error = %e, "Part task did not finish");
                self.failures
                    .push((0, StorageError::Transport(format!("part task failed: {}", e))));
            }
        }
    }

    fn record_failure(&mut self, part_number: u32, error: StorageError) {
        warn!(part_number, error = %error, "Part could not be scheduled");
        self.failures.push((part_number, error));
    }

    /// Collect tasks that already finished, without waiting.
    fn collect_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
    }

    fn has_failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Stream chunk spooled to disk. The file is removed when dropped.
struct SpooledChunk {
    path: TempPath,
    length: u64,
}

/// Spool up to `limit` bytes of `reader` into a fresh temp file. `None`
/// once the reader is exhausted.
async fn spool_chunk<R>(reader: &mut R, limit: u64, dir: &Path) -> Result<Option<SpooledChunk>>
where
    R: AsyncRead + Unpin,
{
    let file = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(dir)?;
    let (file, path) = file.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let length = tokio::io::copy(&mut reader.take(limit), &mut file).await?;
    file.flush().await?;

    if length == 0 {
        return Ok(None);
    }
    Ok(Some(SpooledChunk { path, length }))
}

impl StorageClient {
    /// Upload a local file, as one request or as a multipart session.
    pub async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<UploadOutcome> {
        let settings = self.transfer_settings().clone();
        settings.validate()?;
        let size = tokio::fs::metadata(path).await?.len();

        if size <= settings.chunk_size {
            info!(bucket, key, size, "Uploading file as a single object");
            self.put_object_range(bucket, key, path, 0, size, metadata).await?;
            return Ok(UploadOutcome::single(None));
        }

        let upload = self.initiate_multipart_upload(bucket, key, metadata).await?;
        info!(
            bucket,
            key,
            size,
            upload_id = %upload.upload_id,
            parts = part_count(size, settings.chunk_size),
            "Uploading file in parts"
        );
        self.upload_file_parts(upload, path, size, Vec::new(), &settings).await
    }

    /// Continue an interrupted file upload. Parts already stored in the
    /// session are kept with their recorded ETags.
    pub async fn resume_upload_file(&self, upload: &MultipartUpload, path: &Path) -> Result<UploadOutcome> {
        let settings = self.transfer_settings().clone();
        settings.validate()?;
        let size = tokio::fs::metadata(path).await?.len();
        let total = part_count(size, settings.chunk_size);

        let existing: Vec<Part> = self
            .list_all_parts(upload)
            .await?
            .into_iter()
            .filter(|p| p.part_number >= 1 && p.part_number <= total)
            .map(|p| Part::new(p.part_number, p.etag))
            .collect();

        info!(
            bucket = %upload.bucket,
            key = %upload.key,
            upload_id = %upload.upload_id,
            parts = total,
            uploaded = existing.len(),
            "Resuming upload"
        );
        self.upload_file_parts(upload.clone(), path, size, existing, &settings).await
    }

    /// Every part of a session, across all listing pages.
    pub async fn list_all_parts(&self, upload: &MultipartUpload) -> Result<Vec<PartSummary>> {
        let request = ListPartsRequest::new(&upload.bucket, &upload.key, &upload.upload_id);
        let mut listing = self.list_parts(&request).await?;
        let mut parts = std::mem::take(&mut listing.parts);
        while listing.is_truncated {
            listing = self.next_list_parts(&listing).await?;
            parts.append(&mut listing.parts);
        }
        Ok(parts)
    }

    async fn upload_file_parts(
        &self,
        upload: MultipartUpload,
        path: &Path,
        size: u64,
        existing: Vec<Part>,
        settings: &TransferSettings,
    ) -> Result<UploadOutcome> {
        let chunk_size = settings.chunk_size;
        let total = part_count(size, chunk_size);
        let mut transfer = Transfer::new(upload);
        let mut scheduler = PartScheduler::new(settings.concurrency).with_parts(existing);

        let pending: Vec<u32> = (1..=total)
            .filter(|n| !scheduler.parts.contains_key(n))
            .collect();
        for part_number in pending {
            let (offset, length) = part_range(part_number, size, chunk_size);
            let client = self.clone();
            let upload = transfer.upload.clone();
            let path = path.to_path_buf();
            let task = async move {
                client
                    .upload_part_range(&upload, part_number, &path, offset, length)
                    .await
            };
            if let Err(e) = scheduler.spawn(part_number, task).await {
                scheduler.record_failure(part_number, e);
                break;
            }
        }

        scheduler.drain().await;
        self.finish(&mut transfer, scheduler, settings).await
    }

    /// Upload everything `reader` yields.
    ///
    /// Chunks are spooled to temp files while earlier ones upload. A full
    /// first chunk only starts a session once more data is known to follow.
    pub async fn upload<R>(
        &self,
        bucket: &str,
        key: &str,
        mut reader: R,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let settings = self.transfer_settings().clone();
        settings.validate()?;
        let chunk_size = settings.chunk_size;

        let Some(first) = spool_chunk(&mut reader, chunk_size, &settings.temp_dir).await? else {
            info!(bucket, key, "Uploading empty stream as a single object");
            self.put_object_bytes(bucket, key, Bytes::new(), metadata).await?;
            return Ok(UploadOutcome::single(None));
        };

        let second = if first.length == chunk_size {
            spool_chunk(&mut reader, chunk_size, &settings.temp_dir).await?
        } else {
            None
        };
        let Some(second) = second else {
            info!(bucket, key, size = first.length, "Uploading stream as a single object");
            self.put_object_range(bucket, key, &first.path, 0, first.length, metadata)
                .await?;
            return Ok(UploadOutcome::single(None));
        };

        let upload = self.initiate_multipart_upload(bucket, key, metadata).await?;
        info!(bucket, key, upload_id = %upload.upload_id, "Uploading stream in parts");
        let mut transfer = Transfer::new(upload);
        let mut scheduler = PartScheduler::new(settings.concurrency);

        // At most `concurrency` chunks are on disk uploading plus one more
        // spooled or spooling. A chunk is only read once it can get a slot
        // right after the one ahead of it.
        let mut part_number = 0u32;
        let mut pending = Some(first);
        let mut queued = Some(second);
        while let Some(chunk) = pending.take() {
            let permit = match scheduler.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    scheduler.record_failure(part_number + 1, e);
                    break;
                }
            };
            scheduler.collect_finished();
            if scheduler.has_failed() {
                debug!("Stopping chunk scheduling after a failed part");
                break;
            }

            part_number += 1;
            let reached_end = chunk.length < chunk_size;
            let client = self.clone();
            let upload = transfer.upload.clone();
            scheduler.start(part_number, permit, async move {
                // The temp file lives until the part is done.
                client
                    .upload_part_range(&upload, part_number, &chunk.path, 0, chunk.length)
                    .await
            });

            pending = match queued.take() {
                Some(chunk) => Some(chunk),
                None if reached_end => None,
                None => {
                    let next_part = part_number + 1;
                    match spool_chunk(&mut reader, chunk_size, &settings.temp_dir).await {
                        Ok(spooled) => spooled,
                        Err(e) => {
                            scheduler.record_failure(next_part, e);
                            break;
                        }
                    }
                }
            };
        }

        scheduler.drain().await;
        self.finish(&mut transfer, scheduler, &settings).await
    }

    /// Server-side copy of an object of any size. Objects larger than one
    /// chunk are copied as ranged parts.
    pub async fn copy_large_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<UploadOutcome> {
        let settings = self.transfer_settings().clone();
        settings.validate()?;

        let source = self
            .get_object_metadata(src_bucket, src_key)
            .await?
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!("copy source {}/{} does not exist", src_bucket, src_key))
            })?;
        let size = source.size;
        let chunk_size = settings.chunk_size;

        if size <= chunk_size {
            info!(src_bucket, src_key, dst_bucket, dst_key, size, "Copying object");
            let etag = self.copy_object(src_bucket, src_key, dst_bucket, dst_key).await?;
            return Ok(UploadOutcome::single(Some(etag)));
        }

        let mut metadata = source.metadata.clone();
        metadata.content_md5 = None;
        let upload = self.initiate_multipart_upload(dst_bucket, dst_key, Some(&metadata)).await?;
        let total = part_count(size, chunk_size);
        info!(src_bucket, src_key, dst_bucket, dst_key, size, parts = total, "Copying object in parts");

        let mut transfer = Transfer::new(upload);
        let mut scheduler = PartScheduler::new(settings.concurrency);
        for part_number in 1..=total {
            let (offset, length) = part_range(part_number, size, chunk_size);
            let client = self.clone();
            let upload = transfer.upload.clone();
            let (src_bucket, src_key) = (src_bucket.to_string(), src_key.to_string());
            let task = async move {
                client
                    .upload_part_copy(&upload, part_number, &src_bucket, &src_key, Some((offset, offset + length - 1)))
                    .await
            };
            if let Err(e) = scheduler.spawn(part_number, task).await {
                scheduler.record_failure(part_number, e);
                break;
            }
        }

        scheduler.drain().await;
        self.finish(&mut transfer, scheduler, &settings).await
    }

    /// Complete the session when every part succeeded, abort it otherwise.
    async fn finish(
        &self,
        transfer: &mut Transfer,
        scheduler: PartScheduler,
        settings: &TransferSettings,
    ) -> Result<UploadOutcome> {
        let PartScheduler { parts, mut failures, .. } = scheduler;

        if !failures.is_empty() {
            failures.sort_by_key(|(n, _)| *n);
            let failed_parts = failures.len();
            let (part_number, source) = failures.swap_remove(0);
            error!(
                bucket = %transfer.upload.bucket,
                key = %transfer.upload.key,
                failed_parts,
                part_number,
                error = %source,
                "Multipart transfer failed"
            );
            self.abort_after_failure(transfer, settings).await;
            return Err(StorageError::TransferFailed {
                bucket: transfer.upload.bucket.clone(),
                key: transfer.upload.key.clone(),
                failed_parts,
                source: Box::new(source),
            });
        }

        transfer.advance(TransferState::Completing);
        let parts: Vec<Part> = parts.into_values().collect();
        match self.complete_multipart_upload(&transfer.upload, &parts).await {
            Ok(result) => {
                transfer.advance(TransferState::Completed);
                info!(
                    bucket = %transfer.upload.bucket,
                    key = %transfer.upload.key,
                    parts = parts.len(),
                    etag = %result.etag,
                    "Multipart transfer completed"
                );
                Ok(UploadOutcome {
                    upload_id: Some(transfer.upload.upload_id.clone()),
                    parts: parts.len(),
                    etag: Some(result.etag),
                    location: Some(result.location),
                })
            }
            Err(e) => {
                error!(upload_id = %transfer.upload.upload_id, error = %e, "Completing multipart upload failed");
                self.abort_after_failure(transfer, settings).await;
                Err(e)
            }
        }
    }

    /// Best-effort abort. Its own failure is logged, never returned.
    async fn abort_after_failure(&self, transfer: &mut Transfer, settings: &TransferSettings) {
        if !settings.abort_on_failure || transfer.state.is_terminal() {
            return;
        }
        transfer.advance(TransferState::Aborting);
        match self.abort_multipart_upload(&transfer.upload).await {
            Ok(()) => transfer.advance(TransferState::Aborted),
            Err(e) => error!(
                upload_id = %transfer.upload.upload_id,
                error = %e,
                "Aborting multipart upload failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(25, 10), 3);
        assert_eq!(part_count(20, 10), 2);
        assert_eq!(part_count(1, 10), 1);
        assert_eq!(part_count(0, 10), 1);
    }

    #[test]
    fn test_part_ranges_cover_source() {
        let ranges: Vec<_> = (1..=3).map(|n| part_range(n, 25, 10)).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 10), (20, 5)]);
    }

    #[test]
    fn test_settings_validation() {
        assert!(TransferSettings::default().validate().is_ok());

        let zero_chunk = TransferSettings { chunk_size: 0, ..Default::default() };
        assert!(zero_chunk.validate().is_err());

        let zero_workers = TransferSettings { concurrency: 0, ..Default::default() };
        assert!(zero_workers.validate().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Aborted.is_terminal());
        assert!(!TransferState::Aborting.is_terminal());
        assert_eq!(TransferState::Completing.to_string(), "completing");
    }

    #[tokio::test]
    async fn test_spool_chunks_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader: &[u8] = b"abcdefghij-klm";

        let first = spool_chunk(&mut reader, 10, dir.path()).await.unwrap().unwrap();
        let second = spool_chunk(&mut reader, 10, dir.path()).await.unwrap().unwrap();
        assert!(spool_chunk(&mut reader, 10, dir.path()).await.unwrap().is_none());

        assert_eq!(first.length, 10);
        assert_eq!(second.length, 4);
        assert_eq!(std::fs::read(&second.path).unwrap(), b"-klm");
        assert!(first
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMP_FILE_PREFIX));

        let path = first.path.to_path_buf();
        drop(first);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_scheduler_collects_results() {
        let mut scheduler = PartScheduler::new(2);
        for n in 1..=4u32 {
            scheduler
                .spawn(n, async move {
                    if n == 3 {
                        Err(StorageError::Transport("reset".to_string()))
                    } else {
                        Ok(Part::new(n, format!("etag-{}", n)))
                    }
                })
                .await
                .unwrap();
        }
        scheduler.drain().await;

        assert_eq!(scheduler.parts.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(scheduler.failures.len(), 1);
        assert_eq!(scheduler.failures[0].0, 3);
    }
}
