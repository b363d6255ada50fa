//! Download worker - runs queued jobs one at a time
//!
//! For each job the worker resolves a URL, resumes from the `.part` file,
//! streams the body through the rate limiter, verifies size and checksum,
//! and renames the temp file into place. Failed attempts delete the temp file
//! and retry after a fixed back-off until the job's budget is spent.

use crate::checksum::{self, ChecksumAlgorithm};
use crate::engine::dispatch::{Dispatcher, ErrorSink};
use crate::engine::queue::JobQueue;
use crate::engine::{RateLimiter, TransferJob};
use crate::error::BundleKitError;
use bundlekit_types::{EngineEvent, Metadata};
use futures::{FutureExt, StreamExt};
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use std::any::Any;
use std::io::SeekFrom;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

/// Content type sent with every bundle request
pub const BUNDLE_CONTENT_TYPE: &str = "application/octet-stream";

/// Completion callback invoked on the owning context
pub type CompletionCallback = Arc<dyn Fn(TransferJob) + Send + Sync>;

/// The background half of a download engine
pub(crate) struct Worker {
    pub(crate) name: String,
    pub(crate) client: Client,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) base_urls: Vec<String>,
    pub(crate) buffer_size: usize,
    pub(crate) retry_backoff: Duration,
    pub(crate) sink: Arc<dyn ErrorSink>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) on_complete: CompletionCallback,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

impl Worker {
    /// Worker loop; returns once the engine shuts down
    pub(crate) async fn run(self) {
        info!("Download worker {} started", self.name);

        while let Some(job) = self.queue.pop().await {
            let name = job.name().to_string();
            if let Err(panic) = AssertUnwindSafe(self.process(job)).catch_unwind().await {
                let message = format!("job {}: {}", name, panic_message(panic.as_ref()));
                self.sink.on_worker_error(&self.name, &message);
            }
        }

        info!("Download worker {} stopped", self.name);
    }

    async fn process(&self, mut job: TransferJob) {
        let temp_path = job.temp_path();
        let mut checksum = checksum::for_kind(job.checksum_kind);

        debug!(
            "Processing job {} with {} ({})",
            job.name(),
            checksum.kind(),
            job.comment()
        );

        loop {
            let ticks = chrono::Utc::now().timestamp_millis().to_string();
            let result = match resolve_url(&self.base_urls, &job, &ticks) {
                Ok(url) => self.attempt(&mut job, checksum.as_mut(), &url, &temp_path).await,
                Err(e) => Err(e),
            };
            let result = match result {
                Ok(meta) => self.publish(&job, &temp_path, &meta).await.map(|_| meta),
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(meta) => {
                    info!(
                        "Published {} ({} bytes, checksum {})",
                        job.name(),
                        meta.size,
                        meta.checksum
                    );
                    job.verified = Some(meta);
                    self.complete(job);
                    return;
                }
                Err(e) => e,
            };

            // Shutdown raced the transfer: keep the partial file for next time.
            if self.queue.is_shutdown() {
                info!("Abandoning {} on shutdown", job.name());
                return;
            }

            if let Err(e) = fs::remove_file(&temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", temp_path.display(), e);
                }
            }

            job.tried += 1;
            let message = error.to_string();
            let _ = self.events.send(EngineEvent::AttemptFailed {
                id: job.id(),
                attempt: job.tried,
                error: message.clone(),
            });

            if job.budget_exhausted() || !error.is_retryable() {
                warn!(
                    "Giving up on {} after {} attempt(s): {}",
                    job.name(),
                    job.tried,
                    message
                );
                job.error = Some(message);
                self.complete(job);
                return;
            }

            self.sink.on_task_error(&job, &message);
            tokio::time::sleep(self.retry_backoff).await;
        }
    }

    /// One attempt: resume, stream, verify. Returns the record to persist.
    async fn attempt(
        &self,
        job: &mut TransferJob,
        checksum: &mut dyn ChecksumAlgorithm,
        url: &str,
        temp_path: &Path,
    ) -> Result<Metadata, BundleKitError> {
        checksum.reset();

        if let Some(parent) = temp_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(temp_path)
            .await?;

        // Resume from whatever a previous attempt or session left behind
        let mut partial = file.metadata().await?.len();
        if partial > job.size() {
            debug!(
                "Discarding oversized partial file for {} ({} > {})",
                job.name(),
                partial,
                job.size()
            );
            file.set_len(0).await?;
            partial = 0;
        } else if partial > 0 && !checksum.requires_full_pass() {
            checksum::feed_file(checksum, &mut file, Some(partial)).await?;
        }
        file.seek(SeekFrom::Start(partial)).await?;
        job.bytes = partial;

        let _ = self.events.send(EngineEvent::JobStarted {
            id: job.id(),
            name: job.name().to_string(),
            attempt: job.tried,
            url: url.to_string(),
            resumed_from: partial,
        });

        if job.size() == 0 || partial < job.size() {
            file = self.stream_body(job, checksum, url, file, partial).await?;
        } else {
            debug!("{} already fully present, skipping transfer", job.name());
        }

        let actual = file.metadata().await?.len();
        drop(file);

        let size = match job.size() {
            0 => actual,
            expected if expected != actual => {
                return Err(BundleKitError::SizeMismatch { actual, expected });
            }
            expected => expected,
        };

        if checksum.requires_full_pass() {
            checksum.reset();
            let mut reader = File::open(temp_path).await?;
            checksum::feed_file(checksum, &mut reader, None).await?;
        }

        let digest = checksum.hex();
        if let Some(expected) = job.checksum() {
            if !checksum::digests_match(&digest, expected) {
                return Err(BundleKitError::Corrupted {
                    actual: digest,
                    expected: expected.to_string(),
                });
            }
        }

        Ok(Metadata::new(digest, size))
    }

    /// Request the body from `partial` onwards and append it to `file`
    async fn stream_body(
        &self,
        job: &mut TransferJob,
        checksum: &mut dyn ChecksumAlgorithm,
        url: &str,
        mut file: File,
        partial: u64,
    ) -> Result<File, BundleKitError> {
        let mut request = self.client.get(url).header(CONTENT_TYPE, BUNDLE_CONTENT_TYPE);
        if partial > 0 {
            request = request.header(RANGE, format!("bytes={}-", partial));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BundleKitError::ServerError {
                status: status.as_u16(),
            });
        }

        if partial > 0 && status != StatusCode::PARTIAL_CONTENT {
            warn!(
                "Server ignored range request for {}, restarting from zero",
                job.name()
            );
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            checksum.reset();
            job.bytes = 0;
        }

        let streaming_digest = !checksum.requires_full_pass();
        let total = (job.size() > 0).then_some(job.size());
        let mut limiter = RateLimiter::new(job.bytes_per_second);
        let mut writer = BufWriter::with_capacity(self.buffer_size.max(1), file);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for piece in chunk.chunks(limiter.chunk_size()) {
                if self.queue.is_shutdown() {
                    return Err(BundleKitError::Cancelled);
                }

                writer.write_all(piece).await?;
                if streaming_digest {
                    checksum.update(piece);
                }
                job.bytes += piece.len() as u64;
                limiter.consume(piece.len() as u64).await;
            }

            let _ = self.events.send(EngineEvent::Progress {
                id: job.id(),
                bytes: job.bytes,
                total,
            });
        }
        limiter.finish().await;

        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        Ok(file)
    }

    /// Move the verified temp file into place and write its sidecar
    async fn publish(
        &self,
        job: &TransferJob,
        temp_path: &Path,
        meta: &Metadata,
    ) -> Result<(), BundleKitError> {
        fs::rename(temp_path, job.path()).await?;
        let json = serde_json::to_string(meta)?;
        fs::write(Metadata::sidecar_path(job.path()), json).await?;
        Ok(())
    }

    /// Mark the job done and hand it to the owning context
    fn complete(&self, mut job: TransferJob) {
        job.running = false;
        job.done = true;

        let _ = self.events.send(EngineEvent::JobCompleted {
            id: job.id(),
            name: job.name().to_string(),
            error: job.error.clone(),
        });

        let callback = self.on_complete.clone();
        self.dispatcher.dispatch(Box::new(move || callback(job)));
    }
}

/// Pick the URL for the job's next attempt
///
/// Explicit URLs are used as given. Otherwise the base URL rotates with the
/// attempt number and the resource name is appended. `ticks` busts caches.
pub(crate) fn resolve_url(
    base_urls: &[String],
    job: &TransferJob,
    ticks: &str,
) -> Result<String, BundleKitError> {
    let mut url = match &job.url {
        Some(explicit) => Url::parse(explicit)
            .map_err(|e| BundleKitError::InvalidUrl(format!("{}: {}", explicit, e)))?,
        None => {
            if base_urls.is_empty() {
                return Err(BundleKitError::InvalidUrl(format!(
                    "no base URL for {}",
                    job.name()
                )));
            }

            let base = &base_urls[job.tried() as usize % base_urls.len()];
            let joined = if base.ends_with('/') {
                format!("{}{}", base, job.name())
            } else {
                format!("{}/{}", base, job.name())
            };
            let mut url = Url::parse(&joined)
                .map_err(|e| BundleKitError::InvalidUrl(format!("{}: {}", joined, e)))?;
            url.query_pairs_mut()
                .append_pair("checksum", job.checksum().unwrap_or(ticks));
            url
        }
    };

    if job.tried() > 0 {
        url.query_pairs_mut().append_pair("retry", ticks);
    }

    Ok(url.into())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
