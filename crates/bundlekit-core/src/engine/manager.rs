//! Download engine - the owner-facing handle of one worker
//!
//! An engine owns exactly one background worker and a job queue. Jobs run
//! strictly one after another, so throttling applies per engine. Run several
//! engines side by side for separate lanes.

use crate::engine::dispatch::{Dispatcher, ErrorSink, TracingSink};
use crate::engine::queue::JobQueue;
use crate::engine::registry::{Abortable, WorkerRegistry};
use crate::engine::worker::Worker;
use crate::engine::TransferJob;
use crate::error::BundleKitError;
use bundlekit_types::{EngineEvent, Settings, WorkerPriority};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Construction parameters of a [`DownloadEngine`]
#[derive(Clone)]
pub struct EngineOptions {
    /// Worker name used in logs
    pub name: String,
    /// Candidate base URLs, rotated by attempt number
    pub base_urls: Vec<String>,
    /// Write buffer size for the temp file
    pub buffer_size: usize,
    /// Shutdown order only: `WorkerRegistry::shutdown_all` aborts lower
    /// priorities first. The worker is a plain tokio task and is not
    /// scheduled any differently.
    pub priority: WorkerPriority,
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
    pub error_sink: Arc<dyn ErrorSink>,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            name: "DownloadWorker".to_string(),
            base_urls: settings.base_urls.clone(),
            buffer_size: settings.buffer_size,
            priority: settings.worker_priority,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            read_timeout: Duration::from_secs(settings.read_timeout_secs),
            user_agent: settings.user_agent.clone(),
            error_sink: Arc::new(TracingSink),
        }
    }

    pub fn with_base_urls(mut self, base_urls: Vec<String>) -> Self {
        self.base_urls = base_urls;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// State shared between the handle and the registry
struct EngineInner {
    id: Uuid,
    name: String,
    priority: WorkerPriority,
    queue: Arc<JobQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    registry: WorkerRegistry,
}

impl Abortable for EngineInner {
    fn abort(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        self.registry.remove(self.id);
        let discarded = self.queue.shutdown();
        // Dropping the worker future closes any open temp file.
        handle.abort();

        info!(
            "Download engine {} aborted ({} queued job(s) discarded)",
            self.name, discarded
        );
    }

    fn priority(&self) -> WorkerPriority {
        self.priority
    }
}

/// Handle to a running download engine
///
/// Dropping the handle aborts the engine.
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
    events: broadcast::Sender<EngineEvent>,
}

impl DownloadEngine {
    /// Start an engine and its worker on the current tokio runtime
    ///
    /// `on_complete` is never called on the worker. Each finished job is
    /// wrapped in a task and passed to `dispatcher`.
    pub fn new<F>(
        options: EngineOptions,
        registry: &WorkerRegistry,
        dispatcher: Arc<dyn Dispatcher>,
        on_complete: F,
    ) -> Result<Self, BundleKitError>
    where
        F: Fn(TransferJob) + Send + Sync + 'static,
    {
        let client = Client::builder()
            .user_agent(options.user_agent.as_str())
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .build()?;

        let id = Uuid::new_v4();
        let queue = Arc::new(JobQueue::new());
        let (events, _) = broadcast::channel(1024);

        let worker = Worker {
            name: options.name.clone(),
            client,
            queue: queue.clone(),
            base_urls: options.base_urls.clone(),
            buffer_size: options.buffer_size,
            retry_backoff: options.retry_backoff,
            sink: options.error_sink.clone(),
            dispatcher,
            on_complete: Arc::new(on_complete),
            events: events.clone(),
        };
        let handle = tokio::spawn(worker.run());

        let inner = Arc::new(EngineInner {
            id,
            name: options.name,
            priority: options.priority,
            queue,
            worker: Mutex::new(Some(handle)),
            registry: registry.clone(),
        });
        let abortable: Arc<dyn Abortable> = inner.clone();
        registry.add(id, Arc::downgrade(&abortable));

        info!(
            "Download engine {} started ({} base URL(s), priority {:?})",
            inner.name,
            options.base_urls.len(),
            inner.priority
        );

        Ok(Self { inner, events })
    }

    /// Queue a job
    ///
    /// Hands the job back if the engine is shutting down or the job is
    /// already done.
    pub fn enqueue(&self, mut job: TransferJob) -> Result<(), TransferJob> {
        if job.is_done() {
            warn!("Refusing to re-queue finished job {}", job.name());
            return Err(job);
        }

        job.running = true;
        self.inner.queue.push(job).map_err(|mut job| {
            job.running = false;
            job
        })
    }

    /// Tear the engine down; queued jobs are dropped without completion
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Receive progress and lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn priority(&self) -> WorkerPriority {
        self.inner.priority
    }

    /// Jobs waiting behind the one in flight
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.is_shutdown()
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        self.inner.abort();
    }
}
