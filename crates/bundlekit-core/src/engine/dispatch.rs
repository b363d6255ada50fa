//! Hand-off of completed jobs to the owning context
//!
//! The worker never runs a completion callback itself. It wraps the call in a
//! task and passes it to a [`Dispatcher`], which decides where it runs. The
//! provided [`MainQueue`] collects tasks until the owner drains them on its
//! own thread or turn.

use crate::engine::TransferJob;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// A deferred unit of work for the owning context
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// "Run this on the owning context"
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Receives per-attempt failures and worker faults
pub trait ErrorSink: Send + Sync {
    /// A transfer attempt failed and will be retried
    fn on_task_error(&self, job: &TransferJob, error: &str);

    /// A fault escaped a job and was isolated by the worker
    fn on_worker_error(&self, worker: &str, error: &str);
}

/// Default sink: logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn on_task_error(&self, job: &TransferJob, error: &str) {
        warn!(
            "Download of {} failed (attempt {}): {}",
            job.name(),
            job.tried(),
            error
        );
    }

    fn on_worker_error(&self, worker: &str, error: &str) {
        error!("Worker {} fault: {}", worker, error);
    }
}

/// Sending half of a [`MainQueue`]; cheap to clone and share with engines
#[derive(Clone)]
pub struct MainQueueHandle {
    tx: mpsc::UnboundedSender<Task>,
}

impl Dispatcher for MainQueueHandle {
    fn dispatch(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("Main queue is closed, dropping completion");
        }
    }
}

/// Queue of completions drained by the owning context
pub struct MainQueue {
    rx: mpsc::UnboundedReceiver<Task>,
    handle: MainQueueHandle,
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            handle: MainQueueHandle { tx },
        }
    }

    /// Handle to give to engines
    pub fn handle(&self) -> MainQueueHandle {
        self.handle.clone()
    }

    /// Run every task already queued without waiting; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}
