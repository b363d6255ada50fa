//! Job queue shared between an engine handle and its worker
//!
//! The pending jobs and the shutdown flag live under one mutex. The worker
//! parks on a `Notify` while the queue is empty.

use crate::engine::TransferJob;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<TransferJob>,
    shutdown: bool,
}

/// Pending jobs plus the wake signal
#[derive(Default)]
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert behind every job of equal or higher rank; hands the job back
    /// once shutdown has begun
    pub(crate) fn push(&self, job: TransferJob) -> Result<(), TransferJob> {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(job);
            }

            let rank = job.queue_rank();
            let position = state
                .jobs
                .iter()
                .position(|queued| queued.queue_rank() < rank)
                .unwrap_or(state.jobs.len());
            state.jobs.insert(position, job);
        }

        self.wake.notify_one();
        Ok(())
    }

    /// Wait for the next job; `None` once shutdown has begun
    pub(crate) async fn pop(&self) -> Option<TransferJob> {
        loop {
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
            }

            // A permit stored by notify_one covers a push that raced us.
            self.wake.notified().await;
        }
    }

    /// Set the shutdown flag and drop everything still queued
    pub(crate) fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let discarded = state.jobs.len();
            state.jobs.clear();
            discarded
        };
        self.wake.notify_one();
        discarded
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }
}
