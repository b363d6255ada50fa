//! Download engine
//!
//! This module implements the bundle download pipeline:
//! - One background worker per engine, serial job execution
//! - Resume from `.part` files with range requests
//! - Per-job bandwidth throttling
//! - Size and checksum verification, atomic publish with sidecar metadata
//! - Retry with fixed back-off, completion hand-off to the owning context

mod dispatch;
mod job;
mod manager;
mod queue;
mod rate_limiter;
mod registry;
mod worker;


pub use dispatch::*;
pub use job::*;
pub use manager::*;
pub use rate_limiter::*;
pub use registry::WorkerRegistry;
pub use worker::{CompletionCallback, BUNDLE_CONTENT_TYPE};
