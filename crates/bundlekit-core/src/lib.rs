//! Bundlekit Core - bundle download engine and lifecycle graph
//!
//! The download engine pulls queued transfer jobs on a background task,
//! resumes partial files, throttles, verifies and publishes them. The bundle
//! graph tracks loaded bundles, their dependencies and readiness.

pub mod bundle;
pub mod cache;
pub mod checksum;
pub mod engine;
mod error;
mod storage;

pub use bundle::{Bundle, BundlePayload, BundleState, BytesPayload, SubscriptionId};
pub use cache::{read_metadata, validate_cached, verify_digest};
pub use engine::*;
pub use error::*;
pub use storage::*;

pub use bundlekit_types as types;
