//! Error types for bundlekit core

use thiserror::Error;

/// Errors that can occur in bundlekit core
#[derive(Debug, Error)]
pub enum BundleKitError {
    #[error("network exception: {0}")]
    Network(#[from] reqwest::Error),

    #[error("file exception: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("server error: {status}")]
    ServerError { status: u16 },

    #[error("filesize exception: {actual} != {expected}")]
    SizeMismatch { actual: u64, expected: u64 },

    #[error("corrupted file: {actual} != {expected}")]
    Corrupted { actual: String, expected: String },

    #[error("engine is shutting down")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bundle {0} is already disposed")]
    Disposed(String),

    #[error("failed to decode bundle {name}: {message}")]
    Decode { name: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BundleKitError {
    /// Check if this error is worth another transfer attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            BundleKitError::Network(_)
            | BundleKitError::Io(_)
            | BundleKitError::SizeMismatch { .. }
            | BundleKitError::Corrupted { .. }
            | BundleKitError::ServerError { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_errors_are_retryable() {
        assert!(BundleKitError::SizeMismatch { actual: 1, expected: 2 }.is_retryable());
        assert!(BundleKitError::ServerError { status: 404 }.is_retryable());
        assert!(!BundleKitError::InvalidUrl("no base url".into()).is_retryable());
        assert!(!BundleKitError::Cancelled.is_retryable());
        assert!(!BundleKitError::Disposed("ui".into()).is_retryable());
    }

    #[test]
    fn test_corrupted_message() {
        let err = BundleKitError::Corrupted {
            actual: "beef".into(),
            expected: "cafe".into(),
        };
        assert_eq!(err.to_string(), "corrupted file: beef != cafe");
    }
}
