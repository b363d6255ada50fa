//! Shared types for bundlekit
//!
//! This crate contains the plain data structures shared between the core
//! engine and the CLI: bundle descriptors, the on-disk metadata record,
//! settings, and engine events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Bundle Types
// ============================================================================

/// Category of a bundle as declared by the manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    #[default]
    AssetBundle,
    ZipArchive,
    FileList,
}

/// Immutable descriptor of a bundle, produced by the manifest/catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: BundleType,
    /// Declared size in bytes (0 = unknown)
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl BundleInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BundleType::AssetBundle,
            size: 0,
            priority: 0,
            checksum: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_kind(mut self, kind: BundleType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ============================================================================
// Integrity Types
// ============================================================================

/// Which checksum algorithm verifies a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// CRC-16, computed incrementally while streaming
    #[default]
    Crc16,
    /// MD5, computed in one pass over the finished file
    Md5,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Crc16 => f.write_str("crc16"),
            ChecksumKind::Md5 => f.write_str("md5"),
        }
    }
}

impl FromStr for ChecksumKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc16" | "crc" => Ok(ChecksumKind::Crc16),
            "md5" => Ok(ChecksumKind::Md5),
            other => Err(format!("unknown checksum algorithm: {}", other)),
        }
    }
}

/// Sidecar record written next to every published bundle file
///
/// A loader reads it back to decide whether a cached file can be used
/// without downloading it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub checksum: String,
    pub size: u64,
}

impl Metadata {
    /// File extension appended to the final path
    pub const EXT: &'static str = ".meta";

    pub fn new(checksum: impl Into<String>, size: u64) -> Self {
        Self {
            checksum: checksum.into(),
            size,
        }
    }

    /// Path of the sidecar belonging to `final_path`
    pub fn sidecar_path(final_path: &Path) -> PathBuf {
        let mut os = final_path.as_os_str().to_owned();
        os.push(Self::EXT);
        PathBuf::from(os)
    }
}

// ============================================================================
// Engine Types
// ============================================================================

/// Scheduling hint for an engine's worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Events published by a download engine
///
/// These are telemetry only. The job result always comes back through the
/// completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    JobStarted {
        id: Uuid,
        name: String,
        attempt: u32,
        url: String,
        resumed_from: u64,
    },
    Progress {
        id: Uuid,
        bytes: u64,
        total: Option<u64>,
    },
    AttemptFailed {
        id: Uuid,
        attempt: u32,
        error: String,
    },
    JobCompleted {
        id: Uuid,
        name: String,
        error: Option<String>,
    },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Candidate base URLs, tried round-robin by attempt number
    pub base_urls: Vec<String>,
    /// Directory downloaded bundles are published into
    pub cache_dir: PathBuf,
    /// Write buffer size for the temp file
    pub buffer_size: usize,
    /// Default rate cap in bytes/sec for new jobs (0 = unlimited)
    pub rate_limit: u64,
    /// Default retry budget for new jobs (0 = retry forever)
    pub max_retries: u32,
    /// Delay between failed attempts
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    /// Per-read timeout; a stalled body fails the attempt
    pub read_timeout_secs: u64,
    pub user_agent: String,
    pub checksum: ChecksumKind,
    pub worker_priority: WorkerPriority,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_urls: Vec::new(),
            cache_dir: dirs::cache_dir()
                .map(|p| p.join("bundlekit"))
                .unwrap_or_else(|| PathBuf::from(".bundlekit")),
            buffer_size: 64 * 1024,
            rate_limit: 128 * 1024,
            max_retries: 5,
            retry_backoff_ms: 1000,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            user_agent: format!("bundlekit/{}", env!("CARGO_PKG_VERSION")),
            checksum: ChecksumKind::Crc16,
            worker_priority: WorkerPriority::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_appends_extension() {
        let path = Metadata::sidecar_path(Path::new("/tmp/bundles/ui.pkg"));
        assert_eq!(path, PathBuf::from("/tmp/bundles/ui.pkg.meta"));
    }

    #[test]
    fn test_checksum_kind_parse() {
        assert_eq!("MD5".parse::<ChecksumKind>().unwrap(), ChecksumKind::Md5);
        assert_eq!("crc16".parse::<ChecksumKind>().unwrap(), ChecksumKind::Crc16);
        assert!("sha1".parse::<ChecksumKind>().is_err());
    }

    #[test]
    fn test_settings_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"base_urls": ["http://cdn.local/"], "max_retries": 2}"#)
                .unwrap();
        assert_eq!(settings.base_urls, vec!["http://cdn.local/".to_string()]);
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.rate_limit, 128 * 1024);
        assert_eq!(settings.retry_backoff_ms, 1000);
    }

    #[test]
    fn test_bundle_info_type_field() {
        let info: BundleInfo =
            serde_json::from_str(r#"{"name": "ui", "type": "ziparchive", "size": 12}"#).unwrap();
        assert_eq!(info.kind, BundleType::ZipArchive);
        assert_eq!(info.size, 12);
        assert!(info.checksum.is_none());
    }
}
