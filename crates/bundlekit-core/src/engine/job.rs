//! Transfer job - one requested bundle download and its progress

use bundlekit_types::{BundleInfo, ChecksumKind, Metadata, Settings};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Extension of the in-progress temp file
pub const PART_EXT: &str = ".part";

/// Default rate cap for a new job (128 KiB/s)
pub const DEFAULT_BYTES_PER_SECOND: u64 = 128 * 1024;

/// A single download request
///
/// The job is moved into the engine by `enqueue` and handed back through the
/// completion callback once `is_done()` is true.
#[derive(Debug, Clone)]
pub struct TransferJob {
    id: Uuid,
    name: String,
    checksum: Option<String>,
    comment: String,
    priority: i32,
    size: u64,
    final_path: PathBuf,

    /// Explicit URL; when unset the engine's base URLs plus `name` are used
    pub url: Option<String>,
    pub checksum_kind: ChecksumKind,
    /// Rate cap in bytes/sec (0 = unlimited)
    pub bytes_per_second: u64,
    /// Jumps ahead of every non-emergency job in the queue
    pub emergency: bool,
    /// Attempt budget (0 = retry forever)
    pub retry: u32,

    pub(crate) tried: u32,
    pub(crate) bytes: u64,
    pub(crate) error: Option<String>,
    pub(crate) running: bool,
    pub(crate) done: bool,
    pub(crate) verified: Option<Metadata>,
}

impl TransferJob {
    pub fn new(name: impl Into<String>, final_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            checksum: None,
            comment: String::new(),
            priority: 0,
            size: 0,
            final_path: final_path.into(),
            url: None,
            checksum_kind: ChecksumKind::default(),
            bytes_per_second: DEFAULT_BYTES_PER_SECOND,
            emergency: false,
            retry: 0,
            tried: 0,
            bytes: 0,
            error: None,
            running: false,
            done: false,
            verified: None,
        }
    }

    /// Build a job for a manifest entry, published under `dir/<name>`
    pub fn for_bundle(info: &BundleInfo, dir: &Path) -> Self {
        let mut job = Self::new(info.name.clone(), dir.join(&info.name))
            .with_size(info.size)
            .with_priority(info.priority);
        job.checksum = info.checksum.clone();
        job
    }

    /// Apply the per-job defaults from settings: rate cap, retry budget, algorithm
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_rate_limit(settings.rate_limit)
            .with_retry(settings.max_retries)
            .with_checksum_kind(settings.checksum)
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_checksum_kind(mut self, kind: ChecksumKind) -> Self {
        self.checksum_kind = kind;
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_second: u64) -> Self {
        self.bytes_per_second = bytes_per_second;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref().filter(|c| !c.is_empty())
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Expected size in bytes (0 = unknown)
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> PathBuf {
        let mut os = self.final_path.as_os_str().to_owned();
        os.push(PART_EXT);
        PathBuf::from(os)
    }

    /// Bytes written so far, including a resumed prefix
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of finished attempts
    pub fn tried(&self) -> u32 {
        self.tried
    }

    /// Terminal error of a failed job
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_success(&self) -> bool {
        self.done && self.error.is_none()
    }

    /// Size and checksum recorded in the sidecar, once published
    pub fn verified(&self) -> Option<&Metadata> {
        self.verified.as_ref()
    }

    /// Fraction in `0.0..=1.0`; 0 while the size is unknown
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        (self.bytes as f64 / self.size as f64).clamp(0.0, 1.0)
    }

    /// Whether the retry budget is spent after the attempts made so far
    pub(crate) fn budget_exhausted(&self) -> bool {
        self.retry > 0 && self.tried >= self.retry
    }

    /// Ordering key used by the queue; larger runs first
    pub(crate) fn queue_rank(&self) -> (bool, i32) {
        (self.emergency, self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path_appends_part() {
        let job = TransferJob::new("ui", "/cache/ui.bundle");
        assert_eq!(job.temp_path(), PathBuf::from("/cache/ui.bundle.part"));
    }

    #[test]
    fn test_progress_clamped() {
        let mut job = TransferJob::new("ui", "/cache/ui").with_size(100);
        job.bytes = 50;
        assert_eq!(job.progress(), 0.5);
        job.bytes = 150;
        assert_eq!(job.progress(), 1.0);

        let unknown = TransferJob::new("ui", "/cache/ui");
        assert_eq!(unknown.progress(), 0.0);
    }

    #[test]
    fn test_budget_exhausted() {
        let mut job = TransferJob::new("ui", "/cache/ui").with_retry(2);
        job.tried = 1;
        assert!(!job.budget_exhausted());
        job.tried = 2;
        assert!(job.budget_exhausted());

        let mut forever = TransferJob::new("ui", "/cache/ui");
        forever.tried = 1000;
        assert!(!forever.budget_exhausted());
    }

    #[test]
    fn test_for_bundle_copies_descriptor() {
        let info = BundleInfo::new("scene").with_size(42).with_checksum("beef");
        let job = TransferJob::for_bundle(&info, Path::new("/cache"));
        assert_eq!(job.path(), Path::new("/cache/scene"));
        assert_eq!(job.size(), 42);
        assert_eq!(job.checksum(), Some("beef"));
    }

    #[test]
    fn test_with_settings() {
        let settings = Settings {
            rate_limit: 0,
            max_retries: 3,
            checksum: ChecksumKind::Md5,
            ..Settings::default()
        };
        let job = TransferJob::new("ui", "/cache/ui").with_settings(&settings);
        assert_eq!(job.bytes_per_second, 0);
        assert_eq!(job.retry, 3);
        assert_eq!(job.checksum_kind, ChecksumKind::Md5);
    }
}
