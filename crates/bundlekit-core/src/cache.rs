//! Validation of published bundles against their sidecar record

use crate::checksum;
use crate::error::BundleKitError;
use bundlekit_types::{BundleInfo, ChecksumKind, Metadata};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Read the sidecar of `final_path`; `None` when there is none
pub async fn read_metadata(final_path: &Path) -> Result<Option<Metadata>, BundleKitError> {
    let content = match fs::read_to_string(Metadata::sidecar_path(final_path)).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

/// Whether the cached file can be used without downloading it again
///
/// The file and its sidecar must exist, and the recorded size must match the
/// file and the descriptor. A declared checksum must match the recorded one.
pub async fn validate_cached(final_path: &Path, info: &BundleInfo) -> Result<bool, BundleKitError> {
    let length = match fs::metadata(final_path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let Some(meta) = read_metadata(final_path).await? else {
        debug!("{} has no sidecar", final_path.display());
        return Ok(false);
    };

    if meta.size != length || (info.size > 0 && meta.size != info.size) {
        debug!(
            "{} size mismatch (file {}, sidecar {}, declared {})",
            final_path.display(),
            length,
            meta.size,
            info.size
        );
        return Ok(false);
    }

    if let Some(expected) = info.checksum.as_deref().filter(|c| !c.is_empty()) {
        if !checksum::digests_match(&meta.checksum, expected) {
            debug!(
                "{} checksum mismatch ({} != {})",
                final_path.display(),
                meta.checksum,
                expected
            );
            return Ok(false);
        }
    }

    Ok(true)
}

/// Re-hash the file and compare against its sidecar
pub async fn verify_digest(final_path: &Path, kind: ChecksumKind) -> Result<bool, BundleKitError> {
    let Some(meta) = read_metadata(final_path).await? else {
        return Ok(false);
    };
    let digest = checksum::digest_file(kind, final_path).await?;
    Ok(checksum::digests_match(&digest, &meta.checksum))
}
