//! Checksum algorithms used to verify downloaded bundles
//!
//! Two flavours exist: algorithms that can be fed incrementally while bytes
//! stream in (CRC-16), and algorithms that are always computed in a dedicated
//! pass over the finished file (MD5). The worker asks
//! [`ChecksumAlgorithm::requires_full_pass`] instead of matching on names.

use bundlekit_types::ChecksumKind;
use crc::{Crc, Digest, CRC_16_ARC};
use md5::{Digest as _, Md5};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Chunk size for file passes
const READ_CHUNK: usize = 64 * 1024;

/// An integrity digest over a byte stream
pub trait ChecksumAlgorithm: Send {
    fn kind(&self) -> ChecksumKind;

    /// True when streamed bytes must not be fed and the digest is computed
    /// over the whole file once the transfer has finished
    fn requires_full_pass(&self) -> bool;

    fn reset(&mut self);

    fn update(&mut self, data: &[u8]);

    /// Lowercase hex digest of everything fed since the last reset
    fn hex(&self) -> String;
}

/// Create the algorithm selected by `kind`
pub fn for_kind(kind: ChecksumKind) -> Box<dyn ChecksumAlgorithm> {
    match kind {
        ChecksumKind::Crc16 => Box::new(Crc16Checksum::new()),
        ChecksumKind::Md5 => Box::new(Md5Checksum::new()),
    }
}

/// Case-insensitive digest comparison
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

/// CRC-16/ARC, incremental
pub struct Crc16Checksum {
    digest: Digest<'static, u16>,
}

impl Crc16Checksum {
    pub fn new() -> Self {
        Self {
            digest: CRC16.digest(),
        }
    }
}

impl Default for Crc16Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumAlgorithm for Crc16Checksum {
    fn kind(&self) -> ChecksumKind {
        ChecksumKind::Crc16
    }

    fn requires_full_pass(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.digest = CRC16.digest();
    }

    fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    fn hex(&self) -> String {
        format!("{:04x}", self.digest.clone().finalize())
    }
}

/// MD5, whole-buffer
#[derive(Default)]
pub struct Md5Checksum {
    hasher: Md5,
}

impl Md5Checksum {
    pub fn new() -> Self {
        Self { hasher: Md5::new() }
    }
}

impl ChecksumAlgorithm for Md5Checksum {
    fn kind(&self) -> ChecksumKind {
        ChecksumKind::Md5
    }

    fn requires_full_pass(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.hasher = Md5::new();
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

/// Feed the first `limit` bytes of `file` (or all of it when `None`) into
/// `algorithm`, starting from the current position.
pub async fn feed_file(
    algorithm: &mut dyn ChecksumAlgorithm,
    file: &mut File,
    limit: Option<u64>,
) -> std::io::Result<u64> {
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut total = 0u64;

    loop {
        let want = match limit {
            Some(limit) if total >= limit => break,
            Some(limit) => READ_CHUNK.min((limit - total) as usize),
            None => READ_CHUNK,
        };
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            break;
        }
        algorithm.update(&buffer[..read]);
        total += read as u64;
    }

    Ok(total)
}

/// Compute the digest of a whole file from offset zero
pub async fn digest_file(kind: ChecksumKind, path: &Path) -> std::io::Result<String> {
    let mut algorithm = for_kind(kind);
    let mut file = File::open(path).await?;
    feed_file(algorithm.as_mut(), &mut file, None).await?;
    Ok(algorithm.hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        let mut crc = Crc16Checksum::new();
        crc.update(b"123456789");
        assert_eq!(crc.hex(), "bb3d");
    }

    #[test]
    fn test_crc16_incremental_matches_single_update() {
        let mut whole = Crc16Checksum::new();
        whole.update(b"hello bundle world");

        let mut split = Crc16Checksum::new();
        split.update(b"hello ");
        split.update(b"bundle ");
        split.update(b"world");

        assert_eq!(whole.hex(), split.hex());
        assert!(!split.requires_full_pass());
    }

    #[test]
    fn test_md5_known_vector_and_reset() {
        let mut md5 = Md5Checksum::new();
        md5.update(b"garbage");
        md5.reset();
        md5.update(b"abc");
        assert_eq!(md5.hex(), "900150983cd24fb0d6963f7d28e17f72");
        assert!(md5.requires_full_pass());
    }

    #[test]
    fn test_digests_match_ignores_case() {
        assert!(digests_match("bb3d", "BB3D"));
        assert!(!digests_match("bb3d", "bb3e"));
    }

    #[tokio::test]
    async fn test_feed_file_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"123456789abc").await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let mut crc = Crc16Checksum::new();
        let fed = feed_file(&mut crc, &mut file, Some(9)).await.unwrap();

        assert_eq!(fed, 9);
        assert_eq!(crc.hex(), "bb3d");
        assert_eq!(
            digest_file(ChecksumKind::Md5, &path).await.unwrap(),
            {
                let mut md5 = Md5Checksum::new();
                md5.update(b"123456789abc");
                md5.hex()
            }
        );
    }
}
