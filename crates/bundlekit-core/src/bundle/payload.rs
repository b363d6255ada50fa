//! Payload decoders plugged into a [`Bundle`](super::Bundle)

use crate::error::BundleKitError;
use bundlekit_types::BundleInfo;
use std::io::Read;

/// Largest up-front allocation made from a declared size
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// Decodes a bundle's own content
///
/// Implementations only touch their own state; readiness bookkeeping is done
/// by the owning bundle once `decode` returns `Ok`.
pub trait BundlePayload {
    fn decode(&mut self, info: &BundleInfo, stream: &mut dyn Read) -> Result<(), BundleKitError>;

    /// Drop decoded content when the bundle is released
    fn unload(&mut self) {}

    /// Raw decoded bytes, for payloads that keep them
    fn data(&self) -> Option<&[u8]> {
        None
    }
}

/// Keeps the whole stream in memory
#[derive(Debug, Default)]
pub struct BytesPayload {
    data: Vec<u8>,
}

impl BytesPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundlePayload for BytesPayload {
    fn decode(&mut self, info: &BundleInfo, stream: &mut dyn Read) -> Result<(), BundleKitError> {
        let mut data = Vec::with_capacity(info.size.min(MAX_PREALLOC) as usize);
        stream.read_to_end(&mut data)?;

        if info.size > 0 && data.len() as u64 != info.size {
            return Err(BundleKitError::Decode {
                name: info.name.clone(),
                message: format!("expected {} bytes, read {}", info.size, data.len()),
            });
        }

        self.data = data;
        Ok(())
    }

    fn unload(&mut self) {
        self.data = Vec::new();
    }

    fn data(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_payload_checks_declared_size() {
        let info = BundleInfo::new("ui").with_size(4);
        let mut payload = BytesPayload::new();

        let err = payload.decode(&info, &mut &b"abc"[..]).unwrap_err();
        assert_eq!(err.to_string(), "failed to decode bundle ui: expected 4 bytes, read 3");

        payload.decode(&info, &mut &b"abcd"[..]).unwrap();
        assert_eq!(payload.data(), Some(&b"abcd"[..]));

        payload.unload();
        assert_eq!(payload.data(), Some(&b""[..]));
    }

    #[test]
    fn test_bytes_payload_accepts_any_size_when_undeclared() {
        let info = BundleInfo::new("ui");
        let mut payload = BytesPayload::new();
        payload.decode(&info, &mut &b"whatever"[..]).unwrap();
        assert_eq!(payload.data().map(<[u8]>::len), Some(8));
    }
}
