#![forbid(unsafe_code)]

use crate::error::{GloamError, Result};
use crate::types::{page_crc32, PageId};

/// A fixed-size page image. The payload is everything but the trailing four
/// bytes, which hold a CRC32 over the payload seeded with the page's logical
/// ID. Pages are mutable while being composed and immutable once sealed and
/// shared; mutation of a shared page requires `clone_for_update`.
#[derive(Clone, Debug)]
pub struct PageBuffer {
    buf: Box<[u8]>,
}

impl PageBuffer {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 4);
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf: buf.into_boxed_slice() }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Usable bytes, excluding the trailing checksum.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.buf.len() - 4]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.buf.len() - 4;
        &mut self.buf[..end]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Compute and store the checksum for this page at `id`.
    pub fn seal(&mut self, id: PageId) {
        let crc = page_crc32(id, &self.buf[..self.buf.len() - 4]);
        let end = self.buf.len();
        self.buf[end - 4..].copy_from_slice(&crc.to_be_bytes());
    }

    pub fn stored_checksum(&self) -> u32 {
        let end = self.buf.len();
        u32::from_be_bytes(self.buf[end - 4..].try_into().expect("checksum slice is 4 bytes"))
    }

    /// Verify the stored checksum against the payload for `id`.
    pub fn verify(&self, id: PageId) -> Result<()> {
        let computed = page_crc32(id, self.payload());
        let stored = self.stored_checksum();
        if stored != computed {
            return Err(GloamError::ChecksumMismatch {
                page: id.0,
                stored,
                computed,
            });
        }
        Ok(())
    }

    /// Copy for modification while readers keep the original stable.
    pub fn clone_for_update(&self) -> PageBuffer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_verify() {
        let mut page = PageBuffer::new(4096);
        page.payload_mut()[0..4].copy_from_slice(b"data");
        page.seal(PageId(9));
        page.verify(PageId(9)).unwrap();

        // Same bytes at another ID must fail: the checksum binds location.
        let err = page.verify(PageId(10)).unwrap_err();
        assert!(matches!(err, GloamError::ChecksumMismatch { page: 10, .. }));
    }

    #[test]
    fn corrupted_payload_fails_verification() {
        let mut page = PageBuffer::new(4096);
        page.seal(PageId(3));
        let mut copy = page.clone_for_update();
        copy.payload_mut()[100] = 0x5a;
        assert!(copy.verify(PageId(3)).is_err());
        page.verify(PageId(3)).unwrap();
    }
}
