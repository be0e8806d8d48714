#![forbid(unsafe_code)]

use std::fmt;

/// Logical page ID handed out by the pager. Zero is reserved as invalid;
/// IDs 0 and 1 address the header page and its backup.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageId(pub u64);

impl PageId {
    pub const INVALID: PageId = PageId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Commit version counter. Versions are assigned by commits, starting at 1
/// for a freshly created file.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(pub i64);

impl Version {
    pub const INVALID: Version = Version(-1);
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The smallest physical block: header pages always use this size, and all
/// file offsets and lengths are multiples of it.
pub const SMALLEST_PHYSICAL_BLOCK: usize = 4096;

/// Checksum over a page payload, seeded with the page's logical ID so that a
/// page written to the wrong location fails verification.
pub fn page_crc32(page: PageId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page.0.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_crc32_binds_content_to_location() {
        let payload = vec![3u8; 64];
        let a = page_crc32(PageId(7), &payload);
        assert_eq!(a, page_crc32(PageId(7), &payload));
        assert_ne!(a, page_crc32(PageId(8), &payload));

        let mut other = payload.clone();
        other[10] ^= 0xff;
        assert_ne!(a, page_crc32(PageId(7), &other));
    }
}
