#![forbid(unsafe_code)]

use std::ops::Range;

use crate::error::{GloamError, Result};
use crate::types::{PageId, Version, SMALLEST_PHYSICAL_BLOCK};

/// On-disk format version of the pager file.
pub const PAGER_FORMAT_VERSION: u16 = 1;

/// Serialized size of a [`QueueState`].
pub const QUEUE_STATE_LEN: usize = 34;

const HDR_FORMAT: Range<usize> = 0..2;
const HDR_PAGE_SIZE: Range<usize> = 2..6;
const HDR_PAGE_COUNT: Range<usize> = 6..14;
const HDR_FREE_LIST: Range<usize> = 14..48;
const HDR_DELAYED_FREE: Range<usize> = 48..82;
const HDR_REMAP_QUEUE: Range<usize> = 82..116;
const HDR_COMMITTED: Range<usize> = 116..124;
const HDR_OLDEST: Range<usize> = 124..132;
const HDR_META_SIZE: Range<usize> = 132..136;
const HDR_META: usize = 136;

/// Persistent state of one FIFO queue: where reads resume, where the chain
/// ends, and the page/entry counts. There is no tail offset because the tail
/// page is always a never-written empty page whose items start at the item
/// origin.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueState {
    pub head: PageId,
    pub head_offset: u16,
    pub tail: PageId,
    pub num_pages: i64,
    pub num_entries: i64,
}

impl QueueState {
    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.head.0.to_be_bytes());
        buf[8..10].copy_from_slice(&self.head_offset.to_be_bytes());
        buf[10..18].copy_from_slice(&self.tail.0.to_be_bytes());
        buf[18..26].copy_from_slice(&self.num_pages.to_be_bytes());
        buf[26..34].copy_from_slice(&self.num_entries.to_be_bytes());
    }

    /// Append the serialized state (used by the B-tree meta key).
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + QUEUE_STATE_LEN, 0);
        self.encode(&mut out[start..start + QUEUE_STATE_LEN]);
    }

    pub(crate) fn decode_from(buf: &[u8]) -> Self {
        Self::decode(buf)
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            head: PageId(u64::from_be_bytes(buf[0..8].try_into().unwrap())),
            head_offset: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
            tail: PageId(u64::from_be_bytes(buf[10..18].try_into().unwrap())),
            num_pages: i64::from_be_bytes(buf[18..26].try_into().unwrap()),
            num_entries: i64::from_be_bytes(buf[26..34].try_into().unwrap()),
        }
    }
}

/// The pager header, stored in logical page 0 and mirrored to page 1 before
/// each commit. Header pages are always encoded into the smallest physical
/// block regardless of the configured page size.
#[derive(Clone, Debug, PartialEq)]
pub struct PagerHeader {
    pub format_version: u16,
    pub page_size: u32,
    pub page_count: i64,
    pub free_list: QueueState,
    pub delayed_free_list: QueueState,
    pub remap_queue: QueueState,
    pub committed_version: Version,
    pub oldest_version: Version,
    pub meta_key: Vec<u8>,
}

impl PagerHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            format_version: PAGER_FORMAT_VERSION,
            page_size,
            page_count: 0,
            free_list: QueueState::default(),
            delayed_free_list: QueueState::default(),
            remap_queue: QueueState::default(),
            committed_version: Version(1),
            oldest_version: Version(1),
            meta_key: Vec::new(),
        }
    }

    pub fn max_meta_key_len() -> usize {
        SMALLEST_PHYSICAL_BLOCK - 4 - HDR_META
    }

    /// Encode into a header page payload. Trailing bytes are set to 0xFF.
    pub fn encode(&self, payload: &mut [u8]) -> Result<()> {
        if payload.len() < HDR_META + self.meta_key.len() {
            return Err(GloamError::InvalidArgument("meta key too large for header page"));
        }
        payload[HDR_FORMAT].copy_from_slice(&self.format_version.to_be_bytes());
        payload[HDR_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        payload[HDR_PAGE_COUNT].copy_from_slice(&self.page_count.to_be_bytes());
        self.free_list.encode(&mut payload[HDR_FREE_LIST]);
        self.delayed_free_list.encode(&mut payload[HDR_DELAYED_FREE]);
        self.remap_queue.encode(&mut payload[HDR_REMAP_QUEUE]);
        payload[HDR_COMMITTED].copy_from_slice(&self.committed_version.0.to_be_bytes());
        payload[HDR_OLDEST].copy_from_slice(&self.oldest_version.0.to_be_bytes());
        payload[HDR_META_SIZE].copy_from_slice(&(self.meta_key.len() as i32).to_be_bytes());
        let meta_end = HDR_META + self.meta_key.len();
        payload[HDR_META..meta_end].copy_from_slice(&self.meta_key);
        payload[meta_end..].fill(0xff);
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < HDR_META {
            return Err(GloamError::Corruption("header page truncated"));
        }
        let format_version = u16::from_be_bytes(payload[HDR_FORMAT].try_into().unwrap());
        let page_size = u32::from_be_bytes(payload[HDR_PAGE_SIZE].try_into().unwrap());
        let page_count = i64::from_be_bytes(payload[HDR_PAGE_COUNT].try_into().unwrap());
        let free_list = QueueState::decode(&payload[HDR_FREE_LIST]);
        let delayed_free_list = QueueState::decode(&payload[HDR_DELAYED_FREE]);
        let remap_queue = QueueState::decode(&payload[HDR_REMAP_QUEUE]);
        let committed_version = Version(i64::from_be_bytes(payload[HDR_COMMITTED].try_into().unwrap()));
        let oldest_version = Version(i64::from_be_bytes(payload[HDR_OLDEST].try_into().unwrap()));
        let meta_key_size = i32::from_be_bytes(payload[HDR_META_SIZE].try_into().unwrap());
        if meta_key_size < 0 || HDR_META + meta_key_size as usize > payload.len() {
            return Err(GloamError::Corruption("header meta key size out of range"));
        }
        let meta_key = payload[HDR_META..HDR_META + meta_key_size as usize].to_vec();
        Ok(Self {
            format_version,
            page_size,
            page_count,
            free_list,
            delayed_free_list,
            remap_queue,
            committed_version,
            oldest_version,
            meta_key,
        })
    }
}
