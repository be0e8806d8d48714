use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GloamError>;

#[derive(Debug, Error)]
pub enum GloamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch on page {page}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { page: u64, stored: u32, computed: u32 },
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("format version mismatch: file has {found}, supported is {supported}")]
    FormatMismatch { found: u16, supported: u16 },
    #[error("version {requested} is older than the earliest retained snapshot {earliest}")]
    VersionInvalid { requested: i64, earliest: i64 },
    #[error("snapshot retention was withdrawn for version {0}")]
    TransactionTooOld(i64),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("store is closed")]
    Closed,
}

impl GloamError {
    /// Fatal errors poison the pager: every later operation re-surfaces them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GloamError::Io(_)
                | GloamError::ChecksumMismatch { .. }
                | GloamError::Corruption(_)
                | GloamError::FormatMismatch { .. }
        )
    }

    /// Reproduce a fatal error for the poison latch. Only fatal kinds are
    /// reproducible; the rest are per-call errors and never latched.
    pub(crate) fn clone_fatal(&self) -> GloamError {
        match self {
            GloamError::Io(e) => GloamError::Io(io::Error::new(e.kind(), e.to_string())),
            GloamError::ChecksumMismatch { page, stored, computed } => GloamError::ChecksumMismatch {
                page: *page,
                stored: *stored,
                computed: *computed,
            },
            GloamError::Corruption(msg) => GloamError::Corruption(msg),
            GloamError::FormatMismatch { found, supported } => GloamError::FormatMismatch {
                found: *found,
                supported: *supported,
            },
            _ => GloamError::Closed,
        }
    }
}
