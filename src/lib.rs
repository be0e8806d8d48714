//! gloam: an ordered key-value storage engine.
//!
//! The engine is a copy-on-write B-tree layered over a paged,
//! delayed-write-ahead-log (DWAL) pager on a single file. The pager gives
//! page-granularity atomic updates, crash-safe durability through a
//! dual-header commit protocol, and multi-version read snapshots; the tree
//! stores ordered key/value records with prefix-compressed in-page delta
//! trees and reclaims space incrementally as old versions retire.
//!
//! ```no_run
//! use gloam::{KvStore, PagerOptions};
//!
//! # fn main() -> gloam::Result<()> {
//! let mut store = KvStore::open("data.glm", PagerOptions::default())?;
//! store.set(b"hello", b"world")?;
//! store.commit()?;
//! assert_eq!(store.read_value(b"hello")?, Some(b"world".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod io;
pub mod kv;
pub mod metrics;
pub mod pager;
pub mod tree;
pub mod types;

pub use error::{GloamError, Result};
pub use io::{BlockFile, StdBlockFile};
pub use kv::{KvStore, RangeResult, StorageBytes};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use pager::{Pager, PagerOptions, ReadSnapshot};
pub use types::{PageId, Version};
