//! Checksum-gated incremental index cache.
//!
//! [`IncrementalIndexCache`] answers reads immediately from an in-memory
//! [`VersionedCacheSlot`] or a [`PersistentStore`], and catches up in the
//! background through a debounced refresh queue that only recomputes when an
//! [`IndexSource`] reports a new [`Checksum`].

mod cache;
mod checksum;
mod error;
mod reference;
mod slot;
mod source;
mod store;

pub use cache::{CacheStats, IncrementalIndexCache, IndexCacheConfig, RefreshOutcome};
pub use checksum::Checksum;
pub use error::{IndexError, StoreError};
pub use reference::ReferenceSet;
pub use slot::{SlotOrigin, VersionedCacheSlot};
pub use source::IndexSource;
pub use store::{FileStore, MemoryStore, NoStore, PersistentStore, StoreKey};
