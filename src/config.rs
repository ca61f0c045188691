//! Storage engine configuration options.
//!
//! This module provides the [`StoreOptions`] structure controlling where a
//! store lives and how the engine grows and waits.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrowkv::{KeyStorage, StoreOptions};
//!
//! // Persistent store with defaults
//! let store = KeyStorage::open(StoreOptions::at_path("data.bkv"))?;
//!
//! // Or customize specific options
//! let mut options = StoreOptions::at_path("data.bkv");
//! options.grow_chunk_pages = 4096;
//! let store = KeyStorage::open(options)?;
//! # Ok::<(), burrowkv::StoreError>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Configuration options for a [`KeyStorage`](crate::KeyStorage) instance.
///
/// Use [`StoreOptions::at_path`] for a persistent store or
/// [`StoreOptions::in_memory`] for an anonymous, non-persistent one, then
/// adjust individual fields as needed.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Filesystem path of the store file. `None` selects an anonymous
    /// in-memory store that disappears on close.
    pub path: Option<PathBuf>,

    /// Number of pages mapped per growth step. The file is extended and
    /// mapped in chunks of this many pages; larger chunks mean fewer
    /// mappings for big stores.
    pub grow_chunk_pages: u32,

    /// Interval at which blocked page-lock waiters re-check availability.
    ///
    /// Waits are bounded by periodic wake-ups rather than relying solely on
    /// notifications, so a stalled holder cannot silence a waiter forever.
    pub lock_poll_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            grow_chunk_pages: 1024,
            lock_poll_interval: Duration::from_millis(100),
        }
    }
}

impl StoreOptions {
    /// Options for a persistent store at `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Options for an anonymous in-memory store.
    ///
    /// Used by tests and callers that want the engine semantics without a
    /// backing file; nothing survives close.
    pub fn in_memory() -> Self {
        Self::default()
    }
}
