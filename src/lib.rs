//! Embedded page-oriented key/value storage engine.
//!
//! A store is one flat file of fixed-size pages holding a hierarchy of
//! sorted, prefix-compressed key pages. Lookups walk the hierarchy from the
//! root under hand-over-hand page locks; mutations are copy-on-write: the
//! affected page is decomposed, edited in memory, recomposed into freshly
//! allocated pages, and the single incoming pointer is patched before the
//! superseded page returns to the free pool.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrowkv::{KeyStorage, StoreOptions};
//!
//! let store = KeyStorage::open(StoreOptions::at_path("data.bkv"))?;
//! store.store(b"answer", b"42")?;
//! assert_eq!(store.fetch(b"answer")?, b"42");
//! store.close()?;
//! # Ok::<(), burrowkv::StoreError>(())
//! ```

pub mod config;
pub mod error;
pub mod locking;
pub mod logging;
pub mod page;
pub mod pager;
pub mod store;

// Public re-exports for the top-level API
pub use config::StoreOptions;
pub use error::{Result, StoreError};
pub use logging::init_logging;
pub use store::KeyStorage;
