//! Error handling for the storage engine.
//!
//! This module defines the error types used throughout the engine. All
//! public APIs return [`Result<T>`] so callers handle every failure mode
//! through one enum.
//!
//! # Error Types
//!
//! - [`StoreError`] - Main error enum with variants for different failure modes
//! - [`Result`] - Result type alias for convenience

use std::io;
use thiserror::Error;

/// Result type for storage engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage engine operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error from the underlying filesystem or memory mapping.
    ///
    /// Raised while opening, growing, mapping, or flushing the store file.
    /// Fatal to the in-flight operation only; the store stays usable.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption detected.
    ///
    /// The store file is not a recognized store, was produced by an
    /// incompatible format version, or contains a malformed page. Not
    /// recoverable by the engine itself.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Requested key was not present in the store.
    #[error("key not found")]
    NotFound,

    /// Invalid argument or operation.
    ///
    /// Covers oversized values, opening a store that another process holds,
    /// and freeing a page that is already free or reserved.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Feature is defined in the on-disk format but not implemented.
    ///
    /// The only such feature today is out-of-line value pages; the entry
    /// tag is reserved and recognized, but never produced.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
}
