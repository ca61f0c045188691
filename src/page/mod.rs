//! On-disk data-page model.
//!
//! Every non-super page starts with the same 8-byte header: a page kind and
//! an entry count. Exactly one kind carries data today; the value-page kind
//! is reserved in the format for out-of-line values and is never produced.

use std::collections::BTreeMap;
use std::convert::TryInto;

use crate::error::{Result, StoreError};
use crate::pager::PageId;

pub mod direct;

/// Size of the common data-page header: kind (4 bytes) + entry count (4).
pub const PAGE_HEADER_SIZE: usize = 8;

const KIND_DIRECT_KEY: u32 = 1;
const KIND_VALUE: u32 = 2;

/// Kinds of data page the on-disk format defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Sorted, prefix-compressed key→value map.
    DirectKey,
    /// Reserved for values too large to inline. Never produced.
    Value,
}

impl PageKind {
    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            KIND_DIRECT_KEY => Ok(PageKind::DirectKey),
            KIND_VALUE => Ok(PageKind::Value),
            other => Err(StoreError::Corruption(format!(
                "unknown page kind {other}"
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            PageKind::DirectKey => KIND_DIRECT_KEY,
            PageKind::Value => KIND_VALUE,
        }
    }
}

/// Reads the kind and entry count from a data page.
pub fn read_header(data: &[u8]) -> Result<(PageKind, u32)> {
    if data.len() < PAGE_HEADER_SIZE {
        return Err(StoreError::Corruption(
            "page shorter than header size".into(),
        ));
    }
    let kind_bytes: [u8; 4] = data[0..4]
        .try_into()
        .map_err(|_| StoreError::Corruption("failed to read page kind".into()))?;
    let count_bytes: [u8; 4] = data[4..8]
        .try_into()
        .map_err(|_| StoreError::Corruption("failed to read entry count".into()))?;
    Ok((
        PageKind::from_u32(u32::from_le_bytes(kind_bytes))?,
        u32::from_le_bytes(count_bytes),
    ))
}

/// Writes the kind and entry count into a data page.
pub fn write_header(data: &mut [u8], kind: PageKind, entry_count: u32) {
    data[0..4].copy_from_slice(&kind.as_u32().to_le_bytes());
    data[4..8].copy_from_slice(&entry_count.to_le_bytes());
}

/// Decoded form of one entry's value. Exactly one variant is meaningful
/// per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    /// Value bytes stored inline.
    Direct(Vec<u8>),
    /// Page number of an out-of-line value page. Recognized on decode,
    /// never produced on encode.
    ValuePage(PageId),
    /// Page number of a child key page continuing the key with the matched
    /// portion stripped.
    KeyPage(PageId),
}

/// Decomposed, in-memory form of a page: an ordered map from page-local
/// key to entry value. This is what compose and decompose convert to and
/// from page bytes.
pub type PageContents = BTreeMap<Vec<u8>, EntryValue>;
