//! Codec for direct-key pages.
//!
//! A direct-key page stores a sorted, prefix-compressed key→value map:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ kind (4B) │ entry count (4B)                                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ prefix len (1B) │ common prefix (0-255B) │ pad to 4          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ skip table: 256 × u16 entry offsets                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ entries, sorted by key suffix                                │
//! │   suffix len (2B) │ value tag (2B) │ suffix (pad 4) │ value  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ end sentinel (2B, high bit set)                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The value tag is the literal length, or `0x8000` for a value-page
//! reference, or `0x8001` for a key-page reference; references store a
//! 4-byte page number, literals store the bytes padded to 4. `skip[b]` is
//! the offset, relative to the entry region, of the first entry whose
//! suffix starts with a byte ≥ `b`, so a lookup jumps near its candidate
//! run instead of scanning from the top.
//!
//! Pages are composed once and never rewritten; the only in-place mutation
//! the engine performs is [`replace_child_pointer`].

use tracing::trace;

use crate::error::{Result, StoreError};
use crate::page::{
    read_header, write_header, EntryValue, PageContents, PageKind, PAGE_HEADER_SIZE,
};
use crate::pager::allocator::PageAllocator;
use crate::pager::{zeroed_page, PageId, PagedFile, PAGE_SIZE};

const SKIP_TABLE_SIZE: usize = 256 * 2;
const ENTRY_HEADER_SIZE: usize = 4;
const END_SENTINEL: u16 = 0x8000;
const END_SENTINEL_SIZE: usize = 2;
const TAG_VALUE_PAGE: u16 = 0x8000;
const TAG_KEY_PAGE: u16 = 0x8001;
const MAX_PREFIX_LEN: usize = 255;

/// Size of the synthetic `{branch byte → key page}` entry a split leaves
/// behind. Only groups larger than this shrink the page when moved out.
const SYNTHETIC_ENTRY_SIZE: usize = ENTRY_HEADER_SIZE + 4 + 4;

/// Largest literal value that is guaranteed to fit on a page of its own,
/// whatever the page's common prefix turns out to be.
pub const MAX_VALUE_LEN: usize =
    (PAGE_SIZE - entries_offset(MAX_PREFIX_LEN) - ENTRY_HEADER_SIZE - END_SENTINEL_SIZE) & !3;

/// Outcome of a single-page lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResult {
    /// The key ends on this page with an inline value.
    Direct(Vec<u8>),
    /// The key ends on this page with an out-of-line value reference.
    ValuePage(PageId),
    /// A key-page entry matched a prefix of the key; continue into `page`
    /// with the first `matched` bytes of the key consumed.
    Descend { page: PageId, matched: usize },
    /// No entry on this page can lead to the key.
    Absent,
}

const fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Offset of the entry region for a given common-prefix length.
const fn entries_offset(prefix_len: usize) -> usize {
    align4(PAGE_HEADER_SIZE + 1 + prefix_len) + SKIP_TABLE_SIZE
}

fn entry_size(suffix_len: usize, value: &EntryValue) -> usize {
    let value_size = match value {
        EntryValue::Direct(bytes) => align4(bytes.len()),
        EntryValue::ValuePage(_) | EntryValue::KeyPage(_) => 4,
    };
    ENTRY_HEADER_SIZE + align4(suffix_len) + value_size
}

fn encoded_size(prefix_len: usize, contents: &PageContents) -> usize {
    entries_offset(prefix_len)
        + contents
            .iter()
            .map(|(key, value)| entry_size(key.len() - prefix_len, value))
            .sum::<usize>()
        + END_SENTINEL_SIZE
}

fn read_u16_at(data: &[u8], offset: usize) -> Result<u16> {
    let end = offset
        .checked_add(2)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| StoreError::Corruption("u16 read past end of page".into()))?;
    Ok(u16::from_le_bytes([data[offset], data[end - 1]]))
}

fn read_u32_at(data: &[u8], offset: usize) -> Result<u32> {
    let end = offset
        .checked_add(4)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| StoreError::Corruption("u32 read past end of page".into()))?;
    Ok(u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[end - 1],
    ]))
}

/// Common prefix and entry-region offset of a direct-key page.
fn read_prefix(data: &[u8]) -> Result<(&[u8], usize)> {
    let prefix_len = *data
        .get(PAGE_HEADER_SIZE)
        .ok_or_else(|| StoreError::Corruption("page truncated before prefix".into()))? as usize;
    let prefix_start = PAGE_HEADER_SIZE + 1;
    let entries = entries_offset(prefix_len);
    if entries > data.len() {
        return Err(StoreError::Corruption(
            "prefix and skip table exceed page size".into(),
        ));
    }
    Ok((&data[prefix_start..prefix_start + prefix_len], entries))
}

enum RawEntry<'a> {
    Sentinel,
    Item {
        suffix: &'a [u8],
        tag: u16,
        value_offset: usize,
        next: usize,
    },
}

fn read_entry_at(data: &[u8], offset: usize) -> Result<RawEntry<'_>> {
    let suffix_word = read_u16_at(data, offset)?;
    if suffix_word & END_SENTINEL != 0 {
        if suffix_word != END_SENTINEL {
            return Err(StoreError::Corruption(format!(
                "malformed end sentinel {suffix_word:#06x}"
            )));
        }
        return Ok(RawEntry::Sentinel);
    }
    let tag = read_u16_at(data, offset + 2)?;
    let suffix_len = suffix_word as usize;
    let suffix_start = offset + ENTRY_HEADER_SIZE;
    let value_offset = suffix_start + align4(suffix_len);
    let value_size = match tag {
        TAG_VALUE_PAGE | TAG_KEY_PAGE => 4,
        len if len & END_SENTINEL == 0 => align4(len as usize),
        other => {
            return Err(StoreError::Corruption(format!(
                "unknown entry value tag {other:#06x}"
            )))
        }
    };
    let next = value_offset + value_size;
    if next > data.len() {
        return Err(StoreError::Corruption(
            "entry extends past end of page".into(),
        ));
    }
    Ok(RawEntry::Item {
        suffix: &data[suffix_start..suffix_start + suffix_len],
        tag,
        value_offset,
        next,
    })
}

fn entry_value(data: &[u8], tag: u16, value_offset: usize) -> Result<EntryValue> {
    Ok(match tag {
        TAG_VALUE_PAGE => EntryValue::ValuePage(read_u32_at(data, value_offset)?),
        TAG_KEY_PAGE => EntryValue::KeyPage(read_u32_at(data, value_offset)?),
        len => EntryValue::Direct(data[value_offset..value_offset + len as usize].to_vec()),
    })
}

/// Looks up `key` inside one direct-key page.
///
/// The page's common prefix must match the front of the key, the remainder
/// is then located via the skip table and a bounded scan of the sorted
/// entries. A key-page entry whose suffix is a prefix of the remainder
/// (including an exact match) yields [`FindResult::Descend`].
pub fn find_in_page(data: &[u8], key: &[u8]) -> Result<FindResult> {
    let (kind, _count) = read_header(data)?;
    if kind != PageKind::DirectKey {
        return Err(StoreError::Corruption(
            "key lookup reached a non-key page".into(),
        ));
    }
    let (prefix, entries) = read_prefix(data)?;
    if key.len() < prefix.len() || &key[..prefix.len()] != prefix {
        return Ok(FindResult::Absent);
    }
    let rem = &key[prefix.len()..];

    // An empty-suffix entry sorts first. It is the only candidate for an
    // empty remainder, and as a key-page entry it continues every key.
    match read_entry_at(data, entries)? {
        RawEntry::Item {
            suffix,
            tag,
            value_offset,
            ..
        } if suffix.is_empty() => {
            if rem.is_empty() {
                return exact_result(data, tag, value_offset, key.len());
            }
            if tag == TAG_KEY_PAGE {
                return Ok(FindResult::Descend {
                    page: read_u32_at(data, value_offset)?,
                    matched: prefix.len(),
                });
            }
        }
        _ => {}
    }
    if rem.is_empty() {
        return Ok(FindResult::Absent);
    }

    let skip_base = entries - SKIP_TABLE_SIZE;
    let jump = read_u16_at(data, skip_base + rem[0] as usize * 2)? as usize;
    let mut cursor = entries + jump;
    loop {
        match read_entry_at(data, cursor)? {
            RawEntry::Sentinel => return Ok(FindResult::Absent),
            RawEntry::Item {
                suffix,
                tag,
                value_offset,
                next,
            } => {
                if suffix.len() <= rem.len() && rem[..suffix.len()] == *suffix {
                    if suffix.len() == rem.len() {
                        return exact_result(data, tag, value_offset, key.len());
                    }
                    if tag == TAG_KEY_PAGE {
                        return Ok(FindResult::Descend {
                            page: read_u32_at(data, value_offset)?,
                            matched: prefix.len() + suffix.len(),
                        });
                    }
                    // A literal whose suffix merely prefixes the remainder
                    // is not a match; longer suffixes may still follow.
                } else if suffix > rem {
                    // Entries are sorted; nothing past this point matches.
                    return Ok(FindResult::Absent);
                }
                cursor = next;
            }
        }
    }
}

fn exact_result(data: &[u8], tag: u16, value_offset: usize, key_len: usize) -> Result<FindResult> {
    Ok(match entry_value(data, tag, value_offset)? {
        EntryValue::Direct(bytes) => FindResult::Direct(bytes),
        EntryValue::ValuePage(page) => FindResult::ValuePage(page),
        EntryValue::KeyPage(page) => FindResult::Descend {
            page,
            matched: key_len,
        },
    })
}

/// Re-expands a direct-key page into its map form: the exact inverse of
/// [`compose_page`] for a single page. Child references stay references.
pub fn decompose_page(data: &[u8]) -> Result<PageContents> {
    let (kind, count) = read_header(data)?;
    if kind != PageKind::DirectKey {
        return Err(StoreError::Corruption(
            "decompose reached a non-key page".into(),
        ));
    }
    if count == 0 {
        return Err(StoreError::Corruption("page with zero entries".into()));
    }
    let (prefix, entries) = read_prefix(data)?;
    let mut contents = PageContents::new();
    let mut cursor = entries;
    let mut previous_suffix: Option<Vec<u8>> = None;
    for _ in 0..count {
        match read_entry_at(data, cursor)? {
            RawEntry::Sentinel => {
                return Err(StoreError::Corruption(
                    "entry count exceeds entries in page".into(),
                ))
            }
            RawEntry::Item {
                suffix,
                tag,
                value_offset,
                next,
            } => {
                if let Some(previous) = &previous_suffix {
                    if previous.as_slice() >= suffix {
                        return Err(StoreError::Corruption(
                            "page entries out of order".into(),
                        ));
                    }
                }
                previous_suffix = Some(suffix.to_vec());
                let mut key = Vec::with_capacity(prefix.len() + suffix.len());
                key.extend_from_slice(prefix);
                key.extend_from_slice(suffix);
                contents.insert(key, entry_value(data, tag, value_offset)?);
                cursor = next;
            }
        }
    }
    if !matches!(read_entry_at(data, cursor)?, RawEntry::Sentinel) {
        return Err(StoreError::Corruption(
            "page entries not terminated by sentinel".into(),
        ));
    }
    Ok(contents)
}

/// Serializes `contents` into one or more freshly allocated pages and
/// returns the page number of the top of the written hierarchy.
///
/// While the serialized form exceeds the page size, the next-key-byte group
/// consuming the most bytes is moved into a recursively composed child page
/// and replaced by a synthetic key-page entry, splitting the heaviest
/// branch first. Written pages are immediately handed to the pager's
/// write-back; nothing references them until the caller patches a parent.
pub fn compose_page(
    mut contents: PageContents,
    alloc: &PageAllocator,
    file: &PagedFile,
) -> Result<PageId> {
    if contents.is_empty() {
        return Err(StoreError::InvalidArgument(
            "cannot compose an empty page".into(),
        ));
    }

    let prefix = loop {
        let prefix = common_prefix(&contents);
        if encoded_size(prefix.len(), &contents) <= PAGE_SIZE {
            break prefix;
        }
        let branch = heaviest_branch(&contents, prefix.len()).ok_or(
            StoreError::UnsupportedFeature("page contents require out-of-line value storage"),
        )?;
        let mut branch_key = prefix.clone();
        branch_key.push(branch);
        let mut child = PageContents::new();
        let group: Vec<Vec<u8>> = contents
            .range(branch_key.clone()..)
            .take_while(|(key, _)| key.starts_with(&branch_key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in group {
            let value = contents.remove(&key).expect("grouped key present");
            child.insert(key[branch_key.len()..].to_vec(), value);
        }
        let child_page = compose_page(child, alloc, file)?;
        contents.insert(branch_key, EntryValue::KeyPage(child_page));
    };

    let mut buf = zeroed_page();
    write_header(&mut buf[..], PageKind::DirectKey, contents.len() as u32);
    buf[PAGE_HEADER_SIZE] = prefix.len() as u8;
    buf[PAGE_HEADER_SIZE + 1..PAGE_HEADER_SIZE + 1 + prefix.len()].copy_from_slice(&prefix);

    let entries = entries_offset(prefix.len());
    let mut first_at_byte = [None::<u16>; 256];
    let mut cursor = entries;
    for (key, value) in &contents {
        let suffix = &key[prefix.len()..];
        if let Some(&first) = suffix.first() {
            first_at_byte[first as usize].get_or_insert((cursor - entries) as u16);
        }
        let tag = match value {
            EntryValue::Direct(bytes) => bytes.len() as u16,
            EntryValue::ValuePage(_) => TAG_VALUE_PAGE,
            EntryValue::KeyPage(_) => TAG_KEY_PAGE,
        };
        buf[cursor..cursor + 2].copy_from_slice(&(suffix.len() as u16).to_le_bytes());
        buf[cursor + 2..cursor + 4].copy_from_slice(&tag.to_le_bytes());
        let suffix_start = cursor + ENTRY_HEADER_SIZE;
        buf[suffix_start..suffix_start + suffix.len()].copy_from_slice(suffix);
        let value_offset = suffix_start + align4(suffix.len());
        cursor = match value {
            EntryValue::Direct(bytes) => {
                buf[value_offset..value_offset + bytes.len()].copy_from_slice(bytes);
                value_offset + align4(bytes.len())
            }
            EntryValue::ValuePage(page) | EntryValue::KeyPage(page) => {
                buf[value_offset..value_offset + 4].copy_from_slice(&page.to_le_bytes());
                value_offset + 4
            }
        };
    }
    buf[cursor..cursor + 2].copy_from_slice(&END_SENTINEL.to_le_bytes());

    // skip[b] points at the first entry whose suffix starts at or after b;
    // bytes with no entries inherit the next occupied slot, or the sentinel.
    let skip_base = entries - SKIP_TABLE_SIZE;
    let mut carry = (cursor - entries) as u16;
    for byte in (0..256).rev() {
        if let Some(first) = first_at_byte[byte] {
            carry = first;
        }
        buf[skip_base + byte * 2..skip_base + byte * 2 + 2].copy_from_slice(&carry.to_le_bytes());
    }

    let page = alloc.allocate()?;
    file.write_page(page, &buf[..])?;
    file.write_out(page)?;
    trace!(page, entries = contents.len(), "composed page");
    Ok(page)
}

/// Rewrites the single key-page entry pointing at `old` to point at `new`.
/// This is the only in-place page mutation the engine performs; it spares a
/// full recompose when only a downstream pointer changed.
pub fn replace_child_pointer(data: &mut [u8], old: PageId, new: PageId) -> Result<()> {
    let (kind, _) = read_header(data)?;
    if kind != PageKind::DirectKey {
        return Err(StoreError::Corruption(
            "pointer patch reached a non-key page".into(),
        ));
    }
    let (_, entries) = read_prefix(data)?;
    let mut cursor = entries;
    loop {
        match read_entry_at(data, cursor)? {
            RawEntry::Sentinel => {
                return Err(StoreError::Corruption(format!(
                    "no child pointer to page {old} found"
                )))
            }
            RawEntry::Item {
                tag,
                value_offset,
                next,
                ..
            } => {
                if tag == TAG_KEY_PAGE && read_u32_at(data, value_offset)? == old {
                    data[value_offset..value_offset + 4].copy_from_slice(&new.to_le_bytes());
                    return Ok(());
                }
                cursor = next;
            }
        }
    }
}

/// Longest shared prefix of every key, capped at what the format can carry.
fn common_prefix(contents: &PageContents) -> Vec<u8> {
    let first = contents.keys().next().expect("contents not empty");
    let last = contents.keys().next_back().expect("contents not empty");
    // In a sorted map the first and last keys bound the shared prefix.
    let len = first
        .iter()
        .zip(last.iter())
        .take_while(|(a, b)| a == b)
        .count()
        .min(MAX_PREFIX_LEN);
    first[..len].to_vec()
}

/// Picks the next-key-byte whose entries collectively consume the most
/// bytes, provided moving them out actually shrinks the page.
fn heaviest_branch(contents: &PageContents, prefix_len: usize) -> Option<u8> {
    let mut weights = [0usize; 256];
    for (key, value) in contents {
        if key.len() > prefix_len {
            weights[key[prefix_len] as usize] += entry_size(key.len() - prefix_len, value);
        }
    }
    let (byte, weight) = weights
        .iter()
        .enumerate()
        .max_by_key(|(_, &weight)| weight)?;
    (*weight > SYNTHETIC_ENTRY_SIZE).then_some(byte as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn codec_env() -> (PageAllocator, Arc<PagedFile>) {
        let file = Arc::new(PagedFile::open(None, 64).expect("open"));
        let alloc = PageAllocator::new(Arc::clone(&file));
        alloc.format().expect("format");
        (alloc, file)
    }

    fn direct(bytes: &[u8]) -> EntryValue {
        EntryValue::Direct(bytes.to_vec())
    }

    /// Recursively expands a page hierarchy back into one flat map.
    fn expand(file: &PagedFile, page: PageId, consumed: &[u8]) -> PageContents {
        let data = file.read_page(page).expect("read");
        let mut flat = PageContents::new();
        for (key, value) in decompose_page(&data[..]).expect("decompose") {
            let mut full = consumed.to_vec();
            full.extend_from_slice(&key);
            match value {
                EntryValue::KeyPage(child) => {
                    flat.extend(expand(file, child, &full));
                }
                other => {
                    flat.insert(full, other);
                }
            }
        }
        flat
    }

    #[test]
    fn single_page_roundtrip() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"apple".to_vec(), direct(b"red"));
        contents.insert(b"apricot".to_vec(), direct(b"orange"));
        contents.insert(b"banana".to_vec(), direct(b"yellow"));
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(decompose_page(&data[..]).expect("decompose"), contents);
    }

    #[test]
    fn find_exact_and_absent() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"foo".to_vec(), direct(b"bar"));
        contents.insert(b"fob".to_vec(), direct(b"oar"));
        contents.insert(b"for".to_vec(), direct(b"oab"));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(
            find_in_page(&data[..], b"foo").expect("find"),
            FindResult::Direct(b"bar".to_vec())
        );
        assert_eq!(
            find_in_page(&data[..], b"fob").expect("find"),
            FindResult::Direct(b"oar".to_vec())
        );
        assert_eq!(find_in_page(&data[..], b"fox").expect("find"), FindResult::Absent);
        assert_eq!(find_in_page(&data[..], b"fo").expect("find"), FindResult::Absent);
        assert_eq!(
            find_in_page(&data[..], b"food").expect("find"),
            FindResult::Absent
        );
        assert_eq!(find_in_page(&data[..], b"g").expect("find"), FindResult::Absent);
    }

    #[test]
    fn find_jumps_across_first_bytes() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        for byte in (0..=255u8).step_by(5) {
            contents.insert(vec![byte, byte], direct(&[byte]));
        }
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        for (key, value) in &contents {
            assert_eq!(
                find_in_page(&data[..], key).expect("find"),
                FindResult::Direct(match value {
                    EntryValue::Direct(bytes) => bytes.clone(),
                    _ => unreachable!(),
                })
            );
        }
        assert_eq!(
            find_in_page(&data[..], &[3u8, 3]).expect("find"),
            FindResult::Absent
        );
    }

    #[test]
    fn empty_key_and_empty_value() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(Vec::new(), direct(b""));
        contents.insert(b"a".to_vec(), direct(b"1"));
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(
            find_in_page(&data[..], b"").expect("find"),
            FindResult::Direct(Vec::new())
        );
        assert_eq!(decompose_page(&data[..]).expect("decompose"), contents);
    }

    #[test]
    fn empty_suffix_key_page_continues_every_key() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"ab".to_vec(), EntryValue::KeyPage(42));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        // The single key becomes the page prefix; the entry suffix is empty.
        assert_eq!(
            find_in_page(&data[..], b"abxyz").expect("find"),
            FindResult::Descend {
                page: 42,
                matched: 2
            }
        );
        assert_eq!(
            find_in_page(&data[..], b"ab").expect("find"),
            FindResult::Descend {
                page: 42,
                matched: 2
            }
        );
        assert_eq!(find_in_page(&data[..], b"ax").expect("find"), FindResult::Absent);
    }

    #[test]
    fn key_page_entry_matches_by_prefix() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"ca".to_vec(), EntryValue::KeyPage(7));
        contents.insert(b"cb".to_vec(), direct(b"x"));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(
            find_in_page(&data[..], b"cart").expect("find"),
            FindResult::Descend {
                page: 7,
                matched: 2
            }
        );
        assert_eq!(
            find_in_page(&data[..], b"cb").expect("find"),
            FindResult::Direct(b"x".to_vec())
        );
    }

    #[test]
    fn literal_prefix_entry_does_not_shadow_longer_key() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"do".to_vec(), direct(b"short"));
        contents.insert(b"dog".to_vec(), direct(b"long"));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(
            find_in_page(&data[..], b"dog").expect("find"),
            FindResult::Direct(b"long".to_vec())
        );
        assert_eq!(
            find_in_page(&data[..], b"do").expect("find"),
            FindResult::Direct(b"short".to_vec())
        );
    }

    #[test]
    fn oversized_contents_split_and_expand_back() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        for i in 0..300u32 {
            let key = format!("user/{i:04}/profile").into_bytes();
            let value = vec![b'v'; 40];
            contents.insert(key, EntryValue::Direct(value));
        }
        assert!(encoded_size(0, &contents) > PAGE_SIZE);
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        let top = decompose_page(&data[..]).expect("decompose");
        assert!(
            top.values()
                .any(|value| matches!(value, EntryValue::KeyPage(_))),
            "split must introduce child pages"
        );
        assert_eq!(expand(&file, page, b""), contents);
    }

    #[test]
    fn split_pages_stay_reachable_through_find() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        for i in 0..300u32 {
            contents.insert(
                format!("k{i:05}").into_bytes(),
                EntryValue::Direct(format!("value-{i}").into_bytes()),
            );
        }
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        for (key, value) in &contents {
            let mut current = page;
            let mut consumed = 0usize;
            let found = loop {
                let data = file.read_page(current).expect("read");
                match find_in_page(&data[..], &key[consumed..]).expect("find") {
                    FindResult::Descend { page, matched } => {
                        current = page;
                        consumed += matched;
                    }
                    other => break other,
                }
            };
            let EntryValue::Direct(expected) = value else {
                unreachable!()
            };
            assert_eq!(found, FindResult::Direct(expected.clone()), "key {key:?}");
        }
    }

    #[test]
    fn long_shared_prefix_is_capped() {
        let (alloc, file) = codec_env();
        let long = vec![b'p'; 300];
        let mut key_a = long.clone();
        key_a.push(b'a');
        let mut key_b = long.clone();
        key_b.push(b'b');
        let mut contents = PageContents::new();
        contents.insert(key_a.clone(), direct(b"1"));
        contents.insert(key_b.clone(), direct(b"2"));
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(decompose_page(&data[..]).expect("decompose"), contents);
        assert_eq!(
            find_in_page(&data[..], &key_a).expect("find"),
            FindResult::Direct(b"1".to_vec())
        );
    }

    #[test]
    fn replace_child_pointer_patches_in_place() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"left".to_vec(), EntryValue::KeyPage(11));
        contents.insert(b"right".to_vec(), EntryValue::KeyPage(22));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let mut data = file.read_page(page).expect("read");
        replace_child_pointer(&mut data[..], 22, 33).expect("patch");
        let patched = decompose_page(&data[..]).expect("decompose");
        assert_eq!(patched[&b"left".to_vec()], EntryValue::KeyPage(11));
        assert_eq!(patched[&b"right".to_vec()], EntryValue::KeyPage(33));
        let err = replace_child_pointer(&mut data[..], 99, 100).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn value_page_tag_survives_roundtrip() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"big".to_vec(), EntryValue::ValuePage(77));
        contents.insert(b"small".to_vec(), direct(b"x"));
        let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
        let data = file.read_page(page).expect("read");
        assert_eq!(decompose_page(&data[..]).expect("decompose"), contents);
        assert_eq!(
            find_in_page(&data[..], b"big").expect("find"),
            FindResult::ValuePage(77)
        );
    }

    #[test]
    fn corrupt_sentinel_is_detected() {
        let (alloc, file) = codec_env();
        let mut contents = PageContents::new();
        contents.insert(b"k".to_vec(), direct(b"v"));
        let page = compose_page(contents, &alloc, &file).expect("compose");
        let mut data = file.read_page(page).expect("read");
        // Claim a second entry that is not there.
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            decompose_page(&data[..]),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn empty_contents_are_rejected() {
        let (alloc, file) = codec_env();
        assert!(matches!(
            compose_page(PageContents::new(), &alloc, &file),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    mod props {
        use super::*;
        use proptest::collection::btree_map;
        use proptest::prelude::*;

        fn arb_contents() -> impl Strategy<Value = PageContents> {
            btree_map(
                proptest::collection::vec(any::<u8>(), 0..24),
                proptest::collection::vec(any::<u8>(), 0..64).prop_map(EntryValue::Direct),
                1..120,
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn decompose_inverts_compose(contents in arb_contents()) {
                let (alloc, file) = codec_env();
                let page = compose_page(contents.clone(), &alloc, &file).expect("compose");
                prop_assert_eq!(expand(&file, page, b""), contents);
            }
        }
    }
}
