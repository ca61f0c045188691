//! The public storage engine: a persistent byte-string→byte-string map.
//!
//! [`KeyStorage`] orchestrates the pager, the free-page allocator, the page
//! locks, and the direct-key page codec into store/fetch/delete over a
//! hierarchy of prefix-compressed pages. All mutations are copy-on-write:
//! a changed page is recomposed into freshly allocated pages, the single
//! incoming pointer is patched, and only then is the superseded page freed.
//! Readers therefore always observe stable page bytes under their page
//! locks.
//!
//! # Example
//!
//! ```rust
//! use burrowkv::KeyStorage;
//!
//! let store = KeyStorage::open_in_memory()?;
//! store.store(b"greeting", b"hello")?;
//! assert_eq!(store.fetch(b"greeting")?, b"hello");
//! store.delete(b"greeting")?;
//! assert!(store.fetch(b"greeting").is_err());
//! # Ok::<(), burrowkv::StoreError>(())
//! ```
//!
//! # Thread Safety
//!
//! Every operation takes `&self`; worker threads share one instance
//! directly. Operations on disjoint page subtrees proceed concurrently,
//! overlapping operations serialize per page through the lock chains.

use std::convert::TryInto;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::StoreOptions;
use crate::error::{Result, StoreError};
use crate::locking::{DeleteLockChain, PageLockTable, ReadLockChain, WriteLockChain};
use crate::page::direct::{
    compose_page, decompose_page, find_in_page, replace_child_pointer, FindResult, MAX_VALUE_LEN,
};
use crate::page::{read_header, EntryValue, PageContents};
use crate::pager::allocator::PageAllocator;
use crate::pager::{PageId, PagedFile};

const SUPER_PAGE: PageId = 0;
const SUPER_MAGIC: u32 = u32::from_le_bytes(*b"bkv1");
const FORMAT_VERSION: u32 = 1;

/// Longest key the engine accepts. Bounds the depth a degenerate key chain
/// can reach while splitting.
pub const MAX_KEY_LEN: usize = 4096;

/// Contents of the super page (page 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuperPage {
    /// Page number of the root data page; 0 means the store is empty.
    root: PageId,
    /// Set while the store is open; still set on reopen after a crash.
    dirty: bool,
}

impl SuperPage {
    /// Decodes the super page. Returns `None` for an all-zero (fresh) page.
    fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 16 {
            return Err(StoreError::Corruption(
                "super page shorter than expected".into(),
            ));
        }
        if data[..4].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes"));
        if magic != SUPER_MAGIC {
            return Err(StoreError::Corruption(
                "not a recognized store file".into(),
            ));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));
        if version != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported format version {version} (expected {FORMAT_VERSION})"
            )));
        }
        let root = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));
        let dirty = u32::from_le_bytes(data[12..16].try_into().expect("4 bytes")) != 0;
        Ok(Some(Self { root, dirty }))
    }

    fn write(&self, data: &mut [u8]) {
        data[0..4].copy_from_slice(&SUPER_MAGIC.to_le_bytes());
        data[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        data[8..12].copy_from_slice(&self.root.to_le_bytes());
        data[12..16].copy_from_slice(&(self.dirty as u32).to_le_bytes());
    }
}

/// Embedded page-oriented key/value store.
pub struct KeyStorage {
    file: Arc<PagedFile>,
    alloc: PageAllocator,
    locks: PageLockTable,
    closed: bool,
}

impl KeyStorage {
    /// Opens a store described by `options`, formatting a fresh super page
    /// or validating an existing one.
    ///
    /// # Errors
    /// * `StoreError::Io` - the file cannot be created, mapped, or grown
    /// * `StoreError::Corruption` - the file exists but is not a store
    ///   produced by this format version
    /// * `StoreError::InvalidArgument` - another instance holds the file
    pub fn open(options: StoreOptions) -> Result<Self> {
        let file = Arc::new(PagedFile::open(
            options.path.as_deref(),
            options.grow_chunk_pages,
        )?);
        let alloc = PageAllocator::new(Arc::clone(&file));
        let store = Self {
            file,
            alloc,
            locks: PageLockTable::new(options.lock_poll_interval),
            closed: false,
        };
        store.initialise_file()?;
        Ok(store)
    }

    /// Opens an anonymous in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreOptions::in_memory())
    }

    /// Formats a fresh super page or validates an existing one. Runs during
    /// open, before the store is shared with any other thread.
    fn initialise_file(&self) -> Result<()> {
        let mut data = self.file.read_page(SUPER_PAGE)?;
        match SuperPage::read(&data[..])? {
            None => {
                self.alloc.format()?;
                SuperPage {
                    root: 0,
                    dirty: true,
                }
                .write(&mut data[..]);
                self.file.write_page(SUPER_PAGE, &data[..])?;
                self.file.write_out(SUPER_PAGE)?;
                debug!("formatted fresh store");
            }
            Some(existing) => {
                if existing.dirty {
                    warn!("store was not shut down cleanly");
                }
                SuperPage {
                    root: existing.root,
                    dirty: true,
                }
                .write(&mut data[..]);
                self.file.write_page(SUPER_PAGE, &data[..])?;
                self.file.write_out(SUPER_PAGE)?;
                debug!(root = existing.root, "opened existing store");
            }
        }
        Ok(())
    }

    /// Reads the super page. The caller must hold a lock on page 0.
    fn read_super(&self) -> Result<SuperPage> {
        let data = self.file.read_page(SUPER_PAGE)?;
        SuperPage::read(&data[..])?
            .ok_or_else(|| StoreError::Corruption("store not initialised".into()))
    }

    /// Rewrites the super page with a new root. The caller must hold a
    /// write lock on page 0.
    fn write_root(&self, root: PageId) -> Result<()> {
        let mut data = self.file.read_page(SUPER_PAGE)?;
        let existing = SuperPage::read(&data[..])?
            .ok_or_else(|| StoreError::Corruption("store not initialised".into()))?;
        SuperPage {
            root,
            dirty: existing.dirty,
        }
        .write(&mut data[..]);
        self.file.write_page(SUPER_PAGE, &data[..])?;
        self.file.write_out(SUPER_PAGE)
    }

    /// Looks up `key` and returns its value.
    ///
    /// # Errors
    /// * `StoreError::NotFound` - the key is not present
    /// * `StoreError::UnsupportedFeature` - the key resolves to an
    ///   out-of-line value page
    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut chain = ReadLockChain::new(&self.locks);
        chain.add(SUPER_PAGE);
        let super_page = self.read_super()?;
        if super_page.root == 0 {
            return Err(StoreError::NotFound);
        }
        let mut page = super_page.root;
        let mut consumed = 0usize;
        loop {
            chain.add(page);
            let data = self.file.read_page(page)?;
            match find_in_page(&data[..], &key[consumed..])? {
                FindResult::Direct(value) => return Ok(value),
                FindResult::ValuePage(_) => {
                    return Err(StoreError::UnsupportedFeature(
                        "out-of-line value pages are not implemented",
                    ))
                }
                FindResult::Descend { page: child, matched } => {
                    consumed += matched;
                    page = child;
                }
                FindResult::Absent => return Err(StoreError::NotFound),
            }
        }
    }

    /// Inserts or replaces `key` with `value`.
    ///
    /// # Errors
    /// * `StoreError::InvalidArgument` - the key exceeds [`MAX_KEY_LEN`]
    /// * `StoreError::UnsupportedFeature` - the value cannot be stored
    ///   inline (value pages are reserved but not implemented)
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "key length {} exceeds maximum {MAX_KEY_LEN}",
                key.len()
            )));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::UnsupportedFeature(
                "value exceeds inline page capacity",
            ));
        }

        let mut chain = WriteLockChain::new(&self.locks);
        chain.add(SUPER_PAGE);
        let super_page = self.read_super()?;

        if super_page.root == 0 {
            let mut contents = PageContents::new();
            contents.insert(key.to_vec(), EntryValue::Direct(value.to_vec()));
            let root = compose_page(contents, &self.alloc, &self.file)?;
            self.write_root(root)?;
            trace!(root, "stored first key");
            return Ok(());
        }

        let mut page = super_page.root;
        let mut consumed = 0usize;
        let landed = loop {
            chain.add(page);
            let data = self.file.read_page(page)?;
            match find_in_page(&data[..], &key[consumed..])? {
                FindResult::Descend { page: child, matched } => {
                    consumed += matched;
                    page = child;
                }
                FindResult::ValuePage(_) => {
                    return Err(StoreError::UnsupportedFeature(
                        "out-of-line value pages are not implemented",
                    ))
                }
                FindResult::Direct(_) | FindResult::Absent => break data,
            }
        };

        let mut contents = decompose_page(&landed[..])?;
        contents.insert(key[consumed..].to_vec(), EntryValue::Direct(value.to_vec()));
        let replacement = compose_page(contents, &self.alloc, &self.file)?;

        let parent = chain.parent().expect("write chain holds the parent");
        if parent == SUPER_PAGE {
            self.write_root(replacement)?;
        } else {
            let mut parent_data = self.file.read_page(parent)?;
            replace_child_pointer(&mut parent_data[..], page, replacement)?;
            self.file.write_page(parent, &parent_data[..])?;
            self.file.write_out(parent)?;
        }
        self.alloc.free(page)?;
        trace!(old = page, new = replacement, "stored key");
        Ok(())
    }

    /// Removes `key` from the store.
    ///
    /// # Errors
    /// * `StoreError::NotFound` - the key is not present
    /// * `StoreError::UnsupportedFeature` - the key resolves to an
    ///   out-of-line value page
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut chain = DeleteLockChain::new(&self.locks);
        chain.add(SUPER_PAGE);
        let super_page = self.read_super()?;
        if super_page.root == 0 {
            return Err(StoreError::NotFound);
        }

        let mut page = super_page.root;
        let mut consumed = 0usize;
        let landed = loop {
            chain.add(page);
            let data = self.file.read_page(page)?;
            let (_, count) = read_header(&data[..])?;
            if count > 1 {
                // Removing one key can no longer empty anything above here.
                chain.release_settled_ancestors();
            }
            match find_in_page(&data[..], &key[consumed..])? {
                FindResult::Descend { page: child, matched } => {
                    consumed += matched;
                    page = child;
                }
                FindResult::ValuePage(_) => {
                    return Err(StoreError::UnsupportedFeature(
                        "out-of-line value pages are not implemented",
                    ))
                }
                FindResult::Direct(_) => break data,
                FindResult::Absent => return Err(StoreError::NotFound),
            }
        };

        let held = chain.held().to_vec();
        let (_, landed_count) = read_header(&landed[..])?;

        if landed_count > 1 {
            // The landed page survives with the key removed.
            let mut contents = decompose_page(&landed[..])?;
            contents
                .remove(&key[consumed..].to_vec())
                .ok_or_else(|| StoreError::Corruption("found key vanished from page".into()))?;
            let replacement = compose_page(contents, &self.alloc, &self.file)?;
            self.patch_parent(held[held.len() - 2], page, replacement)?;
            self.alloc.free(page)?;
            trace!(old = page, new = replacement, "deleted key");
            return Ok(());
        }

        // The landed page holds only the deleted key. Free it and every
        // single-entry ancestor whose sole entry led here, then detach the
        // chain from the first surviving page.
        let mut index = held.len() - 1;
        loop {
            let current = held[index];
            if current == SUPER_PAGE {
                // Every data page on the path emptied out.
                self.write_root(0)?;
                trace!("deleted last key; store is empty");
                return Ok(());
            }
            let data = self.file.read_page(current)?;
            let (_, count) = read_header(&data[..])?;
            if index == held.len() - 1 || count == 1 {
                self.alloc.free(current)?;
                index -= 1;
                continue;
            }

            // `current` keeps other entries; drop its reference to the
            // freed child and recompose.
            let freed_child = held[index + 1];
            let mut contents = decompose_page(&data[..])?;
            let child_key = contents
                .iter()
                .find_map(|(key, value)| match value {
                    EntryValue::KeyPage(target) if *target == freed_child => Some(key.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "page {current} holds no reference to freed child {freed_child}"
                    ))
                })?;
            contents.remove(&child_key);
            let replacement = compose_page(contents, &self.alloc, &self.file)?;
            self.patch_parent(held[index - 1], current, replacement)?;
            self.alloc.free(current)?;
            trace!(old = current, new = replacement, "deleted key and pruned subtree");
            return Ok(());
        }
    }

    /// Repoints the single reference to `old` so it leads to `new`. The
    /// caller must hold a write lock on `parent`.
    fn patch_parent(&self, parent: PageId, old: PageId, new: PageId) -> Result<()> {
        if parent == SUPER_PAGE {
            return self.write_root(new);
        }
        let mut data = self.file.read_page(parent)?;
        replace_child_pointer(&mut data[..], old, new)?;
        self.file.write_page(parent, &data[..])?;
        self.file.write_out(parent)
    }

    /// Writes a recursive diagnostic rendering of the store into `out`.
    /// Debug aid only; not part of the durability contract.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> Result<()> {
        let mut chain = ReadLockChain::new(&self.locks);
        chain.add(SUPER_PAGE);
        let super_page = self.read_super()?;
        writeln!(out, "root page: {}", super_page.root).map_err(fmt_error)?;
        if super_page.root != 0 {
            self.dump_page(super_page.root, &[], 1, out)?;
        }
        Ok(())
    }

    fn dump_page(
        &self,
        page: PageId,
        consumed: &[u8],
        depth: usize,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        // One chain per level holds this page while children are visited;
        // acquisition stays strictly top-down.
        let mut chain = ReadLockChain::new(&self.locks);
        chain.add(page);
        let data = self.file.read_page(page)?;
        let indent = "  ".repeat(depth);
        for (key, value) in decompose_page(&data[..])? {
            let mut full = consumed.to_vec();
            full.extend_from_slice(&key);
            match value {
                EntryValue::Direct(bytes) => {
                    writeln!(
                        out,
                        "{indent}{} = {} ({} bytes)",
                        full.escape_ascii(),
                        bytes.escape_ascii(),
                        bytes.len()
                    )
                    .map_err(fmt_error)?;
                }
                EntryValue::ValuePage(target) => {
                    writeln!(out, "{indent}{} -> value page {target}", full.escape_ascii())
                        .map_err(fmt_error)?;
                }
                EntryValue::KeyPage(target) => {
                    writeln!(out, "{indent}{} -> key page {target}", full.escape_ascii())
                        .map_err(fmt_error)?;
                    self.dump_page(target, &full, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }

    /// Clears the dirty-shutdown marker and flushes everything to disk.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut data = self.file.read_page(SUPER_PAGE)?;
        if let Some(super_page) = SuperPage::read(&data[..])? {
            SuperPage {
                root: super_page.root,
                dirty: false,
            }
            .write(&mut data[..]);
            self.file.write_page(SUPER_PAGE, &data[..])?;
        }
        self.file.sync()?;
        debug!("closed store");
        Ok(())
    }
}

impl Drop for KeyStorage {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(%error, "failed to flush store on drop");
        }
    }
}

fn fmt_error(_: fmt::Error) -> StoreError {
    StoreError::InvalidArgument("dump formatter failed".into())
}
