//! Page-addressable byte store backed by a growable file.
//!
//! The store file is mapped in fixed-size chunks that are never remapped or
//! moved once created; growth appends a new chunk mapping after extending
//! the file. Page accessors copy bytes in and out of the mappings and hand
//! callers owned buffers, so no reference into mapped memory ever escapes
//! this module.
//!
//! Without a path the store is backed by anonymous memory and disappears on
//! close; tests and pure in-memory instances use that mode.
//!
//! # Thread Safety
//!
//! [`PagedFile`] takes `&self` everywhere. The chunk table is guarded by a
//! read/write lock so growth excludes access, while reads and writes of
//! distinct pages proceed concurrently. Callers serialize access to any one
//! page (the engine's page-lock table does this); the pager itself does not
//! arbitrate per-page races.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};

pub mod allocator;

/// Size of one page in bytes: the unit of I/O, locking, and allocation.
pub const PAGE_SIZE: usize = 4096;

/// Page number addressing one page inside the store.
pub type PageId = u32;

/// Owned copy of one page's bytes.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// Returns a zero-filled page buffer.
pub fn zeroed_page() -> PageBuf {
    Box::new([0u8; PAGE_SIZE])
}

#[derive(Debug)]
struct ChunkTable {
    file: Option<File>,
    maps: Vec<MmapRaw>,
    page_limit: u32,
}

/// Growable page store over a memory-mapped file or anonymous memory.
#[derive(Debug)]
pub struct PagedFile {
    inner: RwLock<ChunkTable>,
    chunk_pages: u32,
}

impl PagedFile {
    /// Opens a page store at `path`, creating the file if needed, or an
    /// anonymous in-memory store when `path` is `None`.
    ///
    /// The file is locked exclusively for the lifetime of this instance;
    /// a second open of the same file fails with `InvalidArgument`.
    pub fn open(path: Option<&Path>, chunk_pages: u32) -> Result<Self> {
        if chunk_pages == 0 {
            return Err(StoreError::InvalidArgument(
                "growth chunk must be at least one page".into(),
            ));
        }
        let chunk_bytes = chunk_pages as u64 * PAGE_SIZE as u64;
        let inner = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                file.try_lock_exclusive().map_err(|_| {
                    StoreError::InvalidArgument(format!(
                        "store file {} is locked by another instance",
                        path.display()
                    ))
                })?;

                let len = file.metadata()?.len();
                let aligned = len.div_ceil(chunk_bytes) * chunk_bytes;
                if aligned > len {
                    file.set_len(aligned)?;
                }
                let chunk_count = aligned / chunk_bytes;
                let mut maps = Vec::with_capacity(chunk_count as usize);
                for chunk in 0..chunk_count {
                    maps.push(map_file_chunk(&file, chunk * chunk_bytes, chunk_bytes)?);
                }
                debug!(
                    path = %path.display(),
                    pages = chunk_count as u32 * chunk_pages,
                    "opened page store"
                );
                ChunkTable {
                    file: Some(file),
                    page_limit: chunk_count as u32 * chunk_pages,
                    maps,
                }
            }
            None => {
                debug!("opened anonymous page store");
                ChunkTable {
                    file: None,
                    maps: Vec::new(),
                    page_limit: 0,
                }
            }
        };
        Ok(Self {
            inner: RwLock::new(inner),
            chunk_pages,
        })
    }

    /// Number of pages currently addressable without growing.
    pub fn page_limit(&self) -> u32 {
        self.inner.read().page_limit
    }

    /// Whether this store has a backing file.
    pub fn is_persistent(&self) -> bool {
        self.inner.read().file.is_some()
    }

    /// Reads one page into an owned buffer, growing the store if `page`
    /// lies beyond the current extent (new pages read as zeroes).
    pub fn read_page(&self, page: PageId) -> Result<PageBuf> {
        self.ensure_page(page)?;
        let inner = self.inner.read();
        let mut buf = zeroed_page();
        let src = chunk_ptr(&inner, self.chunk_pages, page);
        // The mapping stays alive and in place while `inner` is borrowed;
        // callers keep concurrent writers off this page.
        unsafe {
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), PAGE_SIZE);
        }
        Ok(buf)
    }

    /// Writes one full page, growing the store if needed.
    pub fn write_page(&self, page: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "page write must be exactly {PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        self.ensure_page(page)?;
        let inner = self.inner.read();
        let dst = chunk_ptr(&inner, self.chunk_pages, page);
        // Same aliasing contract as `read_page`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, PAGE_SIZE);
        }
        trace!(page, "wrote page");
        Ok(())
    }

    /// Asks the OS to schedule write-back of one page. Non-blocking hint;
    /// durability comes from [`PagedFile::sync`].
    pub fn write_out(&self, page: PageId) -> Result<()> {
        let inner = self.inner.read();
        if inner.file.is_none() || page >= inner.page_limit {
            return Ok(());
        }
        let chunk = (page / self.chunk_pages) as usize;
        let offset = (page % self.chunk_pages) as usize * PAGE_SIZE;
        inner.maps[chunk].flush_async_range(offset, PAGE_SIZE)?;
        Ok(())
    }

    /// Flushes every mapped chunk and the file metadata to disk.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(file) = &inner.file {
            for map in &inner.maps {
                map.flush()?;
            }
            file.sync_all()?;
        }
        Ok(())
    }

    fn ensure_page(&self, page: PageId) -> Result<()> {
        if page < self.inner.read().page_limit {
            return Ok(());
        }
        let mut inner = self.inner.write();
        while page >= inner.page_limit {
            let chunk = inner.maps.len() as u64;
            let chunk_bytes = self.chunk_pages as u64 * PAGE_SIZE as u64;
            let map = match &inner.file {
                Some(file) => {
                    file.set_len((chunk + 1) * chunk_bytes)?;
                    map_file_chunk(file, chunk * chunk_bytes, chunk_bytes)?
                }
                None => MmapRaw::from(MmapOptions::new().len(chunk_bytes as usize).map_anon()?),
            };
            inner.maps.push(map);
            inner.page_limit = inner
                .page_limit
                .checked_add(self.chunk_pages)
                .ok_or_else(|| {
                    StoreError::InvalidArgument("store exceeds addressable page range".into())
                })?;
            debug!(pages = inner.page_limit, "grew page store");
        }
        Ok(())
    }
}

fn map_file_chunk(file: &File, offset: u64, len: u64) -> Result<MmapRaw> {
    Ok(MmapOptions::new()
        .offset(offset)
        .len(len as usize)
        .map_raw(file)?)
}

fn chunk_ptr(inner: &ChunkTable, chunk_pages: u32, page: PageId) -> *mut u8 {
    let chunk = (page / chunk_pages) as usize;
    let offset = (page % chunk_pages) as usize * PAGE_SIZE;
    // In bounds: ensure_page extended the table past `page` already.
    unsafe { inner.maps[chunk].as_mut_ptr().add(offset) }
}
