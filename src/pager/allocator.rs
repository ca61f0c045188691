//! Bitmap free-page allocator.
//!
//! Free/used state is one bit per page, kept in bitmap pages inside the
//! store itself: page 1 governs pages 0..32767, and every further region of
//! 32768 pages keeps its bitmap at the same offset within the region. The
//! super page (0) and each bitmap page are pre-marked used and never handed
//! out.
//!
//! Freed pages are immediately reusable. That is safe because the engine
//! only frees a page after its sole incoming reference has been repointed,
//! so no traversal can still reach it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::pager::{PageId, PagedFile, PAGE_SIZE};

/// Pages governed by one bitmap page: one bit per byte position times eight.
pub const PAGES_PER_BITMAP: u32 = (PAGE_SIZE * 8) as u32;

/// Offset of the bitmap page inside its region.
const BITMAP_SLOT: u32 = 1;

/// Bitmap-based free-page allocator over a [`PagedFile`].
pub struct PageAllocator {
    file: Arc<PagedFile>,
    // Serializes bitmap read-modify-write cycles.
    scan: Mutex<()>,
}

impl PageAllocator {
    pub fn new(file: Arc<PagedFile>) -> Self {
        Self {
            file,
            scan: Mutex::new(()),
        }
    }

    /// Formats the first bitmap region of a fresh store: pages 0 (super
    /// page) and 1 (this bitmap) are marked used.
    pub fn format(&self) -> Result<()> {
        let _guard = self.scan.lock();
        let mut bitmap = crate::pager::zeroed_page();
        bitmap[0] = 0b0000_0011;
        self.file.write_page(BITMAP_SLOT, &bitmap[..])?;
        self.file.write_out(BITMAP_SLOT)?;
        Ok(())
    }

    /// Allocates a free page, extending into a new bitmap region when every
    /// existing region is full.
    pub fn allocate(&self) -> Result<PageId> {
        let _guard = self.scan.lock();
        for region in 0..(u32::MAX / PAGES_PER_BITMAP) {
            let bitmap_page = region * PAGES_PER_BITMAP + BITMAP_SLOT;
            let fresh_region = bitmap_page >= self.file.page_limit();
            let mut bitmap = self.file.read_page(bitmap_page)?;
            if fresh_region && region > 0 {
                // A region's bitmap page occupies the region itself.
                set_bit(&mut bitmap, BITMAP_SLOT);
                debug!(region, "opened new bitmap region");
            }
            if let Some(bit) = first_zero_bit(&bitmap) {
                set_bit(&mut bitmap, bit);
                self.file.write_page(bitmap_page, &bitmap[..])?;
                self.file.write_out(bitmap_page)?;
                let page = region * PAGES_PER_BITMAP + bit;
                trace!(page, "allocated page");
                return Ok(page);
            }
        }
        Err(StoreError::InvalidArgument(
            "no free pages in addressable range".into(),
        ))
    }

    /// Returns a page to the free pool.
    pub fn free(&self, page: PageId) -> Result<()> {
        let region = page / PAGES_PER_BITMAP;
        let bit = page % PAGES_PER_BITMAP;
        if (region == 0 && bit == 0) || bit == BITMAP_SLOT {
            return Err(StoreError::InvalidArgument(format!(
                "page {page} is reserved and cannot be freed"
            )));
        }
        let _guard = self.scan.lock();
        let bitmap_page = region * PAGES_PER_BITMAP + BITMAP_SLOT;
        let mut bitmap = self.file.read_page(bitmap_page)?;
        if !test_bit(&bitmap, bit) {
            return Err(StoreError::InvalidArgument(format!(
                "page {page} is already free"
            )));
        }
        clear_bit(&mut bitmap, bit);
        self.file.write_page(bitmap_page, &bitmap[..])?;
        self.file.write_out(bitmap_page)?;
        trace!(page, "freed page");
        Ok(())
    }
}

fn first_zero_bit(bitmap: &[u8; PAGE_SIZE]) -> Option<u32> {
    for (byte_index, &byte) in bitmap.iter().enumerate() {
        if byte != 0xFF {
            let bit = byte.trailing_ones();
            return Some(byte_index as u32 * 8 + bit);
        }
    }
    None
}

fn test_bit(bitmap: &[u8; PAGE_SIZE], bit: u32) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

fn set_bit(bitmap: &mut [u8; PAGE_SIZE], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8; PAGE_SIZE], bit: u32) {
    bitmap[(bit / 8) as usize] &= !(1 << (bit % 8));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PagedFile;

    fn anon_allocator() -> PageAllocator {
        let file = Arc::new(PagedFile::open(None, 64).expect("open"));
        let alloc = PageAllocator::new(file);
        alloc.format().expect("format");
        alloc
    }

    #[test]
    fn first_allocation_skips_reserved_pages() {
        let alloc = anon_allocator();
        assert_eq!(alloc.allocate().expect("allocate"), 2);
        assert_eq!(alloc.allocate().expect("allocate"), 3);
    }

    #[test]
    fn freed_page_is_reused_first() {
        let alloc = anon_allocator();
        let a = alloc.allocate().expect("allocate");
        let b = alloc.allocate().expect("allocate");
        assert_ne!(a, b);
        alloc.free(a).expect("free");
        assert_eq!(alloc.allocate().expect("allocate"), a);
    }

    #[test]
    fn double_free_is_rejected() {
        let alloc = anon_allocator();
        let page = alloc.allocate().expect("allocate");
        alloc.free(page).expect("free");
        let err = alloc.free(page).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn reserved_pages_cannot_be_freed() {
        let alloc = anon_allocator();
        assert!(alloc.free(0).is_err());
        assert!(alloc.free(1).is_err());
        assert!(alloc.free(PAGES_PER_BITMAP + 1).is_err());
    }

    #[test]
    fn allocation_spills_into_next_region() {
        let alloc = anon_allocator();
        // Fill region 0 by hand: every bit set.
        let full = Box::new([0xFFu8; PAGE_SIZE]);
        alloc.file.write_page(BITMAP_SLOT, &full[..]).expect("write");
        let page = alloc.allocate().expect("allocate");
        // First free page of region 1; slot 1 there is the region's bitmap.
        assert_eq!(page, PAGES_PER_BITMAP);
    }
}
