//! Per-page locking and hierarchical lock chains.
//!
//! [`PageLockTable`] provides advisory read/write exclusion per page:
//! writers block readers and other writers of the same page, nothing blocks
//! operations on other pages. Waiters sleep on one table-wide condition
//! variable and every unlock wakes them all; the wait is additionally
//! bounded by a poll interval so a stalled holder cannot silence a waiter
//! forever.
//!
//! The three chain types encode the traversal policies used while
//! descending the page hierarchy:
//!
//! - [`ReadLockChain`] holds at most one read lock, hand-over-hand.
//! - [`WriteLockChain`] holds at most two write locks (current page and its
//!   immediate parent), enough to patch the parent and free the child in
//!   one protected step.
//! - [`DeleteLockChain`] holds a variable-length prefix: the nearest
//!   ancestor with more than one entry, that ancestor's immediate parent,
//!   and every single-entry page below.
//!
//! Deadlock freedom: every chain acquires locks strictly top-down along the
//! page hierarchy and never acquires a lock on an ancestor of a page it
//! already holds. The chains release in drop order guaranteed by the type,
//! not by caller discipline.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::pager::PageId;

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

/// Table of per-page advisory read/write locks.
pub struct PageLockTable {
    pages: Mutex<HashMap<PageId, LockState>>,
    released: Condvar,
    poll_interval: Duration,
}

impl PageLockTable {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            poll_interval,
        }
    }

    fn lock_read(&self, page: PageId) {
        let mut pages = self.pages.lock();
        loop {
            match pages.get_mut(&page) {
                None => {
                    pages.insert(
                        page,
                        LockState {
                            readers: 1,
                            writer: false,
                        },
                    );
                    return;
                }
                Some(state) if !state.writer => {
                    state.readers += 1;
                    return;
                }
                Some(_) => {
                    let _ = self.released.wait_for(&mut pages, self.poll_interval);
                }
            }
        }
    }

    fn unlock_read(&self, page: PageId) {
        let mut pages = self.pages.lock();
        if let Some(state) = pages.get_mut(&page) {
            debug_assert!(state.readers > 0, "read unlock without lock");
            state.readers = state.readers.saturating_sub(1);
            if state.readers == 0 && !state.writer {
                pages.remove(&page);
            }
        }
        self.released.notify_all();
    }

    fn lock_write(&self, page: PageId) {
        let mut pages = self.pages.lock();
        loop {
            match pages.get_mut(&page) {
                None => {
                    pages.insert(
                        page,
                        LockState {
                            readers: 0,
                            writer: true,
                        },
                    );
                    return;
                }
                Some(state) if !state.writer && state.readers == 0 => {
                    state.writer = true;
                    return;
                }
                Some(_) => {
                    let _ = self.released.wait_for(&mut pages, self.poll_interval);
                }
            }
        }
    }

    fn unlock_write(&self, page: PageId) {
        let mut pages = self.pages.lock();
        if let Some(state) = pages.get_mut(&page) {
            debug_assert!(state.writer, "write unlock without lock");
            state.writer = false;
            if state.readers == 0 {
                pages.remove(&page);
            }
        }
        self.released.notify_all();
    }

    #[cfg(test)]
    fn state_of(&self, page: PageId) -> Option<(u32, bool)> {
        self.pages
            .lock()
            .get(&page)
            .map(|s| (s.readers, s.writer))
    }
}

/// Hand-over-hand read chain: locks the next page before releasing the
/// previous one, so the pointer that led downward stays valid until the
/// child is secured.
pub struct ReadLockChain<'t> {
    table: &'t PageLockTable,
    current: Option<PageId>,
}

impl<'t> ReadLockChain<'t> {
    pub fn new(table: &'t PageLockTable) -> Self {
        Self {
            table,
            current: None,
        }
    }

    /// Acquires `page` for reading, then releases the previously held page.
    /// `page` must be a descendant of the previously held page.
    pub fn add(&mut self, page: PageId) {
        self.table.lock_read(page);
        if let Some(prev) = self.current.replace(page) {
            self.table.unlock_read(prev);
        }
    }
}

impl Drop for ReadLockChain<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.current.take() {
            self.table.unlock_read(page);
        }
    }
}

/// Write chain holding the current page and its immediate parent, so the
/// parent pointer can be patched and the superseded child freed without a
/// third level ever being locked.
pub struct WriteLockChain<'t> {
    table: &'t PageLockTable,
    held: Vec<PageId>,
}

impl<'t> WriteLockChain<'t> {
    pub fn new(table: &'t PageLockTable) -> Self {
        Self {
            table,
            held: Vec::with_capacity(2),
        }
    }

    /// Acquires `page` for writing, releasing the grandparent if one is
    /// still held. `page` must be a descendant of the current page.
    pub fn add(&mut self, page: PageId) {
        self.table.lock_write(page);
        self.held.push(page);
        if self.held.len() > 2 {
            let grandparent = self.held.remove(0);
            self.table.unlock_write(grandparent);
        }
    }

    pub fn current(&self) -> Option<PageId> {
        self.held.last().copied()
    }

    pub fn parent(&self) -> Option<PageId> {
        if self.held.len() >= 2 {
            Some(self.held[self.held.len() - 2])
        } else {
            None
        }
    }
}

impl Drop for WriteLockChain<'_> {
    fn drop(&mut self) {
        for &page in self.held.iter().rev() {
            self.table.unlock_write(page);
        }
    }
}

/// Delete chain holding a variable-length ancestor prefix.
///
/// While every page on the path so far has exactly one entry, removing the
/// key below could empty the whole prefix, so it all stays locked. Once a
/// page with more than one entry is reached the prefix above it can no
/// longer empty; [`DeleteLockChain::release_settled_ancestors`] then drops
/// everything except that page and its immediate parent (still needed to
/// patch the surviving page's incoming pointer).
pub struct DeleteLockChain<'t> {
    table: &'t PageLockTable,
    held: Vec<PageId>,
}

impl<'t> DeleteLockChain<'t> {
    pub fn new(table: &'t PageLockTable) -> Self {
        Self {
            table,
            held: Vec::new(),
        }
    }

    /// Acquires `page` for writing and appends it to the held prefix.
    /// `page` must be a descendant of the current page.
    pub fn add(&mut self, page: PageId) {
        self.table.lock_write(page);
        self.held.push(page);
    }

    /// Keeps only the current page and its immediate parent locked.
    /// Called when the current page has more than one entry.
    pub fn release_settled_ancestors(&mut self) {
        while self.held.len() > 2 {
            let settled = self.held.remove(0);
            self.table.unlock_write(settled);
        }
    }

    /// Pages still locked, oldest ancestor first.
    pub fn held(&self) -> &[PageId] {
        &self.held
    }
}

impl Drop for DeleteLockChain<'_> {
    fn drop(&mut self) {
        for &page in self.held.iter().rev() {
            self.table.unlock_write(page);
        }
    }
}
