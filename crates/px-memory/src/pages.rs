//! Per-page code tracking for main RAM

use crate::constants::RAM_CODE_PAGE_COUNT;
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

bitflags! {
    /// State bits tracked for each 4KB RAM page
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageState: u8 {
        /// At least one cached block was decoded from this page
        const CODE      = 0b0000_0001;
        /// A write landed on the page while it held code
        const DIRTY     = 0b0000_0010;
        /// The host mapping for the page is currently read-only
        const PROTECTED = 0b0000_0100;
    }
}

impl Default for PageState {
    fn default() -> Self {
        Self::empty()
    }
}

/// Lock-free page state table.
///
/// Every update is a single atomic op so the table can be touched from a
/// fault handler interrupting the thread that owns the code cache.
pub struct PageTable {
    states: Box<[AtomicU8]>,
    any_dirty: AtomicBool,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            states: (0..RAM_CODE_PAGE_COUNT).map(|_| AtomicU8::new(0)).collect(),
            any_dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn get(&self, page: usize) -> PageState {
        PageState::from_bits_truncate(self.states[page].load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, page: usize, state: PageState) -> bool {
        self.get(page).contains(state)
    }

    /// Set bits, returning the previous state
    #[inline]
    pub fn insert(&self, page: usize, state: PageState) -> PageState {
        let prev = self.states[page].fetch_or(state.bits(), Ordering::AcqRel);
        if state.contains(PageState::DIRTY) {
            self.any_dirty.store(true, Ordering::Release);
        }
        PageState::from_bits_truncate(prev)
    }

    /// Clear bits, returning the previous state
    #[inline]
    pub fn remove(&self, page: usize, state: PageState) -> PageState {
        PageState::from_bits_truncate(self.states[page].fetch_and(!state.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub fn has_dirty(&self) -> bool {
        self.any_dirty.load(Ordering::Acquire)
    }

    /// Drain dirty pages into `out`, clearing their dirty bit
    pub fn take_dirty(&self, out: &mut Vec<usize>) {
        if !self.any_dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        for (page, state) in self.states.iter().enumerate() {
            let prev = state.fetch_and(!PageState::DIRTY.bits(), Ordering::AcqRel);
            if prev & PageState::DIRTY.bits() != 0 {
                out.push(page);
            }
        }
    }

    /// Pages that currently have `state` set
    pub fn pages_with(&self, state: PageState) -> impl Iterator<Item = usize> + '_ {
        (0..self.states.len()).filter(move |&page| self.contains(page, state))
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let table = PageTable::new();
        assert_eq!(table.len(), RAM_CODE_PAGE_COUNT);

        let prev = table.insert(7, PageState::CODE);
        assert!(prev.is_empty());
        assert!(table.contains(7, PageState::CODE));

        let prev = table.remove(7, PageState::CODE);
        assert_eq!(prev, PageState::CODE);
        assert!(table.get(7).is_empty());
    }

    #[test]
    fn test_take_dirty() {
        let table = PageTable::new();
        assert!(!table.has_dirty());

        table.insert(3, PageState::DIRTY);
        table.insert(100, PageState::DIRTY | PageState::CODE);
        assert!(table.has_dirty());

        let mut pages = Vec::new();
        table.take_dirty(&mut pages);
        assert_eq!(pages, vec![3, 100]);
        assert!(!table.has_dirty());
        assert!(table.contains(100, PageState::CODE));
        assert!(!table.contains(100, PageState::DIRTY));

        pages.clear();
        table.take_dirty(&mut pages);
        assert!(pages.is_empty());
    }
}
