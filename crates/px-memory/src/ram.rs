//! Main RAM backing store

use crate::constants::*;
use crate::pages::{PageState, PageTable};
use px_core::error::MemoryError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 2MB of guest RAM in a host mapping of its own.
///
/// The mapping is page aligned so individual 4KB code pages can be made
/// read-only when fastmem write protection is active. Writes from fastmem
/// code to a protected page fault, and the fault handler calls
/// [`Ram::notify_code_write`] to unprotect and flag it.
pub struct Ram {
    /// Base pointer of the host mapping
    base: *mut u8,
    /// Per-page code/dirty/protection state
    pages: PageTable,
    /// Whether code pages are mapped read-only
    write_protection: AtomicBool,
}

// Safety: The mapping lives as long as the Ram and page state is atomic.
// Concurrent guest accesses follow the single CPU thread model.
unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    /// Create zeroed RAM
    pub fn new() -> Result<Arc<Self>, MemoryError> {
        let base = Self::allocate(RAM_SIZE as usize)?;

        Ok(Arc::new(Self {
            base,
            pages: PageTable::new(),
            write_protection: AtomicBool::new(false),
        }))
    }

    #[cfg(unix)]
    fn allocate(size: usize) -> Result<*mut u8, MemoryError> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::OutOfMemory);
        }

        Ok(ptr as *mut u8)
    }

    #[cfg(not(unix))]
    fn allocate(size: usize) -> Result<*mut u8, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, RAM_CODE_PAGE_SIZE as usize)
            .map_err(|_| MemoryError::OutOfMemory)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::OutOfMemory);
        }
        Ok(ptr)
    }

    /// Host address of the first byte of RAM
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Host address range covered by the mapping
    pub fn host_range(&self) -> std::ops::Range<usize> {
        let start = self.base as usize;
        start..start + RAM_SIZE as usize
    }

    /// RAM offset for a host address inside the mapping
    #[inline]
    pub fn offset_of_host(&self, host: usize) -> Option<u32> {
        let start = self.base as usize;
        if host >= start && host < start + RAM_SIZE as usize {
            Some((host - start) as u32)
        } else {
            None
        }
    }

    /// Read a value. `offset` is wrapped into RAM.
    #[inline]
    pub fn read<T: Copy>(&self, offset: u32) -> T {
        let offset = (offset & RAM_MASK) as usize;
        let size = std::mem::size_of::<T>();
        if offset + size <= RAM_SIZE as usize {
            // Safety: bounds checked above
            unsafe { std::ptr::read_unaligned(self.base.add(offset) as *const T) }
        } else {
            let mut bytes = [0u8; 16];
            debug_assert!(size <= bytes.len());
            for (i, byte) in bytes.iter_mut().enumerate().take(size) {
                *byte = self.read::<u8>((offset + i) as u32);
            }
            // Safety: `bytes` holds at least size_of::<T>() initialized bytes
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
        }
    }

    /// Write a value. Writes landing on code pages are reported through
    /// the page table before the store happens.
    #[inline]
    pub fn write<T: Copy>(&self, offset: u32, value: T) {
        let offset = offset & RAM_MASK;
        let size = std::mem::size_of::<T>() as u32;
        let first = ram_code_page_index(offset);
        let last = ram_code_page_index(offset.wrapping_add(size - 1));
        self.check_code_write(first);
        if last != first {
            self.check_code_write(last);
        }

        let offset = offset as usize;
        if offset + size as usize <= RAM_SIZE as usize {
            // Safety: bounds checked above, page is writable after check_code_write
            unsafe { std::ptr::write_unaligned(self.base.add(offset) as *mut T, value) };
        } else {
            // Safety: `value` is plain data of `size` bytes
            let bytes = unsafe {
                std::slice::from_raw_parts(&value as *const T as *const u8, size as usize)
            };
            for (i, byte) in bytes.iter().enumerate() {
                self.write::<u8>((offset + i) as u32, *byte);
            }
        }
    }

    /// Copy a byte slice into RAM, wrapping at the end
    pub fn write_bytes(&self, offset: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write::<u8>(offset.wrapping_add(i as u32), *byte);
        }
    }

    /// Copy bytes out of RAM, wrapping at the end
    pub fn read_bytes(&self, offset: u32, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read::<u8>(offset.wrapping_add(i as u32));
        }
    }

    #[inline]
    fn check_code_write(&self, page: usize) {
        if self.pages.contains(page, PageState::CODE) {
            self.notify_code_write(page);
        }
    }

    /// Record a write to a code page: flag it dirty, drop the code flag and
    /// lift write protection. Only atomics and `mprotect`, so this is safe to
    /// call from a fault handler.
    pub fn notify_code_write(&self, page: usize) {
        self.pages.insert(page, PageState::DIRTY);
        self.pages.remove(page, PageState::CODE);
        self.unprotect_page(page);
    }

    /// Enable or disable read-only mapping of code pages. Returns whether
    /// protection is active afterwards; hosts whose page size differs from
    /// the guest code page size cannot protect individual pages.
    pub fn set_write_protection(&self, enabled: bool) -> bool {
        let enabled = enabled && host_page_size() == RAM_CODE_PAGE_SIZE as usize;
        let was = self.write_protection.swap(enabled, Ordering::AcqRel);
        if was && !enabled {
            for page in 0..RAM_CODE_PAGE_COUNT {
                self.unprotect_page(page);
            }
        } else if enabled && !was {
            let code_pages: Vec<usize> = self.pages.pages_with(PageState::CODE).collect();
            for page in code_pages {
                self.protect_page(page);
            }
        }
        enabled
    }

    #[inline]
    pub fn is_write_protected(&self) -> bool {
        self.write_protection.load(Ordering::Acquire)
    }

    /// Flag a page as holding cached code
    pub fn set_code_page(&self, page: usize) {
        let prev = self.pages.insert(page, PageState::CODE);
        if !prev.contains(PageState::CODE) && self.is_write_protected() {
            self.protect_page(page);
        }
    }

    /// Drop the code flag of a page
    pub fn clear_code_page(&self, page: usize) {
        self.pages.remove(page, PageState::CODE);
        self.unprotect_page(page);
    }

    #[inline]
    pub fn is_code_page(&self, page: usize) -> bool {
        self.pages.contains(page, PageState::CODE)
    }

    /// Drop every code flag
    pub fn clear_code_page_flags(&self) {
        for page in 0..RAM_CODE_PAGE_COUNT {
            self.clear_code_page(page);
        }
    }

    #[inline]
    pub fn has_dirty_pages(&self) -> bool {
        self.pages.has_dirty()
    }

    /// Drain pages written since the last call
    pub fn take_dirty_pages(&self, out: &mut Vec<usize>) {
        self.pages.take_dirty(out);
    }

    pub fn page_state(&self, page: usize) -> PageState {
        self.pages.get(page)
    }

    fn protect_page(&self, page: usize) {
        if self.set_page_protection(page, false).is_ok() {
            self.pages.insert(page, PageState::PROTECTED);
        }
    }

    fn unprotect_page(&self, page: usize) {
        if self.pages.remove(page, PageState::PROTECTED).contains(PageState::PROTECTED)
            && self.set_page_protection(page, true).is_err()
        {
            self.pages.insert(page, PageState::PROTECTED);
        }
    }

    #[cfg(unix)]
    fn set_page_protection(&self, page: usize, writable: bool) -> Result<(), MemoryError> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let offset = page * RAM_CODE_PAGE_SIZE as usize;
        let ret = unsafe {
            libc::mprotect(
                self.base.add(offset) as *mut libc::c_void,
                RAM_CODE_PAGE_SIZE as usize,
                prot,
            )
        };
        if ret != 0 {
            return Err(MemoryError::ProtectionFailed(offset as u32));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_page_protection(&self, page: usize, _writable: bool) -> Result<(), MemoryError> {
        Err(MemoryError::ProtectionFailed(page as u32 * RAM_CODE_PAGE_SIZE))
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, RAM_SIZE as usize);
        }

        #[cfg(not(unix))]
        unsafe {
            if let Ok(layout) =
                std::alloc::Layout::from_size_align(RAM_SIZE as usize, RAM_CODE_PAGE_SIZE as usize)
            {
                std::alloc::dealloc(self.base, layout);
            }
        }
    }
}

/// Host virtual memory page size
pub fn host_page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_creation() {
        let ram = Ram::new().unwrap();
        assert_eq!(ram.read::<u32>(0), 0);
        assert_eq!(ram.host_range().len(), RAM_SIZE as usize);
    }

    #[test]
    fn test_read_write_mirrors() {
        let ram = Ram::new().unwrap();
        ram.write::<u32>(0x1000, 0xDEAD_BEEF);
        assert_eq!(ram.read::<u32>(0x1000), 0xDEAD_BEEF);
        assert_eq!(ram.read::<u32>(0x20_1000), 0xDEAD_BEEF);
        assert_eq!(ram.read::<u16>(0x1002), 0xDEAD);
        assert_eq!(ram.read::<u8>(0x1000), 0xEF);
    }

    #[test]
    fn test_wrapping_access_at_end() {
        let ram = Ram::new().unwrap();
        ram.write::<u32>(RAM_SIZE - 2, 0x4433_2211);
        assert_eq!(ram.read::<u8>(RAM_SIZE - 2), 0x11);
        assert_eq!(ram.read::<u8>(0), 0x33);
        assert_eq!(ram.read::<u32>(RAM_SIZE - 2), 0x4433_2211);
    }

    #[test]
    fn test_code_page_write_marks_dirty() {
        let ram = Ram::new().unwrap();
        ram.set_code_page(2);
        assert!(ram.is_code_page(2));

        ram.write::<u32>(0x2004, 1);
        assert!(!ram.is_code_page(2));
        assert!(ram.has_dirty_pages());

        let mut pages = Vec::new();
        ram.take_dirty_pages(&mut pages);
        assert_eq!(pages, vec![2]);
    }

    #[test]
    fn test_write_protected_page_still_writable_through_ram() {
        let ram = Ram::new().unwrap();
        let active = ram.set_write_protection(true);
        ram.set_code_page(5);
        if active {
            assert!(ram.page_state(5).contains(PageState::PROTECTED));
        }

        ram.write::<u32>(5 * RAM_CODE_PAGE_SIZE, 0x1234_5678);
        assert_eq!(ram.read::<u32>(5 * RAM_CODE_PAGE_SIZE), 0x1234_5678);
        assert!(!ram.page_state(5).contains(PageState::PROTECTED));
        ram.set_write_protection(false);
    }

    #[test]
    fn test_offset_of_host() {
        let ram = Ram::new().unwrap();
        let base = ram.base_ptr() as usize;
        assert_eq!(ram.offset_of_host(base + 0x10), Some(0x10));
        assert_eq!(ram.offset_of_host(base + RAM_SIZE as usize), None);
    }
}
