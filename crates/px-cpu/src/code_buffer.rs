//! Executable memory for recompiled code
//!
//! One host mapping split into a near region, where block bodies go, and a
//! far region for cold paths such as slow memory access thunks. Backends
//! emit into both and may later patch bytes in place.

use px_core::error::CpuError;

/// Default size of each region
pub const DEFAULT_CODE_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Near/far code buffer pair
pub struct CodeBuffer {
    base: *mut u8,
    near_size: usize,
    far_size: usize,
    near_used: usize,
    far_used: usize,
    executable: bool,
}

// Safety: the mapping is owned exclusively by the buffer
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    pub fn new(near_size: usize, far_size: usize) -> Result<Self, CpuError> {
        let total = near_size + far_size;
        let (base, executable) = Self::allocate(total)?;
        if !executable {
            tracing::warn!("Code buffer could not be mapped executable, using a writable mapping");
        }
        tracing::debug!(
            "Allocated code buffer: {} KB near, {} KB far",
            near_size / 1024,
            far_size / 1024
        );

        Ok(Self {
            base,
            near_size,
            far_size,
            near_used: 0,
            far_used: 0,
            executable,
        })
    }

    /// Buffer with the default region sizes
    pub fn with_default_size() -> Result<Self, CpuError> {
        Self::new(DEFAULT_CODE_BUFFER_SIZE, DEFAULT_CODE_BUFFER_SIZE)
    }

    #[cfg(unix)]
    fn allocate(size: usize) -> Result<(*mut u8, bool), CpuError> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};

        let flags = MAP_PRIVATE | MAP_ANONYMOUS;
        let rwx = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                flags,
                -1,
                0,
            )
        };
        if rwx != MAP_FAILED {
            return Ok((rwx as *mut u8, true));
        }

        let rw = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if rw == MAP_FAILED {
            return Err(CpuError::CodeBufferAllocation(size));
        }
        Ok((rw as *mut u8, false))
    }

    #[cfg(not(unix))]
    fn allocate(size: usize) -> Result<(*mut u8, bool), CpuError> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 4096)
            .map_err(|_| CpuError::CodeBufferAllocation(size))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CpuError::CodeBufferAllocation(size));
        }
        Ok((ptr, false))
    }

    /// Whether the mapping allows execution
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Host address of the next near byte
    pub fn near_code_pointer(&self) -> usize {
        self.base as usize + self.near_used
    }

    /// Host address of the next far byte
    pub fn far_code_pointer(&self) -> usize {
        self.base as usize + self.near_size + self.far_used
    }

    pub fn near_free_space(&self) -> usize {
        self.near_size - self.near_used
    }

    pub fn far_free_space(&self) -> usize {
        self.far_size - self.far_used
    }

    pub fn near_used(&self) -> usize {
        self.near_used
    }

    pub fn far_used(&self) -> usize {
        self.far_used
    }

    /// Whether `addr` lies inside either region
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base as usize;
        addr >= start && addr < start + self.near_size + self.far_size
    }

    /// Append to the near region, returning the host address of the bytes
    pub fn emit_near(&mut self, bytes: &[u8]) -> Result<usize, CpuError> {
        if bytes.len() > self.near_free_space() {
            return Err(CpuError::OutOfCodeSpace);
        }
        let addr = self.near_code_pointer();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        self.near_used += bytes.len();
        Ok(addr)
    }

    /// Append to the far region, returning the host address of the bytes
    pub fn emit_far(&mut self, bytes: &[u8]) -> Result<usize, CpuError> {
        if bytes.len() > self.far_free_space() {
            return Err(CpuError::OutOfCodeSpace);
        }
        let addr = self.far_code_pointer();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        self.far_used += bytes.len();
        Ok(addr)
    }

    /// Overwrite already emitted bytes. Fails if the range isn't emitted code.
    pub fn patch(&mut self, addr: usize, bytes: &[u8]) -> bool {
        let start = self.base as usize;
        let near = start..start + self.near_used;
        let far = start + self.near_size..start + self.near_size + self.far_used;
        let end = addr + bytes.len();
        let in_range = |r: &std::ops::Range<usize>| addr >= r.start && end <= r.end;
        if !in_range(&near) && !in_range(&far) {
            return false;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        true
    }

    /// Read back emitted bytes
    pub fn bytes(&self, addr: usize, len: usize) -> Option<&[u8]> {
        if !self.contains(addr) || !self.contains(addr + len.max(1) - 1) {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    /// Discard all emitted code
    pub fn reset(&mut self) {
        tracing::debug!(
            "Resetting code buffer ({} near / {} far bytes used)",
            self.near_used,
            self.far_used
        );
        self.near_used = 0;
        self.far_used = 0;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        let total = self.near_size + self.far_size;

        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, total);
        }

        #[cfg(not(unix))]
        unsafe {
            if let Ok(layout) = std::alloc::Layout::from_size_align(total.max(1), 4096) {
                std::alloc::dealloc(self.base, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_free_space() {
        let mut buffer = CodeBuffer::new(4096, 4096).unwrap();
        let near = buffer.emit_near(&[0x90; 16]).unwrap();
        let far = buffer.emit_far(&[0xCC; 8]).unwrap();
        assert_eq!(buffer.near_free_space(), 4096 - 16);
        assert_eq!(buffer.far_free_space(), 4096 - 8);
        assert!(buffer.contains(near) && buffer.contains(far));
        assert_eq!(buffer.bytes(far, 8).unwrap(), &[0xCC; 8]);
    }

    #[test]
    fn test_out_of_space() {
        let mut buffer = CodeBuffer::new(4096, 4096).unwrap();
        buffer.emit_near(&[0; 4000]).unwrap();
        assert!(matches!(buffer.emit_near(&[0; 200]), Err(CpuError::OutOfCodeSpace)));
        buffer.reset();
        assert_eq!(buffer.near_free_space(), 4096);
    }

    #[test]
    fn test_patch_only_emitted_code() {
        let mut buffer = CodeBuffer::new(4096, 4096).unwrap();
        let addr = buffer.emit_near(&[1, 2, 3, 4]).unwrap();
        assert!(buffer.patch(addr + 1, &[9, 9]));
        assert_eq!(buffer.bytes(addr, 4).unwrap(), &[1, 9, 9, 4]);
        assert!(!buffer.patch(addr + 2, &[0; 8]));
    }
}
