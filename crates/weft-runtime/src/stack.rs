//! Fiber stack allocation
//!
//! Each fiber owns a contiguous mmap'd region with a PROT_NONE guard page
//! at the low end, so overflow faults instead of silently corrupting the
//! neighbouring allocation.

use weft_core::constants::GUARD_SIZE;
use weft_core::{SchedError, SchedResult};

/// An owned, guard-paged fiber stack
pub struct FiberStack {
    /// Base of the mapping (the guard page)
    base: *mut u8,
    /// Total mapped size including the guard page
    total: usize,
    /// Usable stack size
    size: usize,
}

// The stack region is owned exclusively by one Fiber; pointers are only
// dereferenced by the thread currently executing that fiber.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a new stack of `size` usable bytes
    ///
    /// `size` is rounded up to the page size. The lowest page of the
    /// mapping stays PROT_NONE.
    pub fn allocate(size: usize) -> SchedResult<Self> {
        let page = page_size();
        let size = (size.max(page) + page - 1) & !(page - 1);
        let total = size + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAllocation);
        }

        // Guard page at the low end
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(SchedError::StackAllocation);
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            size,
        })
    }

    /// Top of the usable stack (stacks grow down)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable stack size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_write() {
        let stack = FiberStack::allocate(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);

        // Top must be writable just below it
        unsafe {
            let p = stack.top().sub(8) as *mut u64;
            p.write(0xDEAD_BEEF);
            assert_eq!(p.read(), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_distinct_stacks() {
        let a = FiberStack::allocate(16 * 1024).unwrap();
        let b = FiberStack::allocate(16 * 1024).unwrap();
        assert_ne!(a.top(), b.top());
    }

    #[test]
    fn test_tiny_request_rounds_up() {
        let stack = FiberStack::allocate(1).unwrap();
        assert!(stack.size() >= 4096);
    }
}
