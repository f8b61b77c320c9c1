//! Fiber stack allocation
//!
//! Each fiber stack is an anonymous mmap with a PROT_NONE guard page at
//! the low end, so overflow faults instead of silently corrupting the
//! neighboring mapping.

use strand_core::error::ResourceError;

/// Page size assumed for guard placement and rounding
pub const PAGE_SIZE: usize = 4096;

/// Smallest usable stack the allocator will hand out
pub const MIN_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// An owned, guarded fiber stack
pub struct FiberStack {
    /// Mapping base (the guard page)
    base: *mut u8,
    /// Total mapping size including the guard page
    total_size: usize,
}

// Safety: the mapping is exclusively owned and carries no thread affinity
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Map a new stack with `size` usable bytes (rounded up to pages)
    pub fn allocate(size: usize) -> Result<FiberStack, ResourceError> {
        if size == 0 {
            return Err(ResourceError::InvalidStackSize);
        }
        let usable = round_up_pages(size.max(MIN_STACK_SIZE));
        let total_size = usable
            .checked_add(PAGE_SIZE)
            .ok_or(ResourceError::InvalidStackSize)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ResourceError::StackAllocation);
        }

        // Guard page at the low end; stacks grow down into it on overflow
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total_size) };
            return Err(ResourceError::GuardProtection);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            total_size,
        })
    }

    /// Top of the usable region (stacks grow down from here)
    #[inline]
    pub fn stack_top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_size) }
    }

    /// Usable bytes between the guard page and the top
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total_size - PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_size);
        }
    }
}

#[inline]
fn round_up_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
