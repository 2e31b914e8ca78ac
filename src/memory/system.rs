//! System pool allocations
//!
//! Series whose buffers are larger than the biggest pool size class
//! get a buffer of their own straight from the system heap.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::fatal::{crash, Fatal};

/// Alignment of system pool buffers (matches pool segments)
const SYSTEM_BUFFER_ALIGN: usize = 16;

/// A buffer owned by a single series. Unlike a pool node it is not
/// restricted to a size class and is released when dropped.
#[derive(Debug)]
pub struct SystemBlock {
    /// Pointer to memory
    ptr: NonNull<u8>,
    /// Size of allocation
    size: usize,
}

impl SystemBlock {
    /// Create a new SystemBlock able to contain `required_size`
    /// bytes. The size is rounded up to the next power of two when
    /// `pow2` is set, otherwise to a multiple of `align`.
    pub fn new(required_size: usize, pow2: bool, align: usize) -> Self {
        let size = Self::rounded_size(required_size, pow2, align);
        match Self::alloc_block(size) {
            Some(ptr) => SystemBlock { ptr, size },
            None => crash(
                Fatal::NoMemory,
                format_args!("system pool could not provide {size} bytes"),
            ),
        }
    }

    /// Capacity actually granted for a request
    pub fn rounded_size(required_size: usize, pow2: bool, align: usize) -> usize {
        let required_size = required_size.max(1);
        if pow2 {
            required_size.next_power_of_two()
        } else {
            let align = align.max(1);
            required_size.div_ceil(align) * align
        }
    }

    fn alloc_block(size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, SYSTEM_BUFFER_ALIGN).ok()?;
        // SAFETY: size is non-zero (rounded_size never returns 0)
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    /// Pointer to the writeable memory area
    pub fn space(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Actual allocated size of this block
    pub fn allocated_size(&self) -> usize {
        self.size
    }
}

impl Drop for SystemBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated by `alloc_block` with the same
        // size and alignment and is owned exclusively by this block
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, SYSTEM_BUFFER_ALIGN);
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_rounding() {
        assert_eq!(SystemBlock::rounded_size(4097, false, 2048), 6144);
        assert_eq!(SystemBlock::rounded_size(6144, false, 2048), 6144);
        assert_eq!(SystemBlock::rounded_size(10_000, false, 2048), 10_240);
    }

    #[test]
    fn test_power_of_two_rounding() {
        assert_eq!(SystemBlock::rounded_size(4097, true, 2048), 8192);
        assert_eq!(SystemBlock::rounded_size(8192, true, 2048), 8192);
        assert_eq!(SystemBlock::rounded_size(100_000, true, 2048), 131_072);
    }

    #[test]
    fn test_power_of_two_never_smaller_than_aligned() {
        for size in [4097, 5000, 9000, 33 * 1024, 100 * 1024] {
            let aligned = SystemBlock::rounded_size(size, false, 2048);
            let pow2 = SystemBlock::rounded_size(size, true, 2048);
            assert!(aligned >= size);
            assert!(pow2 >= aligned);
        }
    }

    #[test]
    fn test_block_is_zeroed() {
        let block = SystemBlock::new(5000, false, 2048);
        assert_eq!(block.allocated_size(), 6144);
        let bytes = unsafe { std::slice::from_raw_parts(block.space(), block.allocated_size()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
