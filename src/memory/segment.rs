//! Segments of memory acquired from the system heap
//!
//! A pool grows by one segment at a time; segments are carved into
//! fixed-size nodes and live until the pool is dropped.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment of every segment. Pool widths are multiples of 8 so
/// every node inside a segment is at least 8-byte aligned.
pub const SEGMENT_ALIGN: usize = 16;

/// A contiguous, zero-initialised allocation from the system heap
#[derive(Debug, PartialEq)]
pub struct Segment {
    /// Pointer to memory
    ptr: NonNull<u8>,
    /// Size of segment
    size: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SegmentError {
    BadSize,
    OOM,
}

impl Segment {
    pub fn new(size: usize) -> Result<Self, SegmentError> {
        if size == 0 {
            Err(SegmentError::BadSize)
        } else {
            Ok(Segment {
                ptr: Self::alloc_segment(size)?,
                size,
            })
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether `ptr` points inside this segment
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.byte_offset_of(ptr).is_some()
    }

    /// Offset of `ptr` from the start of the segment, if inside
    pub fn byte_offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let start = self.ptr.as_ptr() as usize;
        let loc = ptr.as_ptr() as usize;
        if loc >= start && loc < start + self.size {
            Some(loc - start)
        } else {
            None
        }
    }

    fn layout(size: usize) -> Result<Layout, SegmentError> {
        Layout::from_size_align(size, SEGMENT_ALIGN).map_err(|_| SegmentError::BadSize)
    }

    fn alloc_segment(size: usize) -> Result<NonNull<u8>, SegmentError> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size (checked in `new`)
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(SegmentError::OOM)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated in `alloc_segment` with this same
        // layout and the segment owns it exclusively
        unsafe {
            dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.size, SEGMENT_ALIGN),
            )
        }
    }
}
