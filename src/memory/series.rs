//! Series headers
//!
//! A series is the runtime's universal resizable buffer. The header
//! records the element width, the used length (`tail`), the capacity
//! of the whole buffer in elements (`rest`) and the number of unused
//! elements at the head of the buffer (`bias`). The element at `tail`
//! is always all zero bytes (the terminator), so
//! `bias + tail < rest` holds at all times.

use std::fmt;
use std::ptr::NonNull;

use super::pool::PoolId;
use super::system::SystemBlock;

bitflags! {
    /// Per-series state bits
    pub struct SeriesFlags: u32 {
        /// Mutation is refused with a protection error
        const PROTECTED = 0b0000_0001;
        /// Capacity may not be increased
        const FIXED_SIZE = 0b0000_0010;
        /// Relocations round capacity to a power of two
        const POWER_OF_2 = 0b0000_0100;
        /// Referenced by more than one owner (word lists of cloned frames)
        const SHARED = 0b0000_1000;
        /// Reserved for the external collector
        const MARK = 0b0001_0000;
        /// Holds elements with padding bytes, so has no byte view
        const OPAQUE = 0b0010_0000;
    }
}

/// Handle to a series header. Stable across relocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SeriesId(u32);

impl SeriesId {
    pub(crate) fn new(index: u32) -> Self {
        SeriesId(index)
    }

    /// Return the raw index for diagnostics
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ser#{}", self.0)
    }
}

/// Types that may be stored as series elements
///
/// # Safety
///
/// Implementors must be plain data: `Copy`, no drop glue, valid for
/// any bit pattern the series writes (their own values and all zero
/// bytes), and must have an alignment of at most 8. The all-zero
/// value serves as the series terminator.
///
/// `PLAIN` may only be set for types without padding bytes. Series
/// written with a non-plain type are flagged `OPAQUE` and refuse raw
/// byte views, since their padding is uninitialised.
pub unsafe trait Element: Copy + 'static {
    const PLAIN: bool = false;
}

unsafe impl Element for u8 {
    const PLAIN: bool = true;
}
unsafe impl Element for u16 {
    const PLAIN: bool = true;
}
unsafe impl Element for u32 {
    const PLAIN: bool = true;
}
unsafe impl Element for u64 {
    const PLAIN: bool = true;
}
unsafe impl Element for i32 {
    const PLAIN: bool = true;
}
unsafe impl Element for i64 {
    const PLAIN: bool = true;
}

/// Where a series' buffer lives
#[derive(Debug)]
pub(crate) enum Storage {
    /// Header is on the free list
    Free,
    /// A node from a size-classed pool
    Node { pool: PoolId, ptr: NonNull<u8> },
    /// An oversized buffer from the system heap
    System(SystemBlock),
}

impl Storage {
    pub(crate) fn base(&self) -> Option<NonNull<u8>> {
        match self {
            Storage::Free => None,
            Storage::Node { ptr, .. } => Some(*ptr),
            // SAFETY: system blocks never hold a null pointer
            Storage::System(block) => NonNull::new(block.space()),
        }
    }

    pub(crate) fn pool(&self) -> Option<PoolId> {
        match self {
            Storage::Free => None,
            Storage::Node { pool, .. } => Some(*pool),
            Storage::System(_) => Some(PoolId::SYSTEM),
        }
    }
}

/// Series header as held in the heap's header slab
#[derive(Debug)]
pub(crate) struct SeriesHeader {
    pub(crate) storage: Storage,
    /// Element width in bytes
    pub(crate) wide: u32,
    /// Used length in elements
    pub(crate) tail: u32,
    /// Capacity of the whole buffer in elements
    pub(crate) rest: u32,
    /// Unused elements at the head of the buffer
    pub(crate) bias: u32,
    pub(crate) flags: SeriesFlags,
}

impl SeriesHeader {
    pub(crate) fn free() -> Self {
        SeriesHeader {
            storage: Storage::Free,
            wide: 0,
            tail: 0,
            rest: 0,
            bias: 0,
            flags: SeriesFlags::empty(),
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        matches!(self.storage, Storage::Free)
    }

    pub(crate) fn wide(&self) -> usize {
        self.wide as usize
    }

    /// Pointer to element 0 (i.e. past the bias)
    pub(crate) fn data(&self) -> *mut u8 {
        match self.storage.base() {
            // SAFETY: bias < rest so the offset stays inside the buffer
            Some(base) => unsafe { base.as_ptr().add(self.bias as usize * self.wide()) },
            None => std::ptr::null_mut(),
        }
    }

    /// Pointer to the start of the buffer (ignoring bias)
    pub(crate) fn base(&self) -> *mut u8 {
        self.storage
            .base()
            .map_or(std::ptr::null_mut(), |b| b.as_ptr())
    }

    /// Elements that can be added without relocation
    pub(crate) fn available(&self) -> u32 {
        self.rest - self.bias - self.tail - 1
    }

    /// Zero the element at tail
    pub(crate) fn terminate(&mut self) {
        let wide = self.wide();
        // SAFETY: bias + tail < rest, so the terminator slot is inside
        // the buffer
        unsafe {
            std::ptr::write_bytes(self.data().add(self.tail as usize * wide), 0, wide);
        }
    }
}
