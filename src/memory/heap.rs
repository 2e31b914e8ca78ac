//! The series heap
//!
//! `Heap` owns the pools and a slab of series headers and implements
//! series growth, removal and relocation. Anything that may move a
//! series' buffer takes `&mut self`, so no borrow of series contents
//! can survive a relocation: callers re-read through the `SeriesId`.

use std::cmp::min;
use std::fmt::{self, Debug};
use std::mem::{align_of, replace, size_of};
use std::ptr::{copy, copy_nonoverlapping, write_bytes};
use std::slice::{from_raw_parts, from_raw_parts_mut};

use pretty_hex::pretty_hex;
use thiserror::Error;
use tracing::{debug, trace};

use super::pool::{find_pool, PoolStats, Pools};
use super::series::{Element, SeriesFlags, SeriesHeader, SeriesId, Storage};
use crate::config::RuntimeSettings;
use crate::fatal::{crash, Fatal};

/// Maximum size of any series buffer in bytes
pub const MAX_SERIES_BYTES: u64 = u32::MAX as u64;

/// Recoverable series errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("series of {requested} bytes exceeds the limit of {max} bytes")]
    SizeLimit { requested: u64, max: u64 },
    #[error("series is protected from modification")]
    Protected,
    #[error("series has a fixed size")]
    FixedSize,
    #[error("index {index} out of range for series of length {len}")]
    BadIndex { index: usize, len: usize },
    #[error("bad element width {0}")]
    BadWidth(usize),
}

/// Counters for series operations since the heap was created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesMetrics {
    /// Series created
    pub made: u64,
    /// Series freed
    pub freed: u64,
    /// Calls that added room to a series
    pub expansions: u64,
    /// Expansions that needed a new buffer
    pub relocations: u64,
    /// Head removals that moved data back to the start of the buffer
    pub bias_resets: u64,
    /// Bytes moved by expansion, removal and relocation
    pub bytes_moved: u64,
    /// Series moved into a smaller buffer
    pub shrinks: u64,
}

#[derive(Debug, Clone)]
pub struct HeapStats {
    /// Series currently allocated
    pub live_series: usize,
    /// Bytes granted to live series
    pub bytes_in_use: usize,
    /// Bytes held in pool segments and system blocks
    pub reserved_bytes: usize,
    /// Bytes held in system blocks
    pub system_bytes: usize,
    /// Remaining allocation before a collection is requested
    pub ballast: isize,
    /// Whether a collection has been requested
    pub collection_signal: bool,
    /// Per size class
    pub pools: Vec<PoolStats>,
    pub series: SeriesMetrics,
}

/// Result of a recycle pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecycleReport {
    /// Series whose head slack was returned to their tail
    pub series_rebased: usize,
    /// Bytes of head slack reclaimed
    pub slack_reclaimed: usize,
}

/// Series that recently needed a new buffer. Expanding one of these
/// again doubles the requested size.
struct ExpandRing {
    slots: Vec<Option<SeriesId>>,
    next: usize,
}

impl ExpandRing {
    fn new(size: usize) -> Self {
        ExpandRing {
            slots: vec![None; size.max(1)],
            next: 0,
        }
    }

    /// Whether `id` was relocated recently; remembers it if not
    fn note(&mut self, id: SeriesId) -> bool {
        if self.slots.contains(&Some(id)) {
            true
        } else {
            self.slots[self.next] = Some(id);
            self.next = (self.next + 1) % self.slots.len();
            false
        }
    }

    fn forget(&mut self, id: SeriesId) {
        for slot in self.slots.iter_mut().filter(|s| **s == Some(id)) {
            *slot = None;
        }
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.next = 0;
    }
}

/// The series heap
pub struct Heap {
    pools: Pools,
    headers: Vec<SeriesHeader>,
    /// Indexes of free headers
    free_headers: Vec<u32>,
    /// Bytes left before a collection is requested
    ballast: isize,
    /// Value the ballast is reset to by recycle
    ballast_reset: isize,
    /// Collection requested
    collection_signal: bool,
    /// Open critical sections (collection suppressed while > 0)
    critical: u32,
    max_bias: u32,
    expansions: ExpandRing,
    metrics: SeriesMetrics,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new(&RuntimeSettings::default())
    }
}

impl Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?}", self.pools)?;
        writeln!(
            f,
            "{} live series, ballast {}",
            self.live_series().count(),
            self.ballast
        )
    }
}

impl Heap {
    pub fn new(settings: &RuntimeSettings) -> Self {
        let ballast = min(settings.ballast, isize::MAX as usize) as isize;
        Heap {
            pools: Pools::new(settings.system_align),
            headers: vec![],
            free_headers: vec![],
            ballast,
            ballast_reset: ballast,
            collection_signal: false,
            critical: 0,
            max_bias: settings.max_bias,
            expansions: ExpandRing::new(settings.expand_ring),
            metrics: SeriesMetrics::default(),
        }
    }

    /// Make a series able to hold `length` elements of `wide` bytes
    /// (plus the terminator). When the buffer comes from the system
    /// pool `pow2` rounds its size to a power of two.
    pub fn make_series(
        &mut self,
        length: usize,
        wide: usize,
        pow2: bool,
    ) -> Result<SeriesId, SeriesError> {
        if wide == 0 || wide > u16::MAX as usize {
            return Err(SeriesError::BadWidth(wide));
        }

        let units = length.checked_add(1).ok_or(SeriesError::SizeLimit {
            requested: u64::MAX,
            max: MAX_SERIES_BYTES,
        })?;
        let (storage, rest) = self.allocate(units, wide, pow2)?;

        let mut header = SeriesHeader {
            storage,
            wide: wide as u32,
            tail: 0,
            rest,
            bias: 0,
            flags: if pow2 {
                SeriesFlags::POWER_OF_2
            } else {
                SeriesFlags::empty()
            },
        };
        header.terminate();

        self.metrics.made += 1;
        Ok(self.install(header))
    }

    /// Make a series sized for elements of type `T`
    pub fn make<T: Element>(&mut self, length: usize) -> Result<SeriesId, SeriesError> {
        self.make_series(length, size_of::<T>(), false)
    }

    /// Make a series holding a copy of `items`
    pub fn make_from<T: Element>(&mut self, items: &[T]) -> Result<SeriesId, SeriesError> {
        let id = self.make::<T>(items.len())?;
        self.append(id, items)?;
        Ok(id)
    }

    /// Release a series' buffer and header. The id must not be used
    /// afterwards (it will be reused by a later series).
    pub fn free_series(&mut self, id: SeriesId) {
        let header = replace(self.header_mut(id), SeriesHeader::free());
        self.release(header.storage);
        self.free_headers.push(id.as_u32());
        self.expansions.forget(id);
        self.metrics.freed += 1;
    }

    /// Open room for `delta` zeroed elements at `index`
    ///
    /// Uses head slack when inserting at the head, moves the tail up
    /// when the buffer has room, and otherwise moves the series into
    /// a bigger buffer. A series relocated recently gets double the
    /// room it asked for.
    pub fn expand_series(
        &mut self,
        id: SeriesId,
        index: usize,
        delta: usize,
    ) -> Result<(), SeriesError> {
        self.check_mutable(id)?;

        let header = self.header(id);
        let tail = header.tail as usize;
        let wide = header.wide();
        if index > tail {
            return Err(SeriesError::BadIndex { index, len: tail });
        }
        if delta == 0 {
            return Ok(());
        }

        let needed = Self::checked_units(tail, delta, wide)?;
        self.metrics.expansions += 1;

        let header = self.header_mut(id);

        // insertion at head into existing slack
        if index == 0 && header.bias as usize >= delta {
            header.bias -= delta as u32;
            header.tail += delta as u32;
            // SAFETY: the new head elements lie in the former slack
            unsafe { write_bytes(header.data(), 0, delta * wide) };
            return Ok(());
        }

        // insertion within existing capacity
        if header.available() as usize >= delta {
            let moved = (tail - index + 1) * wide;
            // SAFETY: bias + tail + delta < rest so both the moved
            // region (including terminator) and the gap are in bounds
            unsafe {
                let at = header.data().add(index * wide);
                copy(at, at.add(delta * wide), moved);
                write_bytes(at, 0, delta * wide);
            }
            header.tail += delta as u32;
            self.metrics.bytes_moved += moved as u64;
            return Ok(());
        }

        if header.flags.contains(SeriesFlags::FIXED_SIZE) {
            return Err(SeriesError::FixedSize);
        }

        self.relocate(id, index, delta, needed)
    }

    /// Move a series to a buffer with room for `needed` elements (or
    /// twice that if it was relocated recently), opening a gap of
    /// `delta` elements at `index`.
    fn relocate(
        &mut self,
        id: SeriesId,
        index: usize,
        delta: usize,
        needed: usize,
    ) -> Result<(), SeriesError> {
        let header = self.header(id);
        let tail = header.tail as usize;
        let wide = header.wide();
        let pow2 = header.flags.contains(SeriesFlags::POWER_OF_2);

        let doubled = self.expansions.note(id);
        let units = match needed.checked_mul(2) {
            Some(double) if doubled && (double as u64) * (wide as u64) <= MAX_SERIES_BYTES => {
                double
            }
            _ => needed,
        };

        let (storage, rest) = self.allocate(units, wide, pow2)?;
        let new_base = Self::storage_base(id, &storage);

        let header = self.header_mut(id);
        // SAFETY: the new buffer holds at least tail + delta + 1
        // elements; old and new buffers are distinct allocations
        unsafe {
            let old = header.data();
            copy_nonoverlapping(old, new_base, index * wide);
            copy_nonoverlapping(
                old.add(index * wide),
                new_base.add((index + delta) * wide),
                (tail - index + 1) * wide,
            );
            write_bytes(new_base.add(index * wide), 0, delta * wide);
        }

        let old_storage = replace(&mut header.storage, storage);
        header.rest = rest;
        header.bias = 0;
        header.tail += delta as u32;

        self.release(old_storage);
        self.metrics.relocations += 1;
        self.metrics.bytes_moved += ((tail + 1) * wide) as u64;
        trace!(series = %id, tail = tail + delta, rest, doubled, "series relocated");
        Ok(())
    }

    /// Remove `count` elements at `index`
    ///
    /// Removal at the head just grows the bias until it would pass
    /// the configured maximum, at which point the remaining data is
    /// moved back to the start of the buffer in one go.
    pub fn remove_series(
        &mut self,
        id: SeriesId,
        index: usize,
        count: usize,
    ) -> Result<(), SeriesError> {
        self.check_mutable(id)?;
        let max_bias = self.max_bias as usize;

        let header = self.header_mut(id);
        let tail = header.tail as usize;
        if index > tail {
            return Err(SeriesError::BadIndex { index, len: tail });
        }
        let count = min(count, tail - index);
        if count == 0 {
            return Ok(());
        }
        let wide = header.wide();

        let mut moved = 0;
        let mut reset = false;
        if index == 0 {
            let bias = header.bias as usize + count;
            if bias > max_bias {
                moved = (tail - count + 1) * wide;
                // SAFETY: source and destination are both inside the
                // buffer; `copy` handles the overlap
                unsafe { copy(header.data().add(count * wide), header.base(), moved) };
                header.bias = 0;
                reset = true;
            } else {
                header.bias = bias as u32;
            }
        } else {
            moved = (tail - index - count + 1) * wide;
            // SAFETY: index + count <= tail, terminator included
            unsafe {
                let at = header.data().add(index * wide);
                copy(at.add(count * wide), at, moved);
            }
        }
        header.tail -= count as u32;

        self.metrics.bytes_moved += moved as u64;
        if reset {
            self.metrics.bias_resets += 1;
            trace!(series = %id, "series bias reset");
        }
        Ok(())
    }

    /// Move the data back to the start of the buffer, making the head
    /// slack available at the tail
    pub fn reset_bias(&mut self, id: SeriesId) -> Result<(), SeriesError> {
        self.check_mutable(id)?;
        let header = self.header_mut(id);
        if header.bias == 0 {
            return Ok(());
        }
        let moved = (header.tail as usize + 1) * header.wide();
        // SAFETY: tail + 1 elements starting at data fit from base
        unsafe { copy(header.data(), header.base(), moved) };
        header.bias = 0;
        self.metrics.bytes_moved += moved as u64;
        Ok(())
    }

    /// Move a series into the smallest buffer that holds its content.
    /// Returns whether a new buffer was used.
    pub fn shrink_series(&mut self, id: SeriesId) -> Result<bool, SeriesError> {
        self.check_mutable(id)?;
        let header = self.header(id);
        let tail = header.tail as usize;
        let wide = header.wide();
        let units = tail + 1;

        let capacity = header.rest as usize * wide;
        if self.pools.granted_for(units * wide, false) >= capacity {
            self.reset_bias(id)?;
            return Ok(false);
        }

        let (storage, rest) = self.allocate(units, wide, false)?;
        let new_base = Self::storage_base(id, &storage);

        let header = self.header_mut(id);
        // SAFETY: the new buffer holds tail + 1 elements
        unsafe { copy_nonoverlapping(header.data(), new_base, units * wide) };
        let old_storage = replace(&mut header.storage, storage);
        header.rest = rest;
        header.bias = 0;
        header.flags.remove(SeriesFlags::POWER_OF_2);

        self.release(old_storage);
        self.metrics.shrinks += 1;
        self.metrics.bytes_moved += (units * wide) as u64;
        Ok(true)
    }

    /// Empty a series, keeping its buffer
    pub fn clear_series(&mut self, id: SeriesId) -> Result<(), SeriesError> {
        self.check_mutable(id)?;
        let header = self.header_mut(id);
        header.tail = 0;
        header.bias = 0;
        header.terminate();
        Ok(())
    }

    /// Copy a whole series into a new series
    pub fn copy_series(&mut self, id: SeriesId) -> Result<SeriesId, SeriesError> {
        let len = self.len(id);
        self.copy_part(id, 0, len)
    }

    /// Copy up to `len` elements starting at `index` into a new series
    pub fn copy_part(
        &mut self,
        id: SeriesId,
        index: usize,
        len: usize,
    ) -> Result<SeriesId, SeriesError> {
        let header = self.header(id);
        let tail = header.tail as usize;
        let wide = header.wide();
        if index > tail {
            return Err(SeriesError::BadIndex { index, len: tail });
        }
        let len = min(len, tail - index);

        let copy_id = self.make_series(len, wide, false)?;
        let (src, opaque) = (self.header(id).data(), self.is_opaque(id));
        let target = self.header_mut(copy_id);
        target.flags.set(SeriesFlags::OPAQUE, opaque);
        // SAFETY: distinct buffers; target has room for len + 1
        unsafe { copy_nonoverlapping(src.add(index * wide), target.data(), len * wide) };
        target.tail = len as u32;
        target.terminate();
        Ok(copy_id)
    }

    /// Elements of a series as a slice
    pub fn slice<T: Element>(&self, id: SeriesId) -> &[T] {
        let header = self.header(id);
        Self::check_width::<T>(id, header);
        // SAFETY: data is non-null and aligned for T (see
        // check_width); the first `tail` elements are initialised
        unsafe { from_raw_parts(header.data() as *const T, header.tail as usize) }
    }

    /// Mutable slice of the elements of a series
    pub fn slice_mut<T: Element>(&mut self, id: SeriesId) -> Result<&mut [T], SeriesError> {
        self.check_mutable(id)?;
        Self::check_width::<T>(id, self.header(id));
        self.note_layout::<T>(id);
        let header = self.header(id);
        let (data, len) = (header.data() as *mut T, header.tail as usize);
        // SAFETY: as for slice; &mut self guarantees exclusivity
        Ok(unsafe { from_raw_parts_mut(data, len) })
    }

    /// The used bytes of a series, or `None` when its elements carry
    /// padding
    pub fn bytes(&self, id: SeriesId) -> Option<&[u8]> {
        if self.is_opaque(id) {
            return None;
        }
        let header = self.header(id);
        // SAFETY: only plain elements were written, so tail * wide
        // bytes from data are initialised
        Some(unsafe { from_raw_parts(header.data(), header.tail as usize * header.wide()) })
    }

    pub fn get<T: Element>(&self, id: SeriesId, index: usize) -> Option<T> {
        self.slice::<T>(id).get(index).copied()
    }

    pub fn set<T: Element>(
        &mut self,
        id: SeriesId,
        index: usize,
        value: T,
    ) -> Result<(), SeriesError> {
        let slice = self.slice_mut::<T>(id)?;
        let len = slice.len();
        match slice.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(SeriesError::BadIndex { index, len }),
        }
    }

    /// Insert `items` at `index`
    pub fn insert<T: Element>(
        &mut self,
        id: SeriesId,
        index: usize,
        items: &[T],
    ) -> Result<(), SeriesError> {
        Self::check_width::<T>(id, self.header(id));
        self.expand_series(id, index, items.len())?;
        self.note_layout::<T>(id);
        let data = self.header(id).data() as *mut T;
        // SAFETY: expand_series opened items.len() slots at index
        unsafe { copy_nonoverlapping(items.as_ptr(), data.add(index), items.len()) };
        Ok(())
    }

    /// Append `items` at the tail
    pub fn append<T: Element>(&mut self, id: SeriesId, items: &[T]) -> Result<(), SeriesError> {
        let tail = self.len(id);
        self.insert(id, tail, items)
    }

    pub fn push<T: Element>(&mut self, id: SeriesId, item: T) -> Result<(), SeriesError> {
        self.append(id, &[item])
    }

    /// Used length in elements
    pub fn len(&self, id: SeriesId) -> usize {
        self.header(id).tail as usize
    }

    pub fn is_empty(&self, id: SeriesId) -> bool {
        self.len(id) == 0
    }

    /// Element width in bytes
    pub fn wide(&self, id: SeriesId) -> usize {
        self.header(id).wide()
    }

    /// Capacity of the buffer in elements (including bias and terminator)
    pub fn rest(&self, id: SeriesId) -> usize {
        self.header(id).rest as usize
    }

    /// Unused elements at the head of the buffer
    pub fn bias(&self, id: SeriesId) -> usize {
        self.header(id).bias as usize
    }

    pub fn flags(&self, id: SeriesId) -> SeriesFlags {
        self.header(id).flags
    }

    /// Set or clear flags. `OPAQUE` is tracked by the heap and ignored.
    pub fn set_flags(&mut self, id: SeriesId, flags: SeriesFlags, on: bool) {
        let flags = flags - SeriesFlags::OPAQUE;
        self.header_mut(id).flags.set(flags, on)
    }

    /// Protect (or unprotect) a series against modification
    pub fn protect(&mut self, id: SeriesId, on: bool) {
        self.set_flags(id, SeriesFlags::PROTECTED, on)
    }

    pub fn is_protected(&self, id: SeriesId) -> bool {
        self.flags(id).contains(SeriesFlags::PROTECTED)
    }

    /// Whether elements with padding bytes were written to a series
    pub fn is_opaque(&self, id: SeriesId) -> bool {
        self.flags(id).contains(SeriesFlags::OPAQUE)
    }

    pub fn mark(&mut self, id: SeriesId) {
        self.set_flags(id, SeriesFlags::MARK, true)
    }

    pub fn unmark(&mut self, id: SeriesId) {
        self.set_flags(id, SeriesFlags::MARK, false)
    }

    pub fn is_marked(&self, id: SeriesId) -> bool {
        self.flags(id).contains(SeriesFlags::MARK)
    }

    /// Whether `id` currently refers to an allocated series
    pub fn is_live(&self, id: SeriesId) -> bool {
        self.headers
            .get(id.index())
            .map_or(false, |header| !header.is_free())
    }

    /// All allocated series
    pub fn live_series(&self) -> impl Iterator<Item = SeriesId> + '_ {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, header)| !header.is_free())
            .map(|(i, _)| SeriesId::new(i as u32))
    }

    /// Whether the element at tail is all zero bytes
    pub fn is_terminated(&self, id: SeriesId) -> bool {
        let header = self.header(id);
        let wide = header.wide();
        // SAFETY: the terminator slot is inside the buffer
        let terminator =
            unsafe { from_raw_parts(header.data().add(header.tail as usize * wide), wide) };
        terminator.iter().all(|b| *b == 0)
    }

    /// Remaining ballast in bytes (negative once exhausted)
    pub fn ballast(&self) -> isize {
        self.ballast
    }

    /// Whether allocation has exhausted the ballast since the last
    /// recycle
    pub fn collection_signal(&self) -> bool {
        self.collection_signal
    }

    /// Whether the collector should run at the next safe point
    pub fn collection_pending(&self) -> bool {
        self.collection_signal && self.critical == 0
    }

    /// Enter a section during which collection must not run
    pub fn disable_collection(&mut self) {
        self.critical += 1;
    }

    /// Leave a section entered with [`Heap::disable_collection`]
    pub fn enable_collection(&mut self) {
        self.critical = self.critical.saturating_sub(1);
    }

    /// Called by the collector once a collection has completed:
    /// restores the ballast and hands head slack back to the tail of
    /// unprotected series.
    pub fn recycle(&mut self) -> RecycleReport {
        self.ballast = self.ballast_reset;
        self.collection_signal = false;
        self.expansions.clear();

        let mut report = RecycleReport::default();
        for header in self.headers.iter_mut().filter(|h| {
            !h.is_free() && h.bias > 0 && !h.flags.contains(SeriesFlags::PROTECTED)
        }) {
            let wide = header.wide();
            report.series_rebased += 1;
            report.slack_reclaimed += header.bias as usize * wide;
            // SAFETY: as for reset_bias
            unsafe {
                copy(
                    header.data(),
                    header.base(),
                    (header.tail as usize + 1) * wide,
                )
            };
            header.bias = 0;
        }

        debug!(
            rebased = report.series_rebased,
            reclaimed = report.slack_reclaimed,
            "heap recycled"
        );
        report
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_series: self.live_series().count(),
            bytes_in_use: self.pools.bytes_in_use(),
            reserved_bytes: self.pools.reserved_bytes(),
            system_bytes: self.pools.system_bytes(),
            ballast: self.ballast,
            collection_signal: self.collection_signal,
            pools: self.pools.stats(),
            series: self.metrics.clone(),
        }
    }

    /// Summary of pool usage
    pub fn dump_pools(&self) -> String {
        self.pools.dump()
    }

    /// Header fields and a hex dump of a series' content
    pub fn dump_series(&self, id: SeriesId) -> String {
        let header = self.header(id);
        let pool = header
            .storage
            .pool()
            .map_or_else(|| "free".to_string(), |p| p.to_string());
        let content = if header.flags.contains(SeriesFlags::OPAQUE) {
            "(padded elements)".to_string()
        } else {
            // SAFETY: content plus terminator is initialised for plain
            // elements
            let raw = unsafe {
                from_raw_parts(header.data(), (header.tail as usize + 1) * header.wide())
            };
            pretty_hex(&raw)
        };
        format!(
            "{} wide {} tail {} rest {} bias {} flags {:?} {}\n{}",
            id,
            header.wide,
            header.tail,
            header.rest,
            header.bias,
            header.flags,
            pool,
            content
        )
    }

    fn install(&mut self, header: SeriesHeader) -> SeriesId {
        if let Some(index) = self.free_headers.pop() {
            self.headers[index as usize] = header;
            SeriesId::new(index)
        } else {
            let index = match u32::try_from(self.headers.len()) {
                Ok(index) => index,
                Err(_) => crash(Fatal::NoMemory, format_args!("series header slab full")),
            };
            self.headers.push(header);
            SeriesId::new(index)
        }
    }

    /// Obtain a buffer for `units` elements of `wide` bytes, returning
    /// it with its capacity in elements
    fn allocate(
        &mut self,
        units: usize,
        wide: usize,
        pow2: bool,
    ) -> Result<(Storage, u32), SeriesError> {
        let requested = (units as u64).saturating_mul(wide as u64);
        if requested > MAX_SERIES_BYTES {
            return Err(SeriesError::SizeLimit {
                requested,
                max: MAX_SERIES_BYTES,
            });
        }

        let size = requested as usize;
        let pool = find_pool(size);
        let (storage, granted) = if pool.is_system() {
            let block = self.pools.make_system(size, pow2);
            let granted = block.allocated_size();
            (Storage::System(block), granted)
        } else {
            let ptr = self.pools.make_node(pool);
            (Storage::Node { pool, ptr }, self.pools.wide(pool))
        };

        self.consume_ballast(granted);
        let rest = min(granted / wide, u32::MAX as usize) as u32;
        Ok((storage, rest))
    }

    fn release(&mut self, storage: Storage) {
        match storage {
            Storage::Free => {}
            Storage::Node { pool, ptr } => self.pools.free_node(pool, ptr),
            Storage::System(block) => self.pools.free_system(block),
        }
    }

    fn consume_ballast(&mut self, granted: usize) {
        self.ballast = self.ballast.saturating_sub(granted as isize);
        if self.ballast <= 0 && !self.collection_signal {
            self.collection_signal = true;
            debug!(ballast = self.ballast, "collection requested");
        }
    }

    fn check_mutable(&self, id: SeriesId) -> Result<(), SeriesError> {
        if self.header(id).flags.contains(SeriesFlags::PROTECTED) {
            Err(SeriesError::Protected)
        } else {
            Ok(())
        }
    }

    /// Units for tail + delta elements plus terminator, within limits
    fn checked_units(tail: usize, delta: usize, wide: usize) -> Result<usize, SeriesError> {
        let units = (tail as u64)
            .saturating_add(delta as u64)
            .saturating_add(1);
        let requested = units.saturating_mul(wide as u64);
        if requested > MAX_SERIES_BYTES {
            Err(SeriesError::SizeLimit {
                requested,
                max: MAX_SERIES_BYTES,
            })
        } else {
            Ok(units as usize)
        }
    }

    /// Flag a series once a type with padding is written to it
    fn note_layout<T: Element>(&mut self, id: SeriesId) {
        if !T::PLAIN {
            self.header_mut(id).flags.insert(SeriesFlags::OPAQUE);
        }
    }

    fn check_width<T: Element>(id: SeriesId, header: &SeriesHeader) {
        assert_eq!(
            size_of::<T>(),
            header.wide(),
            "element width mismatch for {id}"
        );
        assert!(
            !(T::PLAIN && header.flags.contains(SeriesFlags::OPAQUE)),
            "plain view of padded elements in {id}"
        );
        debug_assert!(align_of::<T>() <= 8);
        debug_assert_eq!(header.data() as usize % align_of::<T>(), 0);
    }

    fn storage_base(id: SeriesId, storage: &Storage) -> *mut u8 {
        match storage.base() {
            Some(base) => base.as_ptr(),
            None => crash(Fatal::BadSeries, format_args!("{id} has no buffer")),
        }
    }

    fn header(&self, id: SeriesId) -> &SeriesHeader {
        match self.headers.get(id.index()) {
            Some(header) if !header.is_free() => header,
            _ => crash(Fatal::BadSeries, format_args!("{id} is not allocated")),
        }
    }

    fn header_mut(&mut self, id: SeriesId) -> &mut SeriesHeader {
        match self.headers.get_mut(id.index()) {
            Some(header) if !header.is_free() => header,
            _ => crash(Fatal::BadSeries, format_args!("{id} is not allocated")),
        }
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::value::Value;

    fn invariant(heap: &Heap, id: SeriesId) {
        assert!(heap.bias(id) + heap.len(id) < heap.rest(id));
        assert!(heap.is_terminated(id));
    }

    #[test]
    pub fn test_make_series_is_terminated() {
        let mut heap = Heap::default();
        let id = heap.make_series(10, 4, false).unwrap();
        assert_eq!(heap.len(id), 0);
        assert_eq!(heap.wide(id), 4);
        assert!(heap.rest(id) >= 11);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_bad_width() {
        let mut heap = Heap::default();
        assert_eq!(
            heap.make_series(1, 0, false),
            Err(SeriesError::BadWidth(0))
        );
    }

    #[test]
    pub fn test_size_limit() {
        let mut heap = Heap::default();
        let err = heap.make_series(u32::MAX as usize, 2, false).unwrap_err();
        assert!(matches!(err, SeriesError::SizeLimit { .. }));

        let id = heap.make::<u64>(0).unwrap();
        let err = heap.expand_series(id, 0, usize::MAX / 16).unwrap_err();
        assert!(matches!(err, SeriesError::SizeLimit { .. }));
        assert_eq!(heap.len(id), 0);
    }

    #[test]
    pub fn test_append_and_read() {
        let mut heap = Heap::default();
        let id = heap.make::<u32>(0).unwrap();
        for i in 0..1000u32 {
            heap.push(id, i).unwrap();
            invariant(&heap, id);
        }
        assert_eq!(heap.slice::<u32>(id), (0..1000).collect::<Vec<_>>().as_slice());
    }

    #[test]
    pub fn test_insert_within_capacity() {
        let mut heap = Heap::default();
        let id = heap.make::<u16>(16).unwrap();
        heap.append(id, &[1u16, 2, 5, 6]).unwrap();
        let rest = heap.rest(id);
        heap.insert(id, 2, &[3u16, 4]).unwrap();
        assert_eq!(heap.rest(id), rest);
        assert_eq!(heap.slice::<u16>(id), &[1, 2, 3, 4, 5, 6]);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_head_insert_uses_bias() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[1u64, 2, 3, 4]).unwrap();
        heap.remove_series(id, 0, 2).unwrap();
        assert_eq!(heap.bias(id), 2);
        let moved = heap.stats().series.bytes_moved;

        heap.expand_series(id, 0, 2).unwrap();
        assert_eq!(heap.bias(id), 0);
        assert_eq!(heap.stats().series.bytes_moved, moved);
        assert_eq!(heap.slice::<u64>(id), &[0, 0, 3, 4]);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_relocation_preserves_content() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[1u8, 2, 3]).unwrap();
        let rest = heap.rest(id);
        let filler: Vec<u8> = (0..rest as u8).collect();
        heap.insert(id, 1, &filler).unwrap();

        let content = heap.slice::<u8>(id);
        assert_eq!(content.len(), 3 + filler.len());
        assert_eq!(content[0], 1);
        assert_eq!(&content[1..=filler.len()], filler.as_slice());
        assert_eq!(&content[filler.len() + 1..], &[2, 3]);
        assert_eq!(heap.stats().series.relocations, 1);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_repeat_relocation_doubles() {
        let mut heap = Heap::default();
        let id = heap.make::<u64>(0).unwrap();
        heap.append(id, &[0u64; 600]).unwrap();
        assert_eq!(heap.stats().series.relocations, 1);
        let first = heap.rest(id);

        heap.append(id, &[0u64; 600]).unwrap();
        assert_eq!(heap.stats().series.relocations, 2);
        // recently relocated: (1200 + 1) * 2 elements requested
        assert!(heap.rest(id) >= 2402);
        assert!(heap.rest(id) > first);
    }

    #[test]
    pub fn test_head_removal_accumulates_bias() {
        let settings = RuntimeSettings::default().with_max_bias(64);
        let mut heap = Heap::new(&settings);
        let items: Vec<u32> = (0..1000).collect();
        let id = heap.make_from(&items).unwrap();

        for i in 0..64 {
            heap.remove_series(id, 0, 1).unwrap();
            assert_eq!(heap.bias(id), i + 1);
        }
        assert_eq!(heap.stats().series.bias_resets, 0);

        heap.remove_series(id, 0, 1).unwrap();
        assert_eq!(heap.bias(id), 0);
        assert_eq!(heap.stats().series.bias_resets, 1);
        assert_eq!(heap.get::<u32>(id, 0), Some(65));
        assert_eq!(heap.len(id), 1000 - 65);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_remove_middle_and_past_end() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[1u32, 2, 3, 4, 5]).unwrap();
        heap.remove_series(id, 1, 2).unwrap();
        assert_eq!(heap.slice::<u32>(id), &[1, 4, 5]);
        heap.remove_series(id, 2, 10).unwrap();
        assert_eq!(heap.slice::<u32>(id), &[1, 4]);
        heap.remove_series(id, 2, 1).unwrap();
        assert_eq!(
            heap.remove_series(id, 3, 1),
            Err(SeriesError::BadIndex { index: 3, len: 2 })
        );
        invariant(&heap, id);
    }

    #[test]
    pub fn test_protected_series_rejects_mutation() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[1u32, 2, 3]).unwrap();
        heap.protect(id, true);
        let (tail, rest) = (heap.len(id), heap.rest(id));

        assert_eq!(heap.expand_series(id, 0, 100), Err(SeriesError::Protected));
        assert_eq!(heap.remove_series(id, 0, 1), Err(SeriesError::Protected));
        assert_eq!(heap.set(id, 0, 9u32), Err(SeriesError::Protected));
        assert_eq!((heap.len(id), heap.rest(id)), (tail, rest));

        heap.protect(id, false);
        heap.set(id, 0, 9u32).unwrap();
        assert_eq!(heap.get::<u32>(id, 0), Some(9));
    }

    #[test]
    pub fn test_protected_series_keeps_buffer() {
        let mut heap = Heap::default();
        let id = heap.make::<u64>(1000).unwrap();
        heap.append(id, &[1u64, 2, 3]).unwrap();
        heap.remove_series(id, 0, 1).unwrap();
        heap.protect(id, true);
        let (rest, bias) = (heap.rest(id), heap.bias(id));

        assert_eq!(heap.shrink_series(id), Err(SeriesError::Protected));
        assert_eq!(heap.reset_bias(id), Err(SeriesError::Protected));
        assert_eq!((heap.rest(id), heap.bias(id)), (rest, bias));
        assert_eq!(heap.slice::<u64>(id), &[2, 3]);

        heap.protect(id, false);
        assert!(heap.shrink_series(id).unwrap());
        assert!(heap.rest(id) < rest);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_fixed_size() {
        let mut heap = Heap::default();
        let id = heap.make::<u64>(1).unwrap();
        heap.set_flags(id, SeriesFlags::FIXED_SIZE, true);
        let room = heap.rest(id) - 1;
        heap.append(id, &vec![7u64; room]).unwrap();
        assert_eq!(heap.push(id, 8u64), Err(SeriesError::FixedSize));
    }

    #[test]
    pub fn test_large_series_use_system_pool() {
        let mut heap = Heap::default();
        let id = heap.make_series(10_000, 1, false).unwrap();
        assert_eq!(heap.stats().system_bytes, 10_240);
        assert_eq!(heap.rest(id), 10_240);

        let pow2 = heap.make_series(10_000, 1, true).unwrap();
        assert_eq!(heap.rest(pow2), 16_384);
        assert!(heap.flags(pow2).contains(SeriesFlags::POWER_OF_2));

        heap.free_series(id);
        heap.free_series(pow2);
        assert_eq!(heap.stats().system_bytes, 0);
    }

    #[test]
    pub fn test_ballast_signals_collection() {
        let settings = RuntimeSettings::default().with_ballast(1000);
        let mut heap = Heap::new(&settings);
        heap.make_series(100, 4, false).unwrap();
        assert!(!heap.collection_signal());

        heap.disable_collection();
        heap.make_series(1000, 4, false).unwrap();
        assert!(heap.collection_signal());
        assert!(!heap.collection_pending());
        heap.enable_collection();
        assert!(heap.collection_pending());

        heap.recycle();
        assert!(!heap.collection_pending());
        assert_eq!(heap.ballast(), 1000);
    }

    #[test]
    pub fn test_recycle_rebases_biased_series() {
        let mut heap = Heap::default();
        let a = heap.make_from(&[1u32, 2, 3, 4]).unwrap();
        let b = heap.make_from(&[1u32, 2, 3, 4]).unwrap();
        heap.remove_series(a, 0, 2).unwrap();
        heap.remove_series(b, 0, 2).unwrap();
        heap.protect(b, true);

        let report = heap.recycle();
        assert_eq!(report.series_rebased, 1);
        assert_eq!(report.slack_reclaimed, 8);
        assert_eq!(heap.bias(a), 0);
        assert_eq!(heap.slice::<u32>(a), &[3, 4]);
        assert_eq!(heap.bias(b), 2);
    }

    #[test]
    pub fn test_shrink_series() {
        let mut heap = Heap::default();
        let id = heap.make::<u64>(1000).unwrap();
        heap.append(id, &[1u64, 2, 3]).unwrap();
        assert!(heap.shrink_series(id).unwrap());
        assert_eq!(heap.slice::<u64>(id), &[1, 2, 3]);
        assert!(heap.rest(id) < 1000);
        invariant(&heap, id);

        assert!(!heap.shrink_series(id).unwrap());
    }

    #[test]
    pub fn test_reset_bias() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[1u16, 2, 3, 4]).unwrap();
        heap.remove_series(id, 0, 3).unwrap();
        heap.reset_bias(id).unwrap();
        assert_eq!(heap.bias(id), 0);
        assert_eq!(heap.slice::<u16>(id), &[4]);
        invariant(&heap, id);
    }

    #[test]
    pub fn test_copy_part_and_clear() {
        let mut heap = Heap::default();
        let id = heap.make_from(b"hello world").unwrap();
        let word = heap.copy_part(id, 6, 100).unwrap();
        assert_eq!(heap.bytes(word), Some(&b"world"[..]));
        invariant(&heap, word);

        heap.clear_series(id).unwrap();
        assert!(heap.is_empty(id));
        invariant(&heap, id);
    }

    #[test]
    pub fn test_free_and_reuse_headers() {
        let mut heap = Heap::default();
        let a = heap.make::<u8>(4).unwrap();
        let _b = heap.make::<u8>(4).unwrap();
        heap.free_series(a);
        assert!(!heap.is_live(a));
        assert_eq!(heap.stats().live_series, 1);

        let c = heap.make::<u8>(4).unwrap();
        assert_eq!(a, c);
        assert!(heap.is_live(c));
    }

    #[test]
    pub fn test_pool_accounting_returns_to_zero() {
        let mut heap = Heap::default();
        let ids: Vec<_> = (0..50)
            .map(|i| heap.make_series(i * 10, 8, false).unwrap())
            .collect();
        assert!(heap.stats().bytes_in_use > 0);
        for id in ids {
            heap.free_series(id);
        }
        assert_eq!(heap.stats().bytes_in_use, 0);
    }

    #[test]
    pub fn test_dump_series() {
        let mut heap = Heap::default();
        let id = heap.make_from(b"abc").unwrap();
        let dump = heap.dump_series(id);
        assert!(dump.starts_with(&format!("{id} wide 1 tail 3")));
        assert!(dump.contains("61 62 63"));
    }

    #[test]
    pub fn test_padded_elements_have_no_byte_view() {
        let mut heap = Heap::default();
        let id = heap.make_from(&[Value::Integer(1), Value::Logic(true)]).unwrap();
        assert!(heap.is_opaque(id));
        assert_eq!(heap.bytes(id), None);

        let dump = heap.dump_series(id);
        assert!(dump.contains("(padded elements)"));
        assert!(!dump.contains("Length:"));

        let copy = heap.copy_series(id).unwrap();
        assert!(heap.is_opaque(copy));
        assert_eq!(heap.get::<Value>(copy, 0), Some(Value::Integer(1)));

        heap.set_flags(copy, SeriesFlags::OPAQUE, false);
        assert!(heap.is_opaque(copy));

        let plain = heap.make_from(&[7u64]).unwrap();
        assert!(!heap.is_opaque(plain));
        assert_eq!(heap.bytes(plain).map(|b| b.len()), Some(8));
    }

    #[test]
    #[should_panic(expected = "plain view of padded elements")]
    pub fn test_plain_view_of_padded_series_panics() {
        #[derive(Clone, Copy)]
        struct Raw([u8; size_of::<Value>()]);
        unsafe impl Element for Raw {
            const PLAIN: bool = true;
        }

        let mut heap = Heap::default();
        let id = heap.make::<Value>(1).unwrap();
        heap.push(id, Value::Integer(1)).unwrap();
        let _ = heap.slice::<Raw>(id);
    }
}
