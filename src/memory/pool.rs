//! Size-classed pool allocator
//!
//! Each pool hands out nodes of one fixed width. Nodes are carved out
//! of segments obtained from the system heap and unused nodes are
//! threaded onto an intrusive free list: the first word of a free node
//! holds the pointer to the next free node.
//!
//! Requests larger than [`BIG_SIZE`] bypass the pools and are served
//! by the system pool (see [`super::system`]).

use std::fmt;
use std::ptr::{self, NonNull};

use itertools::Itertools;
use tracing::debug;

use super::segment::Segment;
use super::system::SystemBlock;
use crate::fatal::{crash, Fatal};

/// Width and segment size of a size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    /// Width of every node in bytes
    pub wide: usize,
    /// Nodes per segment
    pub units: usize,
}

const fn spec(wide: usize, units: usize) -> PoolSpec {
    PoolSpec { wide, units }
}

/// The size classes, smallest first
pub const POOL_SPECS: [PoolSpec; 22] = [
    spec(8, 256),
    spec(16, 256),
    spec(32, 512),
    spec(48, 1024),
    spec(64, 512),
    spec(80, 256),
    spec(96, 128),
    spec(112, 128),
    spec(128, 64),
    spec(144, 64),
    spec(160, 64),
    spec(192, 64),
    spec(224, 64),
    spec(256, 64),
    spec(320, 32),
    spec(384, 16),
    spec(448, 16),
    spec(512, 8),
    spec(1024, 16),
    spec(2048, 8),
    spec(3072, 4),
    spec(4096, 4),
];

/// Largest request served from a pool
pub const BIG_SIZE: usize = 4096;

lazy_static! {
    /// Size (in bytes) to the smallest pool able to hold it
    static ref POOL_MAP: Vec<u8> = {
        let mut map = Vec::with_capacity(BIG_SIZE + 1);
        let mut pool = 0;
        for size in 0..=BIG_SIZE {
            while POOL_SPECS[pool].wide < size {
                pool += 1;
            }
            map.push(pool as u8);
        }
        map
    };
}

/// Identifies a size class or the system pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u8);

impl PoolId {
    /// Oversized allocations straight from the system heap
    pub const SYSTEM: PoolId = PoolId(u8::MAX);

    pub fn is_system(self) -> bool {
        self == PoolId::SYSTEM
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            write!(f, "pool#system")
        } else {
            write!(f, "pool#{}", self.0)
        }
    }
}

/// O(1) size class lookup
pub fn find_pool(size: usize) -> PoolId {
    if size <= BIG_SIZE {
        PoolId(POOL_MAP[size])
    } else {
        PoolId::SYSTEM
    }
}

/// Telemetry for a single size class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub wide: usize,
    pub units: usize,
    /// Segments allocated so far
    pub segments: usize,
    /// Nodes on the free list
    pub free: usize,
    /// Nodes handed out and not returned
    pub in_use: usize,
}

/// A single size class
struct Pool {
    spec: PoolSpec,
    /// Segments (never released until the pool is dropped)
    segments: Vec<Segment>,
    /// Head of the intrusive free list
    free: Option<NonNull<u8>>,
    free_count: usize,
    in_use: usize,
}

impl Pool {
    fn new(spec: PoolSpec) -> Self {
        Pool {
            spec,
            segments: vec![],
            free: None,
            free_count: 0,
            in_use: 0,
        }
    }

    /// Allocate a new segment and thread all its nodes onto the free
    /// list, lowest address first.
    fn fill(&mut self) {
        let size = self.spec.wide * self.spec.units;
        let segment = Segment::new(size).unwrap_or_else(|e| {
            crash(
                Fatal::NoMemory,
                format_args!("pool of width {} needs {} bytes: {:?}", self.spec.wide, size, e),
            )
        });

        let base = segment.as_ptr();
        for unit in (0..self.spec.units).rev() {
            // SAFETY: unit * wide < size so the node is inside the
            // segment; nodes are 8-byte aligned (see SEGMENT_ALIGN)
            unsafe {
                let node = base.add(unit * self.spec.wide);
                self.push_free(NonNull::new_unchecked(node));
            }
        }

        self.segments.push(segment);
        debug!(
            wide = self.spec.wide,
            segments = self.segments.len(),
            "pool segment added"
        );
    }

    /// # Safety
    ///
    /// `node` must be a node of this pool that is not in use
    unsafe fn push_free(&mut self, node: NonNull<u8>) {
        ptr::write(node.as_ptr() as *mut Option<NonNull<u8>>, self.free);
        self.free = Some(node);
        self.free_count += 1;
    }

    fn take(&mut self) -> NonNull<u8> {
        if self.free.is_none() {
            self.fill();
        }

        let node = match self.free {
            Some(node) => node,
            None => crash(
                Fatal::CorruptFreeList,
                format_args!("pool of width {} empty after refill", self.spec.wide),
            ),
        };

        if cfg!(debug_assertions) && !self.segments.iter().any(|s| s.contains(node)) {
            crash(
                Fatal::CorruptFreeList,
                format_args!("node {:p} not in pool of width {}", node, self.spec.wide),
            );
        }

        // SAFETY: every node on the free list holds the next pointer
        // in its first word (written by push_free)
        self.free = unsafe { ptr::read(node.as_ptr() as *const Option<NonNull<u8>>) };
        self.free_count -= 1;
        self.in_use += 1;
        node
    }

    fn give(&mut self, node: NonNull<u8>) {
        // SAFETY: caller returns a node previously obtained from take
        unsafe { self.push_free(node) };
        self.in_use -= 1;
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            wide: self.spec.wide,
            units: self.spec.units,
            segments: self.segments.len(),
            free: self.free_count,
            in_use: self.in_use,
        }
    }
}

/// All size classes plus system pool accounting
pub struct Pools {
    pools: Vec<Pool>,
    /// Bytes granted from pools and the system pool and not yet freed
    bytes_in_use: usize,
    /// Bytes currently held in system pool blocks
    system_bytes: usize,
    /// Rounding for system pool blocks
    system_align: usize,
}

impl Pools {
    pub fn new(system_align: usize) -> Self {
        Pools {
            pools: POOL_SPECS.iter().copied().map(Pool::new).collect(),
            bytes_in_use: 0,
            system_bytes: 0,
            system_align,
        }
    }

    /// Width of nodes in the given pool
    pub fn wide(&self, pool: PoolId) -> usize {
        self.pools[pool.index()].spec.wide
    }

    /// Obtain an uninitialised node from the pool, growing the pool
    /// if its free list is empty.
    pub fn make_node(&mut self, pool: PoolId) -> NonNull<u8> {
        let pool = &mut self.pools[pool.index()];
        let node = pool.take();
        self.bytes_in_use += pool.spec.wide;
        node
    }

    /// Return a node to its pool. The node must not be used afterwards.
    pub fn free_node(&mut self, pool: PoolId, node: NonNull<u8>) {
        let pool = &mut self.pools[pool.index()];
        pool.give(node);
        self.bytes_in_use -= pool.spec.wide;
    }

    /// Allocate an oversized buffer from the system heap
    pub fn make_system(&mut self, size: usize, pow2: bool) -> SystemBlock {
        let block = SystemBlock::new(size, pow2, self.system_align);
        self.system_bytes += block.allocated_size();
        self.bytes_in_use += block.allocated_size();
        block
    }

    /// Release an oversized buffer
    pub fn free_system(&mut self, block: SystemBlock) {
        self.system_bytes -= block.allocated_size();
        self.bytes_in_use -= block.allocated_size();
        drop(block);
    }

    /// Bytes that a request of `size` would actually be granted
    pub fn granted_for(&self, size: usize, pow2: bool) -> usize {
        let pool = find_pool(size);
        if pool.is_system() {
            SystemBlock::rounded_size(size, pow2, self.system_align)
        } else {
            self.wide(pool)
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub fn system_bytes(&self) -> usize {
        self.system_bytes
    }

    /// Bytes reserved in segments whether in use or not
    pub fn reserved_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| p.segments.len() * p.spec.wide * p.spec.units)
            .sum::<usize>()
            + self.system_bytes
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(Pool::stats).collect()
    }

    /// One line per size class that has ever been used
    pub fn dump(&self) -> String {
        self.pools
            .iter()
            .filter(|p| !p.segments.is_empty())
            .map(|p| {
                let s = p.stats();
                format!(
                    "{:>5}B x{:<5} segs {:<4} used {:<6} free {:<6}",
                    s.wide, s.units, s.segments, s.in_use, s.free
                )
            })
            .chain(std::iter::once(format!(
                "system {} bytes, {} bytes in use",
                self.system_bytes, self.bytes_in_use
            )))
            .join("\n")
    }
}

impl fmt::Debug for Pools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.dump())
    }
}
