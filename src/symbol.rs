//! Symbol interning
//!
//! Word spellings are interned into an append-only table of entries
//! held in series. Spellings that differ only in case share a
//! canonical id (the index of the first spelling registered) and are
//! linked into an alias chain starting at the canonical entry. Only
//! canonical entries are placed in the open-addressed hash index; the
//! index is rebuilt at the next prime size whenever it would become
//! more than half full.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use tracing::debug;

use crate::error::RuntimeError;
use crate::fatal::{crash, Fatal};
use crate::memory::{Element, Heap, SeriesId};

/// Interned symbol. Id 0 is never assigned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Sym(u32);

impl Sym {
    /// No symbol
    pub const NONE: Sym = Sym(0);
    /// The word `self`, always interned first
    pub const SELF: Sym = Sym(1);

    /// Return the raw index for diagnostics
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym#{}", self.0)
    }
}

unsafe impl Element for Sym {
    const PLAIN: bool = true;
}

/// Spelling returned for ids that do not name a symbol
pub const UNKNOWN_NAME: &[u8] = b"(unknown)";

/// Sizes the hash index steps through
pub const PRIMES: [u32; 22] = [
    7, 13, 31, 61, 127, 251, 509, 1021, 2039, 4093, 8191, 16381, 32749, 65521, 131071, 262139,
    524287, 1048573, 2097143, 4194301, 8388593, 16777213,
];

/// A symbol table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
struct WordEntry {
    /// Canonical id (own index for the first spelling)
    canon: u32,
    /// Next spelling in the alias chain, 0 at the end
    alias: u32,
    /// Offset of the spelling in the names series
    name: u32,
    /// Length of the spelling in bytes
    len: u32,
}

unsafe impl Element for WordEntry {
    const PLAIN: bool = true;
}

/// Case fold a spelling for hashing and canonical comparison
pub fn fold_case(bytes: &[u8]) -> Cow<'_, [u8]> {
    if !bytes.iter().any(|b| b.is_ascii_uppercase() || !b.is_ascii()) {
        return Cow::Borrowed(bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.is_ascii() => Cow::Owned(s.to_lowercase().into_bytes()),
        _ => Cow::Owned(bytes.to_ascii_lowercase()),
    }
}

/// 32-bit FNV-1a
fn hash_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |h, b| {
        (h ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Start bucket and skip for a hash in an index of `size`
/// buckets. The skip is never zero.
fn bucket_steps(hash: u32, size: usize) -> (usize, usize) {
    let hash = hash as usize;
    (hash % size, 1 + (hash / size) % (size - 1))
}

/// Smallest prime in the table not below `capacity`
fn prime_at_least(capacity: usize) -> usize {
    PRIMES
        .iter()
        .map(|p| *p as usize)
        .find(|p| *p >= capacity)
        .unwrap_or(PRIMES[PRIMES.len() - 1] as usize)
}

/// The symbol table
#[derive(Debug)]
pub struct SymbolTable {
    /// `WordEntry` per symbol, entry 0 unused
    entries: SeriesId,
    /// Spellings, concatenated
    names: SeriesId,
    /// Hash index of canonical entries (0 = empty bucket)
    hashes: SeriesId,
    /// Entries placed in the hash index
    canon_count: usize,
    resizes: usize,
}

impl SymbolTable {
    /// Create a table whose hash index starts with at least
    /// `capacity` buckets
    pub fn new(heap: &mut Heap, capacity: usize) -> Result<Self, RuntimeError> {
        let size = prime_at_least(capacity);

        let entries = heap.make::<WordEntry>(64)?;
        heap.push(entries, WordEntry::default())?;
        let names = heap.make::<u8>(1024)?;
        let hashes = heap.make::<u32>(size)?;
        heap.expand_series(hashes, 0, size)?;

        let mut table = SymbolTable {
            entries,
            names,
            hashes,
            canon_count: 0,
            resizes: 0,
        };
        let this = table.make_word(heap, b"self")?;
        debug_assert_eq!(this, Sym::SELF);
        Ok(table)
    }

    /// Intern a spelling, returning its symbol
    pub fn make_word(&mut self, heap: &mut Heap, bytes: &[u8]) -> Result<Sym, RuntimeError> {
        if (self.canon_count + 1) * 2 > heap.len(self.hashes) {
            self.resize(heap)?;
        }

        let folded = fold_case(bytes);
        let size = heap.len(self.hashes);
        let (mut bucket, skip) = bucket_steps(hash_bytes(&folded), size);

        loop {
            let index = heap.get::<u32>(self.hashes, bucket).unwrap_or(0);
            if index == 0 {
                let sym = self.push_entry(heap, bytes, None)?;
                heap.set(self.hashes, bucket, sym.0)?;
                self.canon_count += 1;
                return Ok(sym);
            }

            let canon = Sym(index);
            if *fold_case(self.get_name(heap, canon)) == *folded {
                let mut last = canon;
                for sym in self.alias_chain(heap, canon) {
                    if self.get_name(heap, sym) == bytes {
                        return Ok(sym);
                    }
                    last = sym;
                }
                let alias = self.push_entry(heap, bytes, Some(canon))?;
                let mut entry = self.entry(heap, last);
                entry.alias = alias.0;
                heap.set(self.entries, last.index(), entry)?;
                return Ok(alias);
            }

            bucket = (bucket + skip) % size;
        }
    }

    /// Look up a spelling without interning it
    pub fn find_word(&self, heap: &Heap, bytes: &[u8]) -> Option<Sym> {
        self.find_canon(heap, bytes).and_then(|canon| {
            self.alias_chain(heap, canon)
                .into_iter()
                .find(|sym| self.get_name(heap, *sym) == bytes)
        })
    }

    /// Canonical symbol for any case variant of a spelling, whether
    /// or not that variant has been interned
    pub fn find_canon(&self, heap: &Heap, bytes: &[u8]) -> Option<Sym> {
        let folded = fold_case(bytes);
        let size = heap.len(self.hashes);
        let (mut bucket, skip) = bucket_steps(hash_bytes(&folded), size);

        loop {
            let index = heap.get::<u32>(self.hashes, bucket).unwrap_or(0);
            if index == 0 {
                return None;
            }
            let canon = Sym(index);
            if *fold_case(self.get_name(heap, canon)) == *folded {
                return Some(canon);
            }
            bucket = (bucket + skip) % size;
        }
    }

    /// Spelling of a symbol
    pub fn get_name<'h>(&self, heap: &'h Heap, sym: Sym) -> &'h [u8] {
        if !self.contains(heap, sym) {
            return UNKNOWN_NAME;
        }
        let entry = self.entry(heap, sym);
        let start = entry.name as usize;
        &heap.slice::<u8>(self.names)[start..start + entry.len as usize]
    }

    /// Spelling of a symbol as text
    pub fn name_str<'h>(&self, heap: &'h Heap, sym: Sym) -> Cow<'h, str> {
        String::from_utf8_lossy(self.get_name(heap, sym))
    }

    /// Canonical symbol shared by all case variants of `sym`
    pub fn canon(&self, heap: &Heap, sym: Sym) -> Sym {
        if self.contains(heap, sym) {
            Sym(self.entry(heap, sym).canon)
        } else {
            Sym::NONE
        }
    }

    /// Compare two symbols. Case-insensitive comparison is equality
    /// of canonical ids; spellings only decide the order of symbols
    /// that are not equal.
    pub fn compare_word(&self, heap: &Heap, a: Sym, b: Sym, case_sensitive: bool) -> Ordering {
        if case_sensitive {
            return self.get_name(heap, a).cmp(self.get_name(heap, b));
        }
        if self.canon(heap, a) == self.canon(heap, b) {
            return Ordering::Equal;
        }
        fold_case(self.get_name(heap, a))
            .cmp(&fold_case(self.get_name(heap, b)))
            .then(a.cmp(&b))
    }

    /// Every spelling sharing the canonical id of `sym`, canonical
    /// spelling first
    pub fn alias_chain(&self, heap: &Heap, sym: Sym) -> Vec<Sym> {
        let mut chain = vec![];
        let mut next = self.canon(heap, sym);
        while !next.is_none() {
            chain.push(next);
            next = Sym(self.entry(heap, next).alias);
        }
        chain
    }

    /// Number of interned spellings
    pub fn len(&self, heap: &Heap) -> usize {
        heap.len(self.entries) - 1
    }

    /// Number of distinct canonical words
    pub fn canon_count(&self) -> usize {
        self.canon_count
    }

    /// Buckets in the hash index
    pub fn index_size(&self, heap: &Heap) -> usize {
        heap.len(self.hashes)
    }

    /// Times the hash index has been rebuilt
    pub fn resizes(&self) -> usize {
        self.resizes
    }

    fn contains(&self, heap: &Heap, sym: Sym) -> bool {
        !sym.is_none() && sym.index() < heap.len(self.entries)
    }

    fn entry(&self, heap: &Heap, sym: Sym) -> WordEntry {
        heap.get::<WordEntry>(self.entries, sym.index())
            .unwrap_or_default()
    }

    fn push_entry(
        &mut self,
        heap: &mut Heap,
        bytes: &[u8],
        canon: Option<Sym>,
    ) -> Result<Sym, RuntimeError> {
        let index = heap.len(self.entries) as u32;
        let name = heap.len(self.names) as u32;
        heap.append(self.names, bytes)?;
        heap.push(
            self.entries,
            WordEntry {
                canon: canon.map_or(index, |c| c.0),
                alias: 0,
                name,
                len: bytes.len() as u32,
            },
        )?;
        Ok(Sym(index))
    }

    /// Rebuild the hash index at the next prime size
    fn resize(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        let current = heap.len(self.hashes);
        let size = match PRIMES.iter().map(|p| *p as usize).find(|p| *p > current) {
            Some(size) => size,
            None => return Err(RuntimeError::SymbolTableFull(current)),
        };

        let hashes = heap.make::<u32>(size)?;
        heap.expand_series(hashes, 0, size)?;

        let mut placed = 0;
        for index in 1..heap.len(self.entries) {
            let sym = Sym(index as u32);
            if self.entry(heap, sym).canon != sym.0 {
                continue;
            }
            let folded = fold_case(self.get_name(heap, sym)).into_owned();
            let (mut bucket, skip) = bucket_steps(hash_bytes(&folded), size);
            while heap.get::<u32>(hashes, bucket).unwrap_or(0) != 0 {
                bucket = (bucket + skip) % size;
            }
            heap.set(hashes, bucket, sym.0)?;
            placed += 1;
        }

        if placed != self.canon_count {
            crash(
                Fatal::HashDesync,
                format_args!("placed {} of {} symbols", placed, self.canon_count),
            );
        }

        heap.free_series(self.hashes);
        self.hashes = hashes;
        self.resizes += 1;
        debug!(size, symbols = placed, "symbol index resized");
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    fn table() -> (Heap, SymbolTable) {
        let mut heap = Heap::default();
        let table = SymbolTable::new(&mut heap, 16).unwrap();
        (heap, table)
    }

    #[test]
    pub fn test_self_is_first() {
        let (heap, table) = table();
        assert_eq!(table.get_name(&heap, Sym::SELF), b"self");
        assert_eq!(table.len(&heap), 1);
    }

    #[test]
    pub fn test_make_word_is_idempotent() {
        let (mut heap, mut table) = table();
        let a = table.make_word(&mut heap, b"print").unwrap();
        let b = table.make_word(&mut heap, b"print").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.get_name(&heap, a), b"print");
    }

    #[test]
    pub fn test_case_variants_share_canon() {
        let (mut heap, mut table) = table();
        let lower = table.make_word(&mut heap, b"append").unwrap();
        let upper = table.make_word(&mut heap, b"APPEND").unwrap();
        let mixed = table.make_word(&mut heap, b"Append").unwrap();

        assert_ne!(lower, upper);
        assert_eq!(table.canon(&heap, upper), lower);
        assert_eq!(table.canon(&heap, mixed), lower);
        assert_eq!(table.alias_chain(&heap, mixed), vec![lower, upper, mixed]);
        assert_eq!(table.canon_count(), 2);
    }

    #[test]
    pub fn test_unicode_case_folding() {
        let (mut heap, mut table) = table();
        let a = table.make_word(&mut heap, "straße".as_bytes()).unwrap();
        let b = table.make_word(&mut heap, "STRAßE".as_bytes()).unwrap();
        assert_eq!(table.canon(&heap, a), table.canon(&heap, b));
    }

    #[test]
    pub fn test_unknown_names() {
        let (heap, table) = table();
        assert_eq!(table.get_name(&heap, Sym::NONE), UNKNOWN_NAME);
        assert_eq!(table.get_name(&heap, Sym(9999)), UNKNOWN_NAME);
        assert_eq!(table.canon(&heap, Sym(9999)), Sym::NONE);
    }

    #[test]
    pub fn test_compare_word() {
        let (mut heap, mut table) = table();
        let a = table.make_word(&mut heap, b"Alpha").unwrap();
        let a2 = table.make_word(&mut heap, b"alpha").unwrap();
        let b = table.make_word(&mut heap, b"beta").unwrap();

        assert_eq!(table.compare_word(&heap, a, a2, false), Ordering::Equal);
        assert_ne!(table.compare_word(&heap, a, a2, true), Ordering::Equal);
        assert_eq!(table.compare_word(&heap, a, b, false), Ordering::Less);
        assert_eq!(table.compare_word(&heap, b, a2, false), Ordering::Greater);
    }

    #[test]
    pub fn test_find_word() {
        let (mut heap, mut table) = table();
        let word = table.make_word(&mut heap, b"Word").unwrap();
        assert_eq!(table.find_word(&heap, b"Word"), Some(word));
        assert_eq!(table.find_word(&heap, b"WORD"), None);
        assert_eq!(table.find_word(&heap, b"other"), None);
        assert_eq!(table.find_canon(&heap, b"WORD"), Some(word));
    }

    #[test]
    pub fn test_resize_keeps_names() {
        let (mut heap, mut table) = table();
        let start = table.index_size(&heap);
        let words: Vec<_> = (0..100)
            .map(|i| {
                let name = format!("w{i}");
                (table.make_word(&mut heap, name.as_bytes()).unwrap(), name)
            })
            .collect();

        assert!(table.resizes() > 0);
        assert!(table.index_size(&heap) > start);
        for (sym, name) in words {
            assert_eq!(table.get_name(&heap, sym), name.as_bytes());
            assert_eq!(table.find_word(&heap, name.as_bytes()), Some(sym));
        }
    }

    #[test]
    pub fn test_bucket_skip_is_nonzero() {
        for size in PRIMES.iter().take(5) {
            for hash in [0u32, 1, 6, 7, 1000, u32::MAX] {
                let (start, skip) = bucket_steps(hash, *size as usize);
                assert!(start < *size as usize);
                assert!(skip >= 1 && skip < *size as usize);
            }
        }
    }

    #[test]
    pub fn test_prime_at_least() {
        assert_eq!(prime_at_least(1024), 2039);
        assert_eq!(prime_at_least(7), 7);
        assert_eq!(prime_at_least(0), 7);
    }
}
