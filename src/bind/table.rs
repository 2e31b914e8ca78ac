//! The bind table
//!
//! Scratch storage keyed by canonical symbol, used by a single bind,
//! collect or resolve operation at a time. Access goes through a
//! `BindScope`, which holds the table and the heap exclusively, keeps
//! collection disabled while it lives and clears every slot it wrote
//! when dropped, on early returns included.

use crate::fatal::{crash, Fatal};
use crate::memory::Heap;
use crate::symbol::Sym;

/// Slot value marking a symbol selected rather than indexed
const MARKED: i32 = -1;

#[derive(Debug, Default)]
pub struct BindTable {
    /// 0 absent, > 0 index + 1, < 0 marked
    slots: Vec<i32>,
    /// Slots written by the current scope
    touched: Vec<u32>,
    in_use: bool,
}

impl BindTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a bind operation
    ///
    /// The returned scope borrows both the table and the heap so no
    /// second scope can exist at the same time. A scope whose drop
    /// never ran (for instance because it was forgotten) leaves the
    /// table in use, and acquiring it again is fatal.
    pub fn acquire<'a>(&'a mut self, heap: &'a mut Heap) -> BindScope<'a> {
        if self.in_use {
            crash(
                Fatal::BindTableInUse,
                format_args!("{} slots still set", self.touched.len()),
            );
        }
        self.in_use = true;
        heap.disable_collection();
        BindScope { table: self, heap }
    }

    /// Whether no slot holds a value
    pub fn is_clear(&self) -> bool {
        !self.in_use && self.slots.iter().all(|s| *s == 0)
    }

    /// Index recorded for a canonical symbol
    pub(crate) fn lookup(&self, canon: Sym) -> Option<usize> {
        match self.slot(canon) {
            n if n > 0 => Some(n as usize - 1),
            _ => None,
        }
    }

    fn slot(&self, canon: Sym) -> i32 {
        self.slots.get(canon.index()).copied().unwrap_or(0)
    }

    fn write(&mut self, canon: Sym, value: i32) {
        let index = canon.index();
        if index >= self.slots.len() {
            self.slots.resize(index + 1, 0);
        }
        if self.slots[index] == 0 {
            self.touched.push(canon.as_u32());
        }
        self.slots[index] = value;
    }

    fn release(&mut self) {
        for index in self.touched.drain(..) {
            self.slots[index as usize] = 0;
        }
        self.in_use = false;
    }
}

/// Exclusive use of the bind table and the heap
pub struct BindScope<'a> {
    pub(crate) table: &'a mut BindTable,
    pub(crate) heap: &'a mut Heap,
}

impl<'a> BindScope<'a> {
    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    /// Index recorded for a canonical symbol
    pub fn index(&self, canon: Sym) -> Option<usize> {
        self.table.lookup(canon)
    }

    pub fn set_index(&mut self, canon: Sym, index: usize) {
        self.table.write(canon, index as i32 + 1)
    }

    /// Flag a canonical symbol as selected
    pub fn mark(&mut self, canon: Sym) {
        self.table.write(canon, MARKED)
    }

    pub fn is_marked(&self, canon: Sym) -> bool {
        self.table.slot(canon) == MARKED
    }

    /// Forget a symbol
    pub fn clear(&mut self, canon: Sym) {
        if self.table.slot(canon) != 0 {
            self.table.slots[canon.index()] = 0;
        }
    }
}

impl<'a> Drop for BindScope<'a> {
    fn drop(&mut self) {
        self.table.release();
        self.heap.enable_collection();
    }
}
