//! Merging one frame's fields into another by symbol

use crate::error::RuntimeError;
use crate::memory::Heap;
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FrameId, Value, WordFlags, WordSlot};

use super::frame::{append_frame, frame_words};
use super::table::BindTable;

bitflags! {
    /// Options for `resolve_context`
    pub struct ResolveMode: u32 {
        /// Overwrite target values that are already set
        const ALL = 0b001;
        /// Add source words the target lacks
        const EXPAND = 0b010;
        /// Write locked target words as well
        const FORCE = 0b100;
    }
}

/// Copy values from `source` into the slots of `target` with the
/// same words, optionally only for the words in `selector`. Returns
/// the number of values copied.
pub fn resolve_context(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    target: FrameId,
    source: FrameId,
    selector: Option<&[Sym]>,
    mode: ResolveMode,
) -> Result<usize, RuntimeError> {
    let source_words = heap.slice::<WordSlot>(frame_words(heap, source)?).to_vec();
    let target_words = heap.slice::<WordSlot>(frame_words(heap, target)?).to_vec();

    let mut scope = binds.acquire(heap);

    if let Some(selected) = selector {
        for sym in selected {
            let canon = symbols.canon(scope.heap, *sym);
            scope.mark(canon);
        }
    }

    for (index, slot) in source_words.iter().enumerate().skip(1) {
        if slot.flags.contains(WordFlags::HIDDEN) {
            continue;
        }
        let canon = symbols.canon(scope.heap, slot.sym);
        if selector.is_none() || scope.is_marked(canon) {
            scope.set_index(canon, index);
        }
    }

    let mut copied = 0;
    for (index, slot) in target_words.iter().enumerate().skip(1) {
        let canon = symbols.canon(scope.heap, slot.sym);
        let from = match scope.index(canon) {
            Some(from) => from,
            None => continue,
        };
        scope.clear(canon);

        if slot.flags.contains(WordFlags::LOCKED) && !mode.contains(ResolveMode::FORCE) {
            continue;
        }
        let current = scope.heap.get::<Value>(target.series(), index);
        if mode.contains(ResolveMode::ALL) || matches!(current, Some(Value::Unset)) {
            let value = scope.heap.get::<Value>(source.series(), from).unwrap_or(Value::Unset);
            scope.heap.set(target.series(), index, value)?;
            copied += 1;
        }
    }

    if mode.contains(ResolveMode::EXPAND) {
        for slot in source_words.iter().skip(1) {
            let canon = symbols.canon(scope.heap, slot.sym);
            if let Some(from) = scope.index(canon) {
                scope.clear(canon);
                let index = append_frame(scope.heap, target, slot.sym)?;
                let value = scope.heap.get::<Value>(source.series(), from).unwrap_or(Value::Unset);
                scope.heap.set(target.series(), index, value)?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}
