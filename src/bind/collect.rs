//! Collecting the words of a block

use crate::error::RuntimeError;
use crate::memory::{Heap, SeriesFlags, SeriesId};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FrameId, Value, WordKind, WordSlot};

use super::frame::frame_words;
use super::table::{BindScope, BindTable};

bitflags! {
    /// Options for `collect_frame` and `collect_words`
    pub struct CollectMode: u32 {
        /// Collect set-words
        const SET = 0b0_0001;
        /// Collect words of every kind
        const ANY = 0b0_0010;
        /// Scan nested blocks and parens
        const DEEP = 0b0_0100;
        /// A repeated word is an error
        const NO_DUP = 0b0_1000;
        /// Start a new word list with `self` in slot 0
        const SELF = 0b1_0000;
    }
}

impl CollectMode {
    fn wants(self, kind: WordKind) -> bool {
        self.contains(CollectMode::ANY)
            || (self.contains(CollectMode::SET) && kind == WordKind::SetWord)
    }
}

/// Build a word list from the words of `body`
///
/// When `prior` is given its words come first, in order. If `body`
/// adds nothing the prior word list itself is returned, flagged as
/// shared.
pub fn collect_frame(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    mode: CollectMode,
    prior: Option<FrameId>,
    body: SeriesId,
) -> Result<SeriesId, RuntimeError> {
    let prior_words = prior.map(|frame| frame_words(heap, frame)).transpose()?;

    let mut words: Vec<WordSlot> = match prior_words {
        Some(list) => heap.slice::<WordSlot>(list).to_vec(),
        None if mode.contains(CollectMode::SELF) => vec![WordSlot::self_slot()],
        None => vec![WordSlot::anonymous()],
    };
    let seeded = words.len();

    {
        let mut scope = binds.acquire(heap);
        for (index, slot) in words.iter().enumerate() {
            if !slot.sym.is_none() {
                let canon = symbols.canon(scope.heap, slot.sym);
                scope.set_index(canon, index);
            }
        }
        collect_into(&mut scope, symbols, mode, body, &mut |scope, sym| {
            scope.set_index(symbols.canon(scope.heap, sym), words.len());
            words.push(WordSlot::new(sym));
        })?;
    }

    match prior_words {
        Some(list) if words.len() == seeded => {
            heap.set_flags(list, SeriesFlags::SHARED, true);
            Ok(list)
        }
        _ => Ok(heap.make_from(&words)?),
    }
}

/// Distinct words of `body` in order of first appearance
pub fn collect_words(
    heap: &mut Heap,
    symbols: &SymbolTable,
    binds: &mut BindTable,
    mode: CollectMode,
    body: SeriesId,
) -> Result<Vec<Sym>, RuntimeError> {
    let mut words = vec![];
    let mut scope = binds.acquire(heap);
    collect_into(&mut scope, symbols, mode, body, &mut |scope, sym| {
        scope.set_index(symbols.canon(scope.heap, sym), words.len());
        words.push(sym);
    })?;
    drop(scope);
    Ok(words)
}

/// Scan `block`, calling `add` with every word not yet in the bind
/// table. `add` must record the word in the table.
fn collect_into(
    scope: &mut BindScope<'_>,
    symbols: &SymbolTable,
    mode: CollectMode,
    block: SeriesId,
    add: &mut dyn FnMut(&mut BindScope<'_>, Sym),
) -> Result<(), RuntimeError> {
    for position in 0..scope.heap.len(block) {
        match scope.heap.get::<Value>(block, position) {
            Some(Value::Word(word)) if mode.wants(word.kind) => {
                let canon = symbols.canon(scope.heap, word.sym);
                if scope.index(canon).is_some() {
                    if mode.contains(CollectMode::NO_DUP) {
                        return Err(RuntimeError::DuplicateWord(word.sym));
                    }
                } else {
                    add(scope, word.sym);
                }
            }
            Some(Value::Block(inner)) | Some(Value::Paren(inner))
                if mode.contains(CollectMode::DEEP) =>
            {
                collect_into(scope, symbols, mode, inner, add)?
            }
            _ => {}
        }
    }
    Ok(())
}
