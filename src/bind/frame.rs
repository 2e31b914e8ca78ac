//! Frames and word lists
//!
//! A frame is a series of values paired slot for slot with a word
//! list of `WordSlot`s. Slot 0 of the value series holds
//! `Value::Frame { words }`, which is how a frame finds its word
//! list. Word lists may be shared between frames of the same shape;
//! such lists are flagged `SHARED` and copied before any change.

use crate::error::RuntimeError;
use crate::memory::{Heap, SeriesError, SeriesFlags, SeriesId};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FrameId, TypeSet, Value, WordFlags, WordSlot};

use super::binder::{rebind_values, Target};

/// Make a word list holding just its slot 0
pub fn make_word_list(
    heap: &mut Heap,
    capacity: usize,
    with_self: bool,
) -> Result<SeriesId, RuntimeError> {
    let words = heap.make::<WordSlot>(capacity + 1)?;
    heap.push(
        words,
        if with_self {
            WordSlot::self_slot()
        } else {
            WordSlot::anonymous()
        },
    )?;
    Ok(words)
}

/// Make a frame for a word list, every slot but 0 unset
pub fn frame_from_words(heap: &mut Heap, words: SeriesId) -> Result<FrameId, RuntimeError> {
    let len = heap.len(words).max(1);
    let values = heap.make::<Value>(len)?;
    heap.push(values, Value::Frame { words })?;
    for _ in 1..len {
        heap.push(values, Value::Unset)?;
    }
    Ok(FrameId::new(values))
}

/// The word list of a frame
pub fn frame_words(heap: &Heap, frame: FrameId) -> Result<SeriesId, RuntimeError> {
    match heap.get::<Value>(frame.series(), 0) {
        Some(Value::Frame { words }) => Ok(words),
        _ => Err(RuntimeError::NotAFrame),
    }
}

/// Number of slots including slot 0
pub fn frame_len(heap: &Heap, frame: FrameId) -> usize {
    heap.len(frame.series())
}

/// Word list of `frame`, copied first if it is shared
fn private_words(heap: &mut Heap, frame: FrameId) -> Result<SeriesId, RuntimeError> {
    let words = frame_words(heap, frame)?;
    if !heap.flags(words).contains(SeriesFlags::SHARED) {
        return Ok(words);
    }
    let copy = heap.copy_series(words)?;
    heap.set(frame.series(), 0, Value::Frame { words: copy })?;
    Ok(copy)
}

/// Add a word to a frame, returning its index
pub fn append_frame(heap: &mut Heap, frame: FrameId, sym: Sym) -> Result<usize, RuntimeError> {
    let words = private_words(heap, frame)?;
    heap.push(frame.series(), Value::Unset)?;
    heap.push(words, WordSlot::new(sym))?;
    Ok(heap.len(words) - 1)
}

/// Copy a frame. The copy shares the word list. In deep mode nested
/// blocks and function bodies are copied too and words in them bound
/// to the original are rebound to the copy.
pub fn clone_frame(heap: &mut Heap, frame: FrameId, deep: bool) -> Result<FrameId, RuntimeError> {
    let words = frame_words(heap, frame)?;
    heap.set_flags(words, SeriesFlags::SHARED, true);
    let clone = FrameId::new(heap.copy_series(frame.series())?);

    if deep {
        let (from, to) = (Target::Frame(frame), Target::Frame(clone));
        for index in 1..frame_len(heap, clone) {
            let (copied, body) = match heap.get::<Value>(clone.series(), index) {
                Some(Value::Block(block)) => {
                    let copy = copy_deep(heap, block)?;
                    (Value::Block(copy), copy)
                }
                Some(Value::Paren(block)) => {
                    let copy = copy_deep(heap, block)?;
                    (Value::Paren(copy), copy)
                }
                Some(Value::Function(mut func)) => {
                    func.body = copy_deep(heap, func.body)?;
                    (Value::Function(func), func.body)
                }
                _ => continue,
            };
            rebind_values(heap, from, to, body, true, None)?;
            heap.set(clone.series(), index, copied)?;
        }
    }

    Ok(clone)
}

/// Copy a block and every block nested in it
pub fn copy_deep(heap: &mut Heap, block: SeriesId) -> Result<SeriesId, RuntimeError> {
    let copy = heap.copy_series(block)?;
    for index in 0..heap.len(copy) {
        let nested = match heap.get::<Value>(copy, index) {
            Some(Value::Block(inner)) => Value::Block(copy_deep(heap, inner)?),
            Some(Value::Paren(inner)) => Value::Paren(copy_deep(heap, inner)?),
            _ => continue,
        };
        heap.set(copy, index, nested)?;
    }
    Ok(copy)
}

/// Index of a word in a frame, compared case-insensitively. Slot 0
/// is only found for `self`.
pub fn find_word_index(
    heap: &Heap,
    symbols: &SymbolTable,
    frame: FrameId,
    sym: Sym,
) -> Result<Option<usize>, RuntimeError> {
    let words = frame_words(heap, frame)?;
    let canon = symbols.canon(heap, sym);
    if canon.is_none() {
        return Ok(None);
    }
    Ok(heap
        .slice::<WordSlot>(words)
        .iter()
        .position(|slot| !slot.sym.is_none() && symbols.canon(heap, slot.sym) == canon))
}

/// Lock or unlock a word of a frame against `set_var`
pub fn protect_word(
    heap: &mut Heap,
    frame: FrameId,
    index: usize,
    on: bool,
) -> Result<(), RuntimeError> {
    update_word(heap, frame, index, |slot| slot.flags.set(WordFlags::LOCKED, on))
}

/// Hide a word from `words_of`
pub fn hide_word(heap: &mut Heap, frame: FrameId, index: usize) -> Result<(), RuntimeError> {
    update_word(heap, frame, index, |slot| slot.flags.insert(WordFlags::HIDDEN))
}

/// Restrict the kinds of value a slot accepts
pub fn constrain_word(
    heap: &mut Heap,
    frame: FrameId,
    index: usize,
    types: TypeSet,
) -> Result<(), RuntimeError> {
    update_word(heap, frame, index, |slot| slot.types = types)
}

fn update_word(
    heap: &mut Heap,
    frame: FrameId,
    index: usize,
    update: impl FnOnce(&mut WordSlot),
) -> Result<(), RuntimeError> {
    let words = private_words(heap, frame)?;
    let slots = heap.slice_mut::<WordSlot>(words)?;
    let len = slots.len();
    match slots.get_mut(index) {
        Some(slot) if index > 0 => {
            update(slot);
            Ok(())
        }
        Some(_) => Err(RuntimeError::SelfSlot),
        None => Err(SeriesError::BadIndex { index, len }.into()),
    }
}

/// Visible words of a frame
pub fn words_of(heap: &Heap, frame: FrameId) -> Result<Vec<Sym>, RuntimeError> {
    let words = frame_words(heap, frame)?;
    Ok(heap
        .slice::<WordSlot>(words)
        .iter()
        .skip(1)
        .filter(|slot| !slot.flags.contains(WordFlags::HIDDEN))
        .map(|slot| slot.sym)
        .collect())
}

/// Free a frame's values, and its word list unless shared
pub fn free_frame(heap: &mut Heap, frame: FrameId) -> Result<(), RuntimeError> {
    let words = frame_words(heap, frame)?;
    if !heap.flags(words).contains(SeriesFlags::SHARED) {
        heap.free_series(words);
    }
    heap.free_series(frame.series());
    Ok(())
}
