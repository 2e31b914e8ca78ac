//! Reading and writing the storage a word is bound to

use crate::error::RuntimeError;
use crate::memory::Heap;
use crate::value::{Binding, FrameId, Value, WordFlags, WordRef, WordSlot};

use super::frame::frame_words;
use super::stack::CallStack;

/// Frame holding the value of a bound word, with the slot index
fn locate(stack: &CallStack, word: &WordRef) -> Result<(FrameId, usize), RuntimeError> {
    match word.binding {
        Binding::Unbound => Err(RuntimeError::NotDefined(word.sym)),
        Binding::Absolute { frame, index } => Ok((frame, index as usize)),
        Binding::Relative { func, index } => match stack.find(func) {
            Some(frame) => Ok((frame, index as usize)),
            None => Err(RuntimeError::NotDefined(word.sym)),
        },
    }
}

/// Value of a bound word. Slot 0 yields the frame itself.
pub fn get_var(heap: &Heap, stack: &CallStack, word: &WordRef) -> Result<Value, RuntimeError> {
    let (frame, index) = locate(stack, word)?;
    if index == 0 {
        return Ok(Value::Object(frame));
    }
    heap.get::<Value>(frame.series(), index)
        .ok_or(RuntimeError::NotDefined(word.sym))
}

/// Store a value in the slot a word is bound to, honouring locks and
/// the slot's type constraint
pub fn set_var(
    heap: &mut Heap,
    stack: &CallStack,
    word: &WordRef,
    value: Value,
) -> Result<(), RuntimeError> {
    let (frame, index) = locate(stack, word)?;
    if index == 0 {
        return Err(RuntimeError::SelfSlot);
    }

    let words = frame_words(heap, frame)?;
    let slot = heap
        .get::<WordSlot>(words, index)
        .ok_or(RuntimeError::NotDefined(word.sym))?;
    if slot.flags.contains(WordFlags::LOCKED) {
        return Err(RuntimeError::LockedWord(word.sym));
    }
    if !slot.types.accepts(&value) {
        return Err(RuntimeError::TypeMismatch {
            word: word.sym,
            found: value.kind(),
        });
    }

    heap.set(frame.series(), index, value)?;
    Ok(())
}
