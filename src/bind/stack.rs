//! Function activations

use tracing::trace;

use crate::error::RuntimeError;
use crate::memory::Heap;
use crate::value::{FrameId, FuncId};

use super::frame::frame_from_words;

/// A call in progress: the function and its argument frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activation {
    pub func: FuncId,
    pub frame: FrameId,
}

#[derive(Debug)]
pub struct CallStack {
    activations: Vec<Activation>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        CallStack {
            activations: vec![],
            max_depth,
        }
    }

    /// Start a call of `func`, returning its argument frame with every
    /// argument unset
    pub fn push_call(&mut self, heap: &mut Heap, func: FuncId) -> Result<FrameId, RuntimeError> {
        if self.activations.len() >= self.max_depth {
            return Err(RuntimeError::StackOverflow(self.activations.len()));
        }
        let frame = frame_from_words(heap, func.words())?;
        self.activations.push(Activation { func, frame });
        trace!(%func, depth = self.activations.len(), "call");
        Ok(frame)
    }

    /// End the innermost call, releasing its argument frame
    pub fn pop_call(&mut self, heap: &mut Heap) -> Option<Activation> {
        let activation = self.activations.pop()?;
        heap.free_series(activation.frame.series());
        Some(activation)
    }

    /// Argument frame of the innermost activation of `func`
    pub fn find(&self, func: FuncId) -> Option<FrameId> {
        self.activations
            .iter()
            .rev()
            .find(|a| a.func == func)
            .map(|a| a.frame)
    }

    pub fn top(&self) -> Option<&Activation> {
        self.activations.last()
    }

    pub fn depth(&self) -> usize {
        self.activations.len()
    }
}
