//! Recoverable runtime errors
use thiserror::Error;

use crate::memory::SeriesError;
use crate::symbol::Sym;
use crate::value::Kind;

/// Errors surfaced to the evaluator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error("word {0} has no value")]
    NotDefined(Sym),
    #[error("word {0} is not in the specified context")]
    NotInContext(Sym),
    #[error("word {0} is locked")]
    LockedWord(Sym),
    #[error("the self slot of a frame cannot be set")]
    SelfSlot,
    #[error("duplicate word {0}")]
    DuplicateWord(Sym),
    #[error("word {word} does not accept values of type {found}")]
    TypeMismatch { word: Sym, found: Kind },
    #[error("symbol table cannot grow beyond {0} entries")]
    SymbolTableFull(usize),
    #[error("handle type table is full ({0} entries)")]
    HandleTableFull(usize),
    #[error("call stack overflow at depth {0}")]
    StackOverflow(usize),
    #[error("value is not a frame")]
    NotAFrame,
}

impl RuntimeError {
    /// Symbol the error refers to, if any
    pub fn word(&self) -> Option<Sym> {
        match self {
            RuntimeError::NotDefined(sym)
            | RuntimeError::NotInContext(sym)
            | RuntimeError::LockedWord(sym)
            | RuntimeError::DuplicateWord(sym)
            | RuntimeError::TypeMismatch { word: sym, .. } => Some(*sym),
            _ => None,
        }
    }
}
