//! Runtime values and word occurrences
//!
//! `Value` is the cell stored in blocks and frames. It is plain data
//! so that it can live in a series; the all-zero cell is `End`, which
//! doubles as the block terminator.

use std::fmt;

use crate::memory::{Element, SeriesId};
use crate::symbol::Sym;

/// A frame: a series of values whose slot 0 describes the frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameId(SeriesId);

impl FrameId {
    pub fn new(values: SeriesId) -> Self {
        FrameId(values)
    }

    /// The series holding the frame's values
    pub fn series(self) -> SeriesId {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame@{}", self.0)
    }
}

/// Identity of a function: its parameter word list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FuncId(SeriesId);

impl FuncId {
    pub fn new(words: SeriesId) -> Self {
        FuncId(words)
    }

    /// The function's word list
    pub fn words(self) -> SeriesId {
        self.0
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func@{}", self.0)
    }
}

/// A function: parameter word list plus relatively bound body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FuncRef {
    pub id: FuncId,
    pub body: SeriesId,
}

/// Where a word occurrence finds its value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(C, u8)]
pub enum Binding {
    #[default]
    Unbound,
    /// Slot `index` of a frame on the heap
    Absolute { frame: FrameId, index: u32 },
    /// Argument `index` of the innermost activation of `func`
    Relative { func: FuncId, index: u32 },
}

impl Binding {
    pub fn is_bound(self) -> bool {
        !matches!(self, Binding::Unbound)
    }

    pub fn index(self) -> Option<usize> {
        match self {
            Binding::Unbound => None,
            Binding::Absolute { index, .. } | Binding::Relative { index, .. } => {
                Some(index as usize)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WordKind {
    Word,
    SetWord,
    GetWord,
    LitWord,
    Refinement,
}

/// A word occurrence in a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WordRef {
    pub kind: WordKind,
    pub sym: Sym,
    pub binding: Binding,
}

impl WordRef {
    pub fn new(kind: WordKind, sym: Sym) -> Self {
        WordRef {
            kind,
            sym,
            binding: Binding::Unbound,
        }
    }

    pub fn word(sym: Sym) -> Self {
        Self::new(WordKind::Word, sym)
    }

    pub fn set_word(sym: Sym) -> Self {
        Self::new(WordKind::SetWord, sym)
    }

    pub fn with_binding(self, binding: Binding) -> Self {
        WordRef { binding, ..self }
    }
}

/// A runtime cell
#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[repr(C, u8)]
pub enum Value {
    /// Terminator
    #[default]
    End,
    Unset,
    None,
    Logic(bool),
    Integer(i64),
    Decimal(f64),
    String(SeriesId),
    Block(SeriesId),
    Paren(SeriesId),
    Word(WordRef),
    Object(FrameId),
    Function(FuncRef),
    /// Slot 0 of every frame
    Frame { words: SeriesId },
}

unsafe impl Element for Value {}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::End => Kind::End,
            Value::Unset => Kind::Unset,
            Value::None => Kind::None,
            Value::Logic(_) => Kind::Logic,
            Value::Integer(_) => Kind::Integer,
            Value::Decimal(_) => Kind::Decimal,
            Value::String(_) => Kind::String,
            Value::Block(_) => Kind::Block,
            Value::Paren(_) => Kind::Paren,
            Value::Word(w) => match w.kind {
                WordKind::Word => Kind::Word,
                WordKind::SetWord => Kind::SetWord,
                WordKind::GetWord => Kind::GetWord,
                WordKind::LitWord => Kind::LitWord,
                WordKind::Refinement => Kind::Refinement,
            },
            Value::Object(_) => Kind::Object,
            Value::Function(_) => Kind::Function,
            Value::Frame { .. } => Kind::Frame,
        }
    }

    pub fn word(&self) -> Option<WordRef> {
        match self {
            Value::Word(w) => Some(*w),
            _ => None,
        }
    }

    /// Nested series of values (blocks and parens)
    pub fn nested(&self) -> Option<SeriesId> {
        match self {
            Value::Block(s) | Value::Paren(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Value::Unset)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    End,
    Unset,
    None,
    Logic,
    Integer,
    Decimal,
    String,
    Block,
    Paren,
    Word,
    SetWord,
    GetWord,
    LitWord,
    Refinement,
    Object,
    Function,
    Frame,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::End => "end!",
            Kind::Unset => "unset!",
            Kind::None => "none!",
            Kind::Logic => "logic!",
            Kind::Integer => "integer!",
            Kind::Decimal => "decimal!",
            Kind::String => "string!",
            Kind::Block => "block!",
            Kind::Paren => "paren!",
            Kind::Word => "word!",
            Kind::SetWord => "set-word!",
            Kind::GetWord => "get-word!",
            Kind::LitWord => "lit-word!",
            Kind::Refinement => "refinement!",
            Kind::Object => "object!",
            Kind::Function => "function!",
            Kind::Frame => "frame!",
        };
        write!(f, "{name}")
    }
}

bitflags! {
    /// Value kinds a frame slot accepts
    pub struct TypeSet: u32 {
        const END = 1 << 0;
        const UNSET = 1 << 1;
        const NONE = 1 << 2;
        const LOGIC = 1 << 3;
        const INTEGER = 1 << 4;
        const DECIMAL = 1 << 5;
        const STRING = 1 << 6;
        const BLOCK = 1 << 7;
        const PAREN = 1 << 8;
        const WORD = 1 << 9;
        const SET_WORD = 1 << 10;
        const GET_WORD = 1 << 11;
        const LIT_WORD = 1 << 12;
        const REFINEMENT = 1 << 13;
        const OBJECT = 1 << 14;
        const FUNCTION = 1 << 15;
        const FRAME = 1 << 16;

        const NUMBER = Self::INTEGER.bits | Self::DECIMAL.bits;
        const ANY_WORD = Self::WORD.bits
            | Self::SET_WORD.bits
            | Self::GET_WORD.bits
            | Self::LIT_WORD.bits
            | Self::REFINEMENT.bits;
    }
}

impl TypeSet {
    pub fn of(kind: Kind) -> Self {
        TypeSet::from_bits_truncate(1 << kind as u32)
    }

    pub fn accepts(self, value: &Value) -> bool {
        self.contains(TypeSet::of(value.kind()))
    }
}

bitflags! {
    /// Per-word properties in a word list
    pub struct WordFlags: u32 {
        /// The slot may not be set
        const LOCKED = 0b01;
        /// Not reported by `words_of`
        const HIDDEN = 0b10;
    }
}

/// Entry of a word list describing one frame slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct WordSlot {
    pub sym: Sym,
    pub types: TypeSet,
    pub flags: WordFlags,
}

unsafe impl Element for WordSlot {
    const PLAIN: bool = true;
}

impl WordSlot {
    pub fn new(sym: Sym) -> Self {
        WordSlot {
            sym,
            types: TypeSet::all(),
            flags: WordFlags::empty(),
        }
    }

    /// Slot 0 of an object's word list
    pub fn self_slot() -> Self {
        WordSlot {
            sym: Sym::SELF,
            types: TypeSet::OBJECT,
            flags: WordFlags::HIDDEN | WordFlags::LOCKED,
        }
    }

    /// Slot 0 of a word list without a self word
    pub fn anonymous() -> Self {
        WordSlot {
            sym: Sym::NONE,
            types: TypeSet::empty(),
            flags: WordFlags::HIDDEN | WordFlags::LOCKED,
        }
    }
}
