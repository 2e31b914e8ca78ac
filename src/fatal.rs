//! Fatal conditions
//!
//! Invariant violations and heap exhaustion cannot be recovered
//! from: the state that would make unwinding safe is exactly what
//! has been lost. They are reported once and the process aborts.

use std::fmt;
use std::process::abort;

use tracing::error;

/// Numeric codes for the non-recoverable conditions
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// The system heap refused an allocation
    NoMemory = 1,
    /// A pool free list points outside the pool's segments
    CorruptFreeList = 2,
    /// The bind table was acquired while already in use
    BindTableInUse = 3,
    /// The symbol hash index disagrees with the symbol count
    HashDesync = 4,
    /// A series handle refers to a freed or unknown header
    BadSeries = 5,
}

impl Fatal {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Fatal::NoMemory => "out of memory",
            Fatal::CorruptFreeList => "corrupt pool free list",
            Fatal::BindTableInUse => "bind table already in use",
            Fatal::HashDesync => "symbol hash index out of step with symbol table",
            Fatal::BadSeries => "invalid series handle",
        };
        write!(f, "{text}")
    }
}

/// Report a fatal condition and abort the process.
pub fn crash(fatal: Fatal, detail: fmt::Arguments<'_>) -> ! {
    error!(code = fatal.code(), %detail, "fatal: {}", fatal);
    eprintln!("FATAL #{} {}: {}", fatal.code(), fatal, detail);
    abort()
}
