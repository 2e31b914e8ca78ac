//! Registered native resource types
//!
//! Native code registers the kinds of resource it hands to the
//! runtime (ports, libraries and so on) by name. The table is small
//! and fixed: running out of entries is an error, not a reason to
//! grow.

use std::fmt;

use tracing::debug;

use crate::error::RuntimeError;
use crate::symbol::Sym;

/// Entries in the handle type table
pub const MAX_HANDLE_TYPES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleType(u8);

impl HandleType {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Handle types keyed by canonical symbol
#[derive(Debug, Default)]
pub struct HandleTypes {
    names: Vec<Sym>,
}

impl HandleTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type name (a canonical symbol). Registering the same
    /// name again returns the existing type.
    pub fn register(&mut self, canon: Sym) -> Result<HandleType, RuntimeError> {
        if let Some(existing) = self.find(canon) {
            return Ok(existing);
        }
        if self.names.len() >= MAX_HANDLE_TYPES {
            return Err(RuntimeError::HandleTableFull(MAX_HANDLE_TYPES));
        }
        self.names.push(canon);
        let handle = HandleType((self.names.len() - 1) as u8);
        debug!(%handle, name = %canon, "handle type registered");
        Ok(handle)
    }

    pub fn find(&self, canon: Sym) -> Option<HandleType> {
        self.names
            .iter()
            .position(|name| *name == canon)
            .map(|i| HandleType(i as u8))
    }

    /// Name a handle type was registered under
    pub fn name(&self, handle: HandleType) -> Option<Sym> {
        self.names.get(handle.index()).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::memory::Heap;
    use crate::symbol::SymbolTable;

    #[test]
    pub fn test_register_is_idempotent() {
        let mut heap = Heap::default();
        let mut symbols = SymbolTable::new(&mut heap, 64).unwrap();
        let port = symbols.make_word(&mut heap, b"port").unwrap();

        let mut handles = HandleTypes::new();
        let first = handles.register(port).unwrap();
        assert_eq!(handles.register(port).unwrap(), first);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles.name(first), Some(port));
    }

    #[test]
    pub fn test_table_full() {
        let mut heap = Heap::default();
        let mut symbols = SymbolTable::new(&mut heap, 64).unwrap();
        let mut handles = HandleTypes::new();
        for i in 0..MAX_HANDLE_TYPES {
            let name = symbols.make_word(&mut heap, format!("h{i}").as_bytes()).unwrap();
            handles.register(name).unwrap();
        }
        let extra = symbols.make_word(&mut heap, b"extra").unwrap();
        assert_eq!(
            handles.register(extra),
            Err(RuntimeError::HandleTableFull(MAX_HANDLE_TYPES))
        );
    }
}
