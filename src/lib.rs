//! Series memory, symbols and word binding for a small interpreter
//! runtime.
#[macro_use]
extern crate bitflags;
extern crate itertools;
#[macro_use]
extern crate lazy_static;
extern crate thiserror;

pub mod bind;
pub mod config;
pub mod error;
pub mod fatal;
pub mod handle;
pub mod memory;
pub mod runtime;
pub mod symbol;
pub mod value;

pub use config::RuntimeSettings;
pub use error::RuntimeError;
pub use runtime::Runtime;
pub use symbol::Sym;
pub use value::Value;
