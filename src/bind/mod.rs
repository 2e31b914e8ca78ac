//! Frames, word binding and variable access
pub mod binder;
pub mod collect;
pub mod frame;
pub mod resolve;
pub mod stack;
pub mod table;
pub mod var;

pub use binder::{BindMode, RebindMode, Target};
pub use collect::CollectMode;
pub use resolve::ResolveMode;
pub use stack::{Activation, CallStack};
pub use table::{BindScope, BindTable};
