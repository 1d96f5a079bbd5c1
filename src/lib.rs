//! Embeddable cell-based bytecode virtual machine.
//!
//! Loads compiled script images, verifies their bytecode, and executes public
//! functions on behalf of a host that supplies native functions.

pub mod machine;
pub mod utils;
