//! The cell machine: image format, verifier, interpreter and host boundary.
//!
//! A host loads an [`Image`], creates a [`Machine`] for it, registers the
//! natives the image declares and calls [`Machine::exec`]:
//!
//! ```ignore
//! let image = Image::from_file("script.amx")?;
//! let mut machine = Machine::load(image)?;
//! machine.register_natives(&core_natives())?;
//! let result = machine.exec(Entry::Main)?;
//! ```

pub mod assembler;
pub mod builder;
pub mod cell;
pub mod config;
pub mod core;
pub mod errors;
pub mod host;
pub mod image;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub(crate) mod memory;
pub mod natives;
pub mod overlay;
pub mod strings;
pub mod verifier;
pub mod vm;

pub use cell::{CELL, CELL_SIZE, Cell, UCell};
pub use config::{ExecutorKind, MachineConfig};
pub use self::core::core_natives;
pub use errors::{AmxError, AsmError};
pub use host::SharedState;
pub use image::{Flags, Image};
pub use natives::{DebugHook, Native, NativeCallback, native};
pub use overlay::{ImageOverlays, OverlayLoader};
pub use vm::{Entry, ExecState, Executor, Machine, Registers, user_tag};
