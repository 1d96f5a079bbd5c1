//! Native-call boundary.
//!
//! Scripts call host functions by index through `SYSREQ`. The index refers
//! to the image's native table, which the host fills by name with
//! [`Machine::register_natives`]. Arguments reach a native as the cells on
//! the stack: `params[0]` is the argument size in bytes and `params[1..]` the
//! arguments; array and string arguments are data addresses.

use super::cell::Cell;
use super::errors::AmxError;
use super::vm::Machine;
use std::sync::Arc;

/// A host function callable from scripts.
pub type Native = Arc<dyn Fn(&mut Machine, &[Cell]) -> Result<Cell, AmxError> + Send + Sync>;

/// Wraps a closure as a [`Native`].
pub fn native<F>(f: F) -> Native
where
    F: Fn(&mut Machine, &[Cell]) -> Result<Cell, AmxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Number of arguments passed to a native.
pub fn arg_count(params: &[Cell]) -> usize {
    params
        .first()
        .map_or(0, |&bytes| (bytes.max(0) as usize) / super::cell::CELL_SIZE)
}

/// Argument `index` (1-based, as scripts see them); PARAMS when missing.
pub fn arg(params: &[Cell], index: usize) -> Result<Cell, AmxError> {
    if index == 0 || index > arg_count(params) {
        return Err(AmxError::Params);
    }
    params.get(index).copied().ok_or(AmxError::Params)
}

/// Routes a native call from the interpreter to host code.
///
/// The default routing is [`DefaultDispatch`]; hosts install their own with
/// [`Machine::set_callback`] to intercept or log calls.
pub trait NativeCallback: Send + Sync {
    /// Calls native `index` with the stacked parameters.
    fn call(&self, machine: &mut Machine, index: Cell, params: &[Cell]) -> Result<Cell, AmxError>;

    /// Whether the call sites this callback serves may be rewritten to call
    /// the resolved native directly.
    fn allows_direct_patch(&self) -> bool {
        false
    }
}

impl<F> NativeCallback for F
where
    F: Fn(&mut Machine, Cell, &[Cell]) -> Result<Cell, AmxError> + Send + Sync,
{
    fn call(&self, machine: &mut Machine, index: Cell, params: &[Cell]) -> Result<Cell, AmxError> {
        self(machine, index, params)
    }
}

/// Calls the native registered at the given index.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDispatch;

impl NativeCallback for DefaultDispatch {
    fn call(&self, machine: &mut Machine, index: Cell, params: &[Cell]) -> Result<Cell, AmxError> {
        machine.call_native(index, params)
    }

    fn allows_direct_patch(&self) -> bool {
        true
    }
}

/// Called by the `BREAK` instruction.
///
/// Returning [`AmxError::Sleep`] suspends the script; any other error aborts
/// the running call.
pub trait DebugHook: Send + Sync {
    fn on_break(&self, machine: &mut Machine) -> Result<(), AmxError>;
}

impl<F> DebugHook for F
where
    F: Fn(&mut Machine) -> Result<(), AmxError> + Send + Sync,
{
    fn on_break(&self, machine: &mut Machine) -> Result<(), AmxError> {
        self(machine)
    }
}
