use crate::machine::cell::Cell;

/// Register file of a context.
///
/// All addresses are byte offsets into the data segment, except `cip`,
/// which is an offset into the resident code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    /// Primary register: accumulator and return value.
    pub pri: Cell,
    /// Alternate register.
    pub alt: Cell,
    /// Frame pointer.
    pub frm: Cell,
    /// Instruction pointer.
    pub cip: Cell,
    /// Heap top.
    pub hea: Cell,
    /// Stack top (grows down).
    pub stk: Cell,
    /// Stack base; the highest usable stack address.
    pub stp: Cell,
    /// Heap low water mark: end of the globals.
    pub hlw: Cell,
    /// Stack pointer restored when a call aborts.
    pub reset_stk: Cell,
    /// Heap pointer restored when a call aborts.
    pub reset_hea: Cell,
}

impl Registers {
    /// Fresh registers for a data segment whose globals end at `hlw` and
    /// whose stack starts at `stp`.
    pub(crate) fn new(hlw: Cell, stp: Cell) -> Self {
        Self {
            hea: hlw,
            stk: stp,
            stp,
            hlw,
            reset_stk: stp,
            reset_hea: hlw,
            ..Self::default()
        }
    }

    /// Whether `addr` may be dereferenced: inside `[0, stp)` and outside the
    /// free gap between heap and stack.
    #[inline]
    pub(crate) fn is_accessible(&self, addr: Cell) -> bool {
        !((addr >= self.hea && addr < self.stk) || addr < 0 || addr >= self.stp)
    }

    /// Whether the gap between heap and stack is at least the stack margin.
    #[inline]
    pub(crate) fn has_margin(&self, margin: Cell) -> bool {
        self.hea.checked_add(margin).is_some_and(|top| top <= self.stk)
    }
}

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecState {
    /// Loaded and not running.
    #[default]
    Ready,
    /// Inside `exec`.
    Running,
    /// Stopped by a sleep request; resume with `Entry::Continue`.
    Suspended,
    /// The last call finished or aborted.
    Halted,
}
