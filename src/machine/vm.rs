//! Execution contexts.
//!
//! A [`Machine`] runs the code of one [`Image`] against its own private data
//! segment. Any number of machines may share an image; each one is driven by
//! a single thread at a time.
//!
//! Memory layout of the data segment, by byte offset:
//!
//! ```text
//! 0 ........ hlw ........ hea ~~~~~~ free ~~~~~~ stk ........ stp
//! | globals  |  heap  ->  |                      |  <- stack  | sentinel
//! ```

pub mod executor;
mod ops;
mod registers;
#[cfg(test)]
mod tests;

pub use executor::{Executor, Flow, Step, SwitchExecutor, ThreadedExecutor};
pub use registers::{ExecState, Registers};

use super::cell::{CELL, CELL_SIZE, Cell, STKMARGIN, UCell, USERNUM};
use super::config::MachineConfig;
use super::errors::AmxError;
use super::image::{Flags, Image};
use super::isa::Instruction;
use super::memory::{CodeBuffer, Memory};
use super::natives::{DebugHook, DefaultDispatch, Native, NativeCallback};
use super::overlay::OverlayLoader;
use super::strings;
use super::verifier::{SegmentSizes, SysreqForm, VerifyOptions, VerifyReport, verify};
use crate::{info, warn};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Where `exec` starts running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// The image's `main` entry point.
    Main,
    /// Resume a suspended call.
    Continue,
    /// Public function by index.
    Public(usize),
}

/// Segment sizes reported by [`Machine::mem_info`], in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub code: usize,
    pub data: usize,
    pub stack_heap: usize,
}

/// Builds a user-data tag from four characters.
pub const fn user_tag(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_le_bytes([a, b, c, d])
}

type UserSlot = Option<(u32, Arc<dyn Any + Send + Sync>)>;

/// One execution context.
pub struct Machine {
    image: Image,
    code: CodeBuffer,
    memory: Memory,
    regs: Registers,
    flags: Flags,
    /// Error raised by a native through [`Machine::raise_error`].
    error: Option<AmxError>,
    paramcount: usize,
    user_data: [UserSlot; USERNUM],
    natives: Vec<Option<Native>>,
    callback: Option<Arc<dyn NativeCallback>>,
    debug_hook: Option<Arc<dyn DebugHook>>,
    overlay_loader: Option<Arc<dyn OverlayLoader>>,
    executor: Arc<dyn Executor>,
    ovl_index: Cell,
    state: ExecState,
    report: VerifyReport,
    direct_patch: bool,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("regs", &self.regs)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("executor", &self.executor.name())
            .field("ovl_index", &self.ovl_index)
            .finish()
    }
}

impl Machine {
    /// Loads `image` with the default configuration.
    pub fn load(image: Image) -> Result<Self, AmxError> {
        Self::load_with(image, MachineConfig::default())
    }

    /// Loads `image`: sets up the data segment and verifies the code.
    ///
    /// Overlay images need an overlay loader; every overlay is fetched once
    /// and verified. The context is usable once this returns, after the
    /// natives the image declares have been registered.
    pub fn load_with(image: Image, config: MachineConfig) -> Result<Self, AmxError> {
        let executor = config.executor.build();
        let compiling = executor.compiles();
        let mut flags = image.flags();
        flags.insert(Flags::VERIFY);

        let header = image.header();
        let hlw = (header.hea - header.dat) as Cell;
        let stp = (header.stp - header.dat) as Cell - CELL;
        let mut memory = Memory::new(image.memory_size(), image.initial_data());
        memory.write_cell(stp, 0)?;

        let overlay_loader = config.overlay_loader;
        let options = VerifyOptions {
            overlay_loader: overlay_loader.is_some(),
            compiling,
        };
        let data = image.data_size() as Cell;
        let stack = image.stack_heap_size() as Cell;
        let report = if image.has_overlays() {
            let loader = match &overlay_loader {
                Some(loader) if !compiling => loader,
                _ => return Err(AmxError::Overlay),
            };
            let mut report = VerifyReport::default();
            for index in 0..image.num_overlays() {
                let code = loader.load(&image, index as Cell)?;
                let sizes = SegmentSizes {
                    code: code.len() as Cell,
                    data,
                    stack,
                };
                report = report.merge(verify(&code, &sizes, options)?);
            }
            report
        } else {
            let sizes = SegmentSizes {
                code: image.code_size() as Cell,
                data,
                stack,
            };
            verify(&image.code(), &sizes, options)?
        };
        executor.prepare(&report)?;

        let direct_patch = config.direct_patch && report.sysreq.is_single() && !compiling;
        if config.direct_patch && !direct_patch {
            warn!(
                "Direct native patching disabled (sysreq form {:?}, executor '{}')",
                report.sysreq,
                executor.name()
            );
        }

        flags.remove(Flags::VERIFY);
        flags.insert(Flags::INIT);
        if matches!(report.sysreq, SysreqForm::SysreqN | SysreqForm::Mixed) {
            flags.insert(Flags::SYSREQN);
        }
        if compiling {
            flags.insert(Flags::JITC);
        }
        let code = if image.has_overlays() {
            CodeBuffer::Shared(Default::default())
        } else {
            CodeBuffer::Shared(image.code())
        };

        info!(
            "Loaded image: {} bytes of code, {} publics, {} natives, {} opcodes verified ({})",
            image.code_size(),
            image.num_publics(),
            image.num_natives(),
            report.opcodes,
            executor.name()
        );

        Ok(Self {
            natives: vec![None; image.num_natives()],
            code,
            memory,
            regs: Registers::new(hlw, stp),
            flags,
            error: None,
            paramcount: 0,
            user_data: Default::default(),
            callback: Some(
                config
                    .callback
                    .unwrap_or_else(|| Arc::new(DefaultDispatch) as Arc<dyn NativeCallback>),
            ),
            debug_hook: config.debug_hook,
            overlay_loader,
            executor,
            ovl_index: 0,
            state: ExecState::Ready,
            report,
            direct_patch,
            image,
        })
    }

    /// Creates a new context over the same image and code.
    ///
    /// The clone gets a copy of the current globals, fresh registers and an
    /// empty stack and heap. Natives, hooks and the executor are shared;
    /// user data is not copied.
    pub fn clone_context(&self) -> Result<Machine, AmxError> {
        if !self.flags.contains(Flags::INIT) {
            return Err(AmxError::Init);
        }
        let hlw = self.regs.hlw;
        let stp = self.regs.stp;
        let mut memory = Memory::new(self.memory.len(), &[]);
        memory.copy_prefix_from(&self.memory, hlw as usize);
        memory.write_cell(stp, 0)?;
        let code = if self.image.has_overlays() {
            CodeBuffer::Shared(Default::default())
        } else {
            self.code.clone()
        };
        Ok(Machine {
            image: self.image.clone(),
            code,
            memory,
            regs: Registers::new(hlw, stp),
            flags: self.flags,
            error: None,
            paramcount: 0,
            user_data: Default::default(),
            natives: self.natives.clone(),
            callback: self.callback.clone(),
            debug_hook: self.debug_hook.clone(),
            overlay_loader: self.overlay_loader.clone(),
            executor: self.executor.clone(),
            ovl_index: 0,
            state: ExecState::Ready,
            report: self.report,
            direct_patch: self.direct_patch,
        })
    }

    // =========================
    // Natives
    // =========================

    /// Binds natives by name.
    ///
    /// Only natives that are still unbound are considered, so hosts can
    /// register several libraries one after the other. Returns NOTFOUND while
    /// some natives stay unbound; the ones that matched are bound regardless.
    pub fn register_natives(&mut self, list: &[(&str, Native)]) -> Result<(), AmxError> {
        let mut missing = 0;
        for index in 0..self.natives.len() {
            if self.natives[index].is_some() {
                continue;
            }
            let name = self.image.native_name(index)?;
            match list.iter().find(|(candidate, _)| *candidate == name) {
                Some((_, native)) => self.natives[index] = Some(native.clone()),
                None => missing += 1,
            }
        }
        if missing > 0 {
            warn!("{} native function(s) still unresolved after registration", missing);
            return Err(AmxError::NotFound);
        }
        self.flags.insert(Flags::NTVREG);
        Ok(())
    }

    /// Names of natives that are not bound yet.
    pub fn unresolved_natives(&self) -> Vec<&str> {
        self.natives
            .iter()
            .enumerate()
            .filter(|(_, native)| native.is_none())
            .filter_map(|(index, _)| self.image.native_name(index).ok())
            .collect()
    }

    /// Calls the native bound at `index`. NOTFOUND when nothing is bound.
    pub fn call_native(&mut self, index: Cell, params: &[Cell]) -> Result<Cell, AmxError> {
        let native = usize::try_from(index)
            .ok()
            .and_then(|index| self.natives.get(index))
            .and_then(Option::clone)
            .ok_or(AmxError::NotFound)?;
        native(self, params)
    }

    pub fn set_callback(&mut self, callback: Arc<dyn NativeCallback>) {
        self.callback = Some(callback);
    }

    /// Removes the native dispatch; `exec` then fails with CALLBACK.
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    pub fn set_debug_hook(&mut self, hook: Option<Arc<dyn DebugHook>>) {
        self.debug_hook = hook;
    }

    pub fn set_overlay_loader(&mut self, loader: Arc<dyn OverlayLoader>) {
        self.overlay_loader = Some(loader);
    }

    /// Reports an error from inside a native. The running call aborts with
    /// it once the native returns; [`AmxError::Sleep`] suspends instead.
    pub fn raise_error(&mut self, error: AmxError) {
        self.error = Some(error);
    }

    // =========================
    // Execution
    // =========================

    /// Runs code from `entry` until it halts, fails or sleeps.
    ///
    /// Arguments pushed with the `push*` methods since the last call are
    /// passed to the function. On any outcome except a sleep, the stack and
    /// heap are put back where they were before the arguments were pushed;
    /// heap blocks allotted for arguments therefore stay allotted until
    /// [`Machine::release`] is called.
    pub fn exec(&mut self, entry: Entry) -> Result<Cell, AmxError> {
        if !self.flags.contains(Flags::INIT) {
            return Err(AmxError::Init);
        }
        if self.callback.is_none() {
            return Err(AmxError::Callback);
        }
        if !self.flags.contains(Flags::NTVREG) {
            if let Some(name) = self.unresolved_natives().first() {
                warn!("Native function '{}' is not registered", name);
                return Err(AmxError::NotFound);
            }
            self.flags.insert(Flags::NTVREG);
        }
        let resuming = entry == Entry::Continue;
        if resuming && self.state != ExecState::Suspended {
            return Err(AmxError::InvState);
        }
        if !resuming && self.state == ExecState::Suspended {
            // a new call abandons the suspended one
            self.regs.stk = self.regs.reset_stk;
            self.regs.hea = self.regs.reset_hea;
            self.state = ExecState::Halted;
        }

        let outer = (self.state == ExecState::Running).then_some((self.regs, self.ovl_index));
        let result = self.enter(entry);
        if let Some((regs, ovl_index)) = outer {
            self.restore_outer(regs, ovl_index)?;
        }
        result
    }

    fn enter(&mut self, entry: Entry) -> Result<Cell, AmxError> {
        self.error = None;
        let (reset_stk, reset_hea) = if entry == Entry::Continue {
            (self.regs.reset_stk, self.regs.reset_hea)
        } else {
            let args = (self.paramcount * CELL_SIZE) as Cell;
            (self.regs.stk.wrapping_add(args), self.regs.hea)
        };

        let result = match self.prepare(entry) {
            Ok(()) => {
                self.regs.reset_stk = reset_stk;
                self.regs.reset_hea = reset_hea;
                self.state = ExecState::Running;
                let executor = self.executor.clone();
                executor.run(self)
            }
            Err(e) => Err(e),
        };
        match result {
            Err(AmxError::Sleep) if self.state == ExecState::Running => {
                self.state = ExecState::Suspended
            }
            _ => {
                self.regs.stk = reset_stk;
                self.regs.hea = reset_hea;
                self.paramcount = 0;
                self.state = ExecState::Halted;
            }
        }
        result
    }

    /// Points `cip` at the entry and pushes the call frame. Leaves `stk` and
    /// `hea` for [`Machine::enter`] to put back on failure.
    fn prepare(&mut self, entry: Entry) -> Result<(), AmxError> {
        let overlays = self.image.has_overlays();
        match entry {
            Entry::Main => {
                let cip = self.image.header().cip;
                if cip < 0 {
                    return Err(AmxError::Index);
                }
                self.start_at(cip as Cell, overlays)?;
            }
            Entry::Continue => {
                if overlays {
                    self.load_overlay(self.ovl_index)?;
                }
            }
            Entry::Public(index) => {
                let address = self
                    .image
                    .public(index)
                    .map_err(|_| AmxError::Index)?
                    .address as Cell;
                self.start_at(address, overlays)?;
            }
        }

        if self.regs.stk > self.regs.stp {
            return Err(AmxError::StackLow);
        }
        if self.regs.hea < self.regs.hlw {
            return Err(AmxError::HeapLow);
        }
        if entry != Entry::Continue {
            let args = (self.paramcount * CELL_SIZE) as Cell;
            self.paramcount = 0;
            self.push_cell(args)?;
            self.push_cell(0)?;
        }
        if !self.regs.has_margin(STKMARGIN) {
            return Err(AmxError::StackErr);
        }
        Ok(())
    }

    /// Puts back the registers of a call that was running when a native
    /// started a nested one.
    fn restore_outer(&mut self, regs: Registers, ovl_index: Cell) -> Result<(), AmxError> {
        let (stk, hea) = if self.state == ExecState::Suspended {
            (self.regs.reset_stk, self.regs.reset_hea)
        } else {
            (self.regs.stk, self.regs.hea)
        };
        self.regs = Registers { stk, hea, ..regs };
        self.state = ExecState::Running;
        if self.image.has_overlays() && self.ovl_index != ovl_index {
            self.load_overlay(ovl_index)?;
        }
        Ok(())
    }

    fn start_at(&mut self, address: Cell, overlays: bool) -> Result<(), AmxError> {
        if overlays {
            self.load_overlay(address)?;
            self.regs.cip = 0;
        } else {
            self.regs.cip = address;
        }
        Ok(())
    }

    /// Executes one instruction with the match-based dispatcher.
    pub fn step(&mut self) -> Step {
        let word = self.fetch()?;
        let (instr, param) = Instruction::decode(word)?;
        executor::dispatch_switch(self, instr, param)
    }

    /// Reads the cell at `cip` and advances past it.
    #[inline]
    fn fetch(&mut self) -> Result<Cell, AmxError> {
        let value = self.code.read_cell(self.regs.cip)?;
        self.regs.cip = self.regs.cip.wrapping_add(CELL);
        Ok(value)
    }

    /// Reads a relative jump operand and returns the absolute target.
    #[inline]
    fn fetch_jump(&mut self) -> Result<Cell, AmxError> {
        let at = self.regs.cip;
        let rel = self.fetch()?;
        Ok(at.wrapping_add(rel).wrapping_sub(CELL))
    }

    fn load_overlay(&mut self, index: Cell) -> Result<(), AmxError> {
        let loader = self.overlay_loader.clone().ok_or(AmxError::Overlay)?;
        let code = loader.load(&self.image, index)?;
        self.code = CodeBuffer::Shared(code);
        self.ovl_index = index;
        Ok(())
    }

    // =========================
    // Stack, heap and arguments
    // =========================

    fn push_cell(&mut self, value: Cell) -> Result<(), AmxError> {
        self.regs.stk = self.regs.stk.wrapping_sub(CELL);
        self.memory.write_cell(self.regs.stk, value)
    }

    fn pop_cell(&mut self) -> Result<Cell, AmxError> {
        let value = self.memory.read_cell(self.regs.stk)?;
        self.regs.stk = self.regs.stk.wrapping_add(CELL);
        Ok(value)
    }

    /// Pushes an argument for the next `exec`.
    pub fn push(&mut self, value: Cell) -> Result<(), AmxError> {
        if !self.regs.has_margin(STKMARGIN) {
            return Err(AmxError::StackErr);
        }
        self.push_cell(value)?;
        self.paramcount += 1;
        Ok(())
    }

    /// Pushes the address of data the script can already see.
    pub fn push_address(&mut self, addr: Cell) -> Result<(), AmxError> {
        if addr as UCell >= self.regs.stp as UCell {
            return Err(AmxError::MemAccess);
        }
        self.push(addr)
    }

    /// Copies `cells` onto the heap and pushes their address.
    pub fn push_array(&mut self, cells: &[Cell]) -> Result<Cell, AmxError> {
        let addr = self.allot(cells.len())?;
        self.memory.write_cells(addr, cells)?;
        self.push(addr)?;
        Ok(addr)
    }

    /// Stores `text` on the heap, packed or unpacked, and pushes its address.
    pub fn push_string(&mut self, text: &str, packed: bool) -> Result<Cell, AmxError> {
        let cells = if packed {
            text.len() / CELL_SIZE + 1
        } else {
            text.chars().count() + 1
        };
        let addr = self.allot(cells)?;
        self.set_string(addr, text, packed, cells)?;
        self.push(addr)?;
        Ok(addr)
    }

    /// Reserves `cells` cells on the heap and returns their address.
    ///
    /// MEMORY when the block would leave less than the stack margin between
    /// heap and stack.
    pub fn allot(&mut self, cells: usize) -> Result<Cell, AmxError> {
        let bytes = cells
            .checked_mul(CELL_SIZE)
            .and_then(|bytes| Cell::try_from(bytes).ok())
            .ok_or(AmxError::Memory)?;
        let fits = self
            .regs
            .stk
            .checked_sub(self.regs.hea)
            .and_then(|free| free.checked_sub(bytes))
            .is_some_and(|left| left >= STKMARGIN);
        if !fits {
            return Err(AmxError::Memory);
        }
        let addr = self.regs.hea;
        self.regs.hea = addr.checked_add(bytes).ok_or(AmxError::Memory)?;
        Ok(addr)
    }

    /// Frees the heap from `addr` upwards.
    pub fn release(&mut self, addr: Cell) {
        if self.regs.hea > addr {
            self.regs.hea = addr.max(self.regs.hlw);
        }
    }

    // =========================
    // Memory access
    // =========================

    /// Reads a cell of the data segment. MEMACCESS outside the globals, heap
    /// and stack.
    pub fn read_cell(&self, addr: Cell) -> Result<Cell, AmxError> {
        self.check_access(addr)?;
        self.memory.read_cell(addr)
    }

    pub fn write_cell(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        self.check_access(addr)?;
        self.memory.write_cell(addr, value)
    }

    /// Reads `count` consecutive cells.
    pub fn read_cells(&self, addr: Cell, count: usize) -> Result<Vec<Cell>, AmxError> {
        self.check_block(addr, count)?;
        self.memory.read_cells(addr, count)
    }

    pub fn write_cells(&mut self, addr: Cell, cells: &[Cell]) -> Result<(), AmxError> {
        self.check_block(addr, cells.len())?;
        self.memory.write_cells(addr, cells)
    }

    #[inline]
    fn check_access(&self, addr: Cell) -> Result<(), AmxError> {
        if self.regs.is_accessible(addr) {
            Ok(())
        } else {
            Err(AmxError::MemAccess)
        }
    }

    /// Checks both ends of a block of `cells` cells at `addr`.
    fn check_block(&self, addr: Cell, cells: usize) -> Result<(), AmxError> {
        if cells == 0 {
            return Ok(());
        }
        let last = Cell::try_from(cells - 1)
            .ok()
            .and_then(|n| n.checked_mul(CELL))
            .and_then(|n| addr.checked_add(n))
            .ok_or(AmxError::MemAccess)?;
        self.check_access(addr)?;
        self.check_access(last)?;
        if addr < self.regs.hea && last >= self.regs.stk {
            return Err(AmxError::MemAccess);
        }
        Ok(())
    }

    /// Cells of the string at `addr`, terminator included.
    fn string_cells(&self, addr: Cell) -> Result<Vec<Cell>, AmxError> {
        self.check_access(addr)?;
        let first = self.memory.read_cell(addr)?;
        let packed = strings::is_packed(&[first]);
        let mut cells = vec![first];
        let mut at = addr;
        let mut cell = first;
        loop {
            let done = if packed {
                cell.to_be_bytes().contains(&0)
            } else {
                cell == 0
            };
            if done {
                return Ok(cells);
            }
            at += CELL;
            self.check_access(at)?;
            cell = self.memory.read_cell(at)?;
            cells.push(cell);
        }
    }

    /// Length in characters of the string at `addr`.
    pub fn str_len(&self, addr: Cell) -> Result<usize, AmxError> {
        Ok(strings::str_len(&self.string_cells(addr)?))
    }

    /// Reads the string at `addr`.
    pub fn get_string(&self, addr: Cell) -> Result<String, AmxError> {
        Ok(strings::get_string(&self.string_cells(addr)?, usize::MAX))
    }

    /// Stores `text` at `addr` in a buffer of `size` cells.
    pub fn set_string(
        &mut self,
        addr: Cell,
        text: &str,
        packed: bool,
        size: usize,
    ) -> Result<(), AmxError> {
        let mut cells = self.read_cells(addr, size)?;
        strings::set_string(&mut cells, text, packed, size)?;
        self.memory.write_cells(addr, &cells)
    }

    // =========================
    // User data
    // =========================

    /// User data stored under `tag`. USERDATA when the tag is unknown or holds
    /// a different type.
    pub fn user_data<T: Any + Send + Sync>(&self, tag: u32) -> Result<Arc<T>, AmxError> {
        self.user_data
            .iter()
            .flatten()
            .find(|(slot_tag, _)| *slot_tag == tag)
            .and_then(|(_, data)| data.clone().downcast::<T>().ok())
            .ok_or(AmxError::UserData)
    }

    /// Stores user data under `tag`, replacing what the tag held before.
    /// INDEX when all slots are taken by other tags.
    pub fn set_user_data<T: Any + Send + Sync>(&mut self, tag: u32, value: T) -> Result<(), AmxError> {
        let slot = match self
            .user_data
            .iter()
            .position(|slot| matches!(slot, Some((slot_tag, _)) if *slot_tag == tag))
        {
            Some(index) => index,
            None => self
                .user_data
                .iter()
                .position(Option::is_none)
                .ok_or(AmxError::Index)?,
        };
        self.user_data[slot] = Some((tag, Arc::new(value)));
        Ok(())
    }

    // =========================
    // Inspection
    // =========================

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Snapshot of the registers.
    pub fn registers(&self) -> Registers {
        self.regs
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Error raised by the last native, if any.
    pub fn pending_error(&self) -> Option<AmxError> {
        self.error
    }

    pub fn verify_report(&self) -> &VerifyReport {
        &self.report
    }

    /// Current overlay index (overlay images only).
    pub fn overlay_index(&self) -> Cell {
        self.ovl_index
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Whether a native call site has been rewritten in this context's code.
    pub fn code_is_patched(&self) -> bool {
        self.code.is_private()
    }

    pub fn mem_info(&self) -> MemInfo {
        MemInfo {
            code: self.image.code_size(),
            data: self.image.data_size(),
            stack_heap: self.image.stack_heap_size(),
        }
    }

    /// Index of a public function by name.
    pub fn find_public(&self, name: &str) -> Result<usize, AmxError> {
        self.image.find_public(name)
    }

    /// Data address of a public variable by name.
    pub fn find_pubvar(&self, name: &str) -> Result<Cell, AmxError> {
        let index = self.image.find_pubvar(name)?;
        Ok(self.image.pubvar(index)?.address as Cell)
    }
}
