//! Instruction handlers.
//!
//! One method per instruction semantics; packed and `PUSHR` forms share the
//! handler of their plain form. Every handler returns [`Flow::Continue`]
//! unless it ends the call.

use super::executor::{Flow, Step};
use super::Machine;
use crate::machine::cell::{CELL, CELL_SIZE, Cell, OVERLAY_MASK, OVERLAY_SHIFT, STKMARGIN, UCell};
use crate::machine::errors::AmxError;
use crate::machine::isa::Instruction;

const NEXT: Step = Ok(Flow::Continue);

/// Signed division rounding toward negative infinity. Returns the quotient
/// and a remainder with the sign of the divisor.
pub(crate) fn floored_div(dividend: Cell, divisor: Cell) -> Result<(Cell, Cell), AmxError> {
    if divisor == 0 {
        return Err(AmxError::Divide);
    }
    let quotient = dividend.wrapping_div(divisor);
    let remainder = dividend.wrapping_rem(divisor);
    if remainder != 0 && (remainder ^ divisor) < 0 {
        Ok((quotient.wrapping_sub(1), remainder.wrapping_add(divisor)))
    } else {
        Ok((quotient, remainder))
    }
}

impl Machine {
    // =========================
    // Memory helpers
    // =========================

    #[inline]
    fn read(&self, addr: Cell) -> Result<Cell, AmxError> {
        self.memory.read_cell(addr)
    }

    #[inline]
    fn write(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        self.memory.write_cell(addr, value)
    }

    /// Loads through a script-computed address.
    #[inline]
    fn read_checked(&self, addr: Cell) -> Result<Cell, AmxError> {
        self.check_access(addr)?;
        self.memory.read_cell(addr)
    }

    #[inline]
    fn write_checked(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        self.check_access(addr)?;
        self.memory.write_cell(addr, value)
    }

    #[inline]
    fn frame(&self, offs: Cell) -> Cell {
        self.regs.frm.wrapping_add(offs)
    }

    /// Checks a byte range used by the block instructions: both the first
    /// byte and the end must lie in accessible memory.
    fn check_bytes(&self, addr: Cell, len: Cell) -> Result<usize, AmxError> {
        let len_bytes = usize::try_from(len).map_err(|_| AmxError::MemAccess)?;
        let end = addr.checked_add(len).ok_or(AmxError::MemAccess)?;
        self.check_access(addr)?;
        if (end > self.regs.hea && end < self.regs.stk) || end as UCell > self.regs.stp as UCell {
            return Err(AmxError::MemAccess);
        }
        Ok(len_bytes)
    }

    fn byte_width(width: Cell) -> Result<usize, AmxError> {
        match width {
            1 | 2 | 4 => Ok(width as usize),
            _ => Err(AmxError::InvInstr),
        }
    }

    /// Target of the relative jump stored in the code cell at `at`.
    fn jump_at(&self, at: Cell) -> Result<Cell, AmxError> {
        let rel = self.code.read_cell(at)?;
        Ok(at.wrapping_add(rel).wrapping_sub(CELL))
    }

    fn jump_if(&mut self, taken: bool, target: Cell) -> Step {
        if taken {
            self.regs.cip = target;
        }
        NEXT
    }

    fn stack_check(&self) -> Result<(), AmxError> {
        if !self.regs.has_margin(STKMARGIN) {
            return Err(AmxError::StackErr);
        }
        Ok(())
    }

    /// Pops a return address and validates it against the resident code.
    fn pop_return(&mut self) -> Result<Cell, AmxError> {
        let offs = self.pop_cell()?;
        if offs < 0 || offs as usize >= self.code.len() {
            return Err(AmxError::MemAccess);
        }
        Ok(offs)
    }

    /// Drops the argument block a `RETN` leaves behind.
    fn pop_arguments(&mut self) -> Result<(), AmxError> {
        let bytes = self.read(self.regs.stk)?;
        self.regs.stk = self.regs.stk.wrapping_add(bytes).wrapping_add(CELL);
        Ok(())
    }

    // =========================
    // Load and store
    // =========================

    pub(super) fn op_nop(&mut self) -> Step {
        NEXT
    }

    pub(super) fn op_invalid(&mut self) -> Step {
        Err(AmxError::InvInstr)
    }

    pub(super) fn op_load_pri(&mut self, addr: Cell) -> Step {
        self.regs.pri = self.read(addr)?;
        NEXT
    }

    pub(super) fn op_load_alt(&mut self, addr: Cell) -> Step {
        self.regs.alt = self.read(addr)?;
        NEXT
    }

    pub(super) fn op_load_s_pri(&mut self, offs: Cell) -> Step {
        self.regs.pri = self.read(self.frame(offs))?;
        NEXT
    }

    pub(super) fn op_load_s_alt(&mut self, offs: Cell) -> Step {
        self.regs.alt = self.read(self.frame(offs))?;
        NEXT
    }

    pub(super) fn op_lref_s_pri(&mut self, offs: Cell) -> Step {
        let addr = self.read(self.frame(offs))?;
        self.regs.pri = self.read_checked(addr)?;
        NEXT
    }

    pub(super) fn op_lref_s_alt(&mut self, offs: Cell) -> Step {
        let addr = self.read(self.frame(offs))?;
        self.regs.alt = self.read_checked(addr)?;
        NEXT
    }

    pub(super) fn op_load_i(&mut self) -> Step {
        self.regs.pri = self.read_checked(self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_lodb_i(&mut self, width: Cell) -> Step {
        let width = Self::byte_width(width)?;
        self.check_access(self.regs.pri)?;
        self.regs.pri = self.memory.read_sized(self.regs.pri, width)? as Cell;
        NEXT
    }

    pub(super) fn op_const_pri(&mut self, value: Cell) -> Step {
        self.regs.pri = value;
        NEXT
    }

    pub(super) fn op_const_alt(&mut self, value: Cell) -> Step {
        self.regs.alt = value;
        NEXT
    }

    pub(super) fn op_addr_pri(&mut self, offs: Cell) -> Step {
        self.regs.pri = self.frame(offs);
        NEXT
    }

    pub(super) fn op_addr_alt(&mut self, offs: Cell) -> Step {
        self.regs.alt = self.frame(offs);
        NEXT
    }

    pub(super) fn op_stor(&mut self, addr: Cell) -> Step {
        self.write(addr, self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_stor_s(&mut self, offs: Cell) -> Step {
        self.write(self.frame(offs), self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_sref_s(&mut self, offs: Cell) -> Step {
        let addr = self.read(self.frame(offs))?;
        self.write_checked(addr, self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_stor_i(&mut self) -> Step {
        self.write_checked(self.regs.alt, self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_strb_i(&mut self, width: Cell) -> Step {
        let width = Self::byte_width(width)?;
        self.check_access(self.regs.alt)?;
        self.memory.write_sized(self.regs.alt, width, self.regs.pri as u32)?;
        NEXT
    }

    pub(super) fn op_align_pri(&mut self, width: Cell) -> Step {
        if (width as usize) < CELL_SIZE {
            self.regs.pri ^= CELL - width;
        }
        NEXT
    }

    pub(super) fn op_lidx(&mut self) -> Step {
        let addr = self.regs.pri.wrapping_mul(CELL).wrapping_add(self.regs.alt);
        self.regs.pri = self.read_checked(addr)?;
        NEXT
    }

    pub(super) fn op_lidx_b(&mut self, shift: Cell) -> Step {
        let addr = self.regs.pri.wrapping_shl(shift as u32).wrapping_add(self.regs.alt);
        self.regs.pri = self.read_checked(addr)?;
        NEXT
    }

    pub(super) fn op_idxaddr(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_mul(CELL).wrapping_add(self.regs.alt);
        NEXT
    }

    pub(super) fn op_idxaddr_b(&mut self, shift: Cell) -> Step {
        self.regs.pri = self.regs.pri.wrapping_shl(shift as u32).wrapping_add(self.regs.alt);
        NEXT
    }

    pub(super) fn op_load2(&mut self, first: Cell, second: Cell) -> Step {
        self.regs.pri = self.read(first)?;
        self.regs.alt = self.read(second)?;
        NEXT
    }

    pub(super) fn op_load2_s(&mut self, first: Cell, second: Cell) -> Step {
        self.regs.pri = self.read(self.frame(first))?;
        self.regs.alt = self.read(self.frame(second))?;
        NEXT
    }

    pub(super) fn op_const(&mut self, addr: Cell, value: Cell) -> Step {
        self.write(addr, value)?;
        NEXT
    }

    pub(super) fn op_const_s(&mut self, offs: Cell, value: Cell) -> Step {
        self.write(self.frame(offs), value)?;
        NEXT
    }

    pub(super) fn op_zero_pri(&mut self) -> Step {
        self.regs.pri = 0;
        NEXT
    }

    pub(super) fn op_zero_alt(&mut self) -> Step {
        self.regs.alt = 0;
        NEXT
    }

    pub(super) fn op_zero(&mut self, addr: Cell) -> Step {
        self.write(addr, 0)?;
        NEXT
    }

    pub(super) fn op_zero_s(&mut self, offs: Cell) -> Step {
        self.write(self.frame(offs), 0)?;
        NEXT
    }

    // =========================
    // Registers
    // =========================

    pub(super) fn op_lctrl(&mut self, index: Cell) -> Step {
        let header = self.image.header();
        let value = match index {
            0 => header.cod as Cell,
            1 => header.dat as Cell,
            2 => self.regs.hea,
            3 => self.regs.stp,
            4 => self.regs.stk,
            5 => self.regs.frm,
            6 => self.regs.cip,
            _ => return NEXT,
        };
        self.regs.pri = value;
        NEXT
    }

    pub(super) fn op_sctrl(&mut self, index: Cell) -> Step {
        let value = self.regs.pri;
        match index {
            2 => self.regs.hea = value,
            4 => self.regs.stk = value,
            5 => self.regs.frm = value,
            6 => self.regs.cip = value,
            _ => {}
        }
        NEXT
    }

    pub(super) fn op_xchg(&mut self) -> Step {
        std::mem::swap(&mut self.regs.pri, &mut self.regs.alt);
        NEXT
    }

    pub(super) fn op_swap_pri(&mut self) -> Step {
        let top = self.read(self.regs.stk)?;
        self.write(self.regs.stk, self.regs.pri)?;
        self.regs.pri = top;
        NEXT
    }

    pub(super) fn op_swap_alt(&mut self) -> Step {
        let top = self.read(self.regs.stk)?;
        self.write(self.regs.stk, self.regs.alt)?;
        self.regs.alt = top;
        NEXT
    }

    // =========================
    // Stack and frames
    // =========================

    pub(super) fn op_push_pri(&mut self) -> Step {
        self.push_cell(self.regs.pri)?;
        NEXT
    }

    pub(super) fn op_push_alt(&mut self) -> Step {
        self.push_cell(self.regs.alt)?;
        NEXT
    }

    pub(super) fn op_pop_pri(&mut self) -> Step {
        self.regs.pri = self.pop_cell()?;
        NEXT
    }

    pub(super) fn op_pop_alt(&mut self) -> Step {
        self.regs.alt = self.pop_cell()?;
        NEXT
    }

    pub(super) fn op_pick(&mut self, offs: Cell) -> Step {
        self.regs.pri = self.read(self.regs.stk.wrapping_add(offs))?;
        NEXT
    }

    pub(super) fn op_push_c(&mut self, value: Cell) -> Step {
        self.push_cell(value)?;
        NEXT
    }

    pub(super) fn op_push(&mut self, addr: Cell) -> Step {
        let value = self.read(addr)?;
        self.push_cell(value)?;
        NEXT
    }

    pub(super) fn op_push_s(&mut self, offs: Cell) -> Step {
        let value = self.read(self.frame(offs))?;
        self.push_cell(value)?;
        NEXT
    }

    pub(super) fn op_push_adr(&mut self, offs: Cell) -> Step {
        self.push_cell(self.frame(offs))?;
        NEXT
    }

    pub(super) fn op_pushm_c(&mut self, count: Cell) -> Step {
        for _ in 0..count {
            let value = self.fetch()?;
            self.push_cell(value)?;
        }
        NEXT
    }

    pub(super) fn op_pushm(&mut self, count: Cell) -> Step {
        for _ in 0..count {
            let addr = self.fetch()?;
            let value = self.read(addr)?;
            self.push_cell(value)?;
        }
        NEXT
    }

    pub(super) fn op_pushm_s(&mut self, count: Cell) -> Step {
        for _ in 0..count {
            let offs = self.fetch()?;
            let value = self.read(self.frame(offs))?;
            self.push_cell(value)?;
        }
        NEXT
    }

    pub(super) fn op_pushm_adr(&mut self, count: Cell) -> Step {
        for _ in 0..count {
            let offs = self.fetch()?;
            self.push_cell(self.frame(offs))?;
        }
        NEXT
    }

    pub(super) fn op_stack(&mut self, bytes: Cell) -> Step {
        self.regs.alt = self.regs.stk;
        self.regs.stk = self.regs.stk.wrapping_add(bytes);
        self.stack_check()?;
        if self.regs.stk > self.regs.stp {
            return Err(AmxError::StackLow);
        }
        NEXT
    }

    pub(super) fn op_heap(&mut self, bytes: Cell) -> Step {
        self.regs.alt = self.regs.hea;
        self.regs.hea = self.regs.hea.wrapping_add(bytes);
        self.stack_check()?;
        if self.regs.hea < self.regs.hlw {
            return Err(AmxError::HeapLow);
        }
        NEXT
    }

    pub(super) fn op_proc(&mut self) -> Step {
        self.push_cell(self.regs.frm)?;
        self.regs.frm = self.regs.stk;
        self.stack_check()?;
        NEXT
    }

    pub(super) fn op_ret(&mut self) -> Step {
        self.regs.frm = self.pop_cell()?;
        self.regs.cip = self.pop_return()?;
        NEXT
    }

    pub(super) fn op_retn(&mut self) -> Step {
        self.regs.frm = self.pop_cell()?;
        self.regs.cip = self.pop_return()?;
        self.pop_arguments()?;
        NEXT
    }

    pub(super) fn op_call(&mut self, target: Cell) -> Step {
        self.push_cell(self.regs.cip)?;
        self.regs.cip = target;
        NEXT
    }

    // =========================
    // Jumps
    // =========================

    pub(super) fn op_jump(&mut self, target: Cell) -> Step {
        self.jump_if(true, target)
    }

    pub(super) fn op_jzer(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri == 0, target)
    }

    pub(super) fn op_jnz(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri != 0, target)
    }

    pub(super) fn op_jeq(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri == self.regs.alt, target)
    }

    pub(super) fn op_jneq(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri != self.regs.alt, target)
    }

    pub(super) fn op_jsless(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri < self.regs.alt, target)
    }

    pub(super) fn op_jsleq(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri <= self.regs.alt, target)
    }

    pub(super) fn op_jsgrtr(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri > self.regs.alt, target)
    }

    pub(super) fn op_jsgeq(&mut self, target: Cell) -> Step {
        self.jump_if(self.regs.pri >= self.regs.alt, target)
    }

    /// Jumps through the case table at `table`; `pri` selects the record.
    pub(super) fn op_switch(&mut self, table: Cell) -> Step {
        if self.code.read_cell(table)? != Instruction::Casetbl as Cell {
            return Err(AmxError::InvInstr);
        }
        let records = self.code.read_cell(table + CELL)?;
        let mut target = self.jump_at(table + 2 * CELL)?;
        for record in 0..records {
            let at = table + (3 + 2 * record) * CELL;
            if self.code.read_cell(at)? == self.regs.pri {
                target = self.jump_at(at + CELL)?;
                break;
            }
        }
        self.regs.cip = target;
        NEXT
    }

    // =========================
    // Arithmetic and logic
    // =========================

    pub(super) fn op_shl(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_shl(self.regs.alt as u32);
        NEXT
    }

    pub(super) fn op_shr(&mut self) -> Step {
        self.regs.pri = (self.regs.pri as UCell).wrapping_shr(self.regs.alt as u32) as Cell;
        NEXT
    }

    pub(super) fn op_sshr(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_shr(self.regs.alt as u32);
        NEXT
    }

    pub(super) fn op_shl_c_pri(&mut self, shift: Cell) -> Step {
        self.regs.pri = self.regs.pri.wrapping_shl(shift as u32);
        NEXT
    }

    pub(super) fn op_shl_c_alt(&mut self, shift: Cell) -> Step {
        self.regs.alt = self.regs.alt.wrapping_shl(shift as u32);
        NEXT
    }

    pub(super) fn op_smul(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_mul(self.regs.alt);
        NEXT
    }

    pub(super) fn op_smul_c(&mut self, value: Cell) -> Step {
        self.regs.pri = self.regs.pri.wrapping_mul(value);
        NEXT
    }

    /// `pri = alt / pri`, `alt = alt mod pri`, rounding toward negative infinity.
    pub(super) fn op_sdiv(&mut self) -> Step {
        let (quotient, remainder) = floored_div(self.regs.alt, self.regs.pri)?;
        self.regs.pri = quotient;
        self.regs.alt = remainder;
        NEXT
    }

    /// `pri = pri / alt`, `alt = pri mod alt`.
    pub(super) fn op_sdiv_inv(&mut self) -> Step {
        let (quotient, remainder) = floored_div(self.regs.pri, self.regs.alt)?;
        self.regs.pri = quotient;
        self.regs.alt = remainder;
        NEXT
    }

    pub(super) fn op_add(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_add(self.regs.alt);
        NEXT
    }

    pub(super) fn op_add_c(&mut self, value: Cell) -> Step {
        self.regs.pri = self.regs.pri.wrapping_add(value);
        NEXT
    }

    pub(super) fn op_sub(&mut self) -> Step {
        self.regs.pri = self.regs.alt.wrapping_sub(self.regs.pri);
        NEXT
    }

    pub(super) fn op_sub_inv(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_sub(self.regs.alt);
        NEXT
    }

    pub(super) fn op_and(&mut self) -> Step {
        self.regs.pri &= self.regs.alt;
        NEXT
    }

    pub(super) fn op_or(&mut self) -> Step {
        self.regs.pri |= self.regs.alt;
        NEXT
    }

    pub(super) fn op_xor(&mut self) -> Step {
        self.regs.pri ^= self.regs.alt;
        NEXT
    }

    pub(super) fn op_not(&mut self) -> Step {
        self.regs.pri = (self.regs.pri == 0) as Cell;
        NEXT
    }

    pub(super) fn op_neg(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_neg();
        NEXT
    }

    pub(super) fn op_invert(&mut self) -> Step {
        self.regs.pri = !self.regs.pri;
        NEXT
    }

    pub(super) fn op_eq(&mut self) -> Step {
        self.regs.pri = (self.regs.pri == self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_neq(&mut self) -> Step {
        self.regs.pri = (self.regs.pri != self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_sless(&mut self) -> Step {
        self.regs.pri = (self.regs.pri < self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_sleq(&mut self) -> Step {
        self.regs.pri = (self.regs.pri <= self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_sgrtr(&mut self) -> Step {
        self.regs.pri = (self.regs.pri > self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_sgeq(&mut self) -> Step {
        self.regs.pri = (self.regs.pri >= self.regs.alt) as Cell;
        NEXT
    }

    pub(super) fn op_eq_c_pri(&mut self, value: Cell) -> Step {
        self.regs.pri = (self.regs.pri == value) as Cell;
        NEXT
    }

    pub(super) fn op_eq_c_alt(&mut self, value: Cell) -> Step {
        self.regs.pri = (self.regs.alt == value) as Cell;
        NEXT
    }

    pub(super) fn op_inc_pri(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_add(1);
        NEXT
    }

    pub(super) fn op_inc_alt(&mut self) -> Step {
        self.regs.alt = self.regs.alt.wrapping_add(1);
        NEXT
    }

    pub(super) fn op_dec_pri(&mut self) -> Step {
        self.regs.pri = self.regs.pri.wrapping_sub(1);
        NEXT
    }

    pub(super) fn op_dec_alt(&mut self) -> Step {
        self.regs.alt = self.regs.alt.wrapping_sub(1);
        NEXT
    }

    fn add_at(&mut self, addr: Cell, delta: Cell, checked: bool) -> Step {
        let value = if checked { self.read_checked(addr)? } else { self.read(addr)? };
        self.write(addr, value.wrapping_add(delta))?;
        NEXT
    }

    pub(super) fn op_inc_i(&mut self) -> Step {
        self.add_at(self.regs.pri, 1, true)
    }

    pub(super) fn op_dec_i(&mut self) -> Step {
        self.add_at(self.regs.pri, -1, true)
    }

    pub(super) fn op_inc(&mut self, addr: Cell) -> Step {
        self.add_at(addr, 1, false)
    }

    pub(super) fn op_inc_s(&mut self, offs: Cell) -> Step {
        self.add_at(self.frame(offs), 1, false)
    }

    pub(super) fn op_dec(&mut self, addr: Cell) -> Step {
        self.add_at(addr, -1, false)
    }

    pub(super) fn op_dec_s(&mut self, offs: Cell) -> Step {
        self.add_at(self.frame(offs), -1, false)
    }

    // =========================
    // Block memory
    // =========================

    /// Copies `bytes` bytes from `[pri]` to `[alt]`.
    pub(super) fn op_movs(&mut self, bytes: Cell) -> Step {
        let len = self.check_bytes(self.regs.pri, bytes)?;
        self.check_bytes(self.regs.alt, bytes)?;
        self.memory.copy_within(self.regs.pri, self.regs.alt, len)?;
        NEXT
    }

    /// Compares `bytes` bytes at `[alt]` and `[pri]`; `pri` gets the
    /// difference of the first mismatching pair, or 0.
    pub(super) fn op_cmps(&mut self, bytes: Cell) -> Step {
        let len = self.check_bytes(self.regs.pri, bytes)?;
        self.check_bytes(self.regs.alt, bytes)?;
        let left = self.memory.slice(self.regs.alt, len)?;
        let right = self.memory.slice(self.regs.pri, len)?;
        self.regs.pri = left
            .iter()
            .zip(right)
            .find(|(a, b)| a != b)
            .map_or(0, |(&a, &b)| a as Cell - b as Cell);
        NEXT
    }

    /// Fills `bytes` bytes at `[alt]` with copies of `pri`, whole cells only.
    pub(super) fn op_fill(&mut self, bytes: Cell) -> Step {
        self.check_bytes(self.regs.alt, bytes)?;
        let mut addr = self.regs.alt;
        let mut left = bytes;
        while left >= CELL {
            self.write(addr, self.regs.pri)?;
            addr += CELL;
            left -= CELL;
        }
        NEXT
    }

    // =========================
    // Control
    // =========================

    pub(super) fn op_halt(&mut self, code: Cell) -> Step {
        match AmxError::from_code(code as i32) {
            None => Ok(Flow::Halt(self.regs.pri)),
            Some(error) => Err(error),
        }
    }

    pub(super) fn op_bounds(&mut self, limit: Cell) -> Step {
        if self.regs.pri as UCell > limit as UCell {
            return Err(AmxError::Bounds);
        }
        NEXT
    }

    pub(super) fn op_break(&mut self) -> Step {
        if let Some(hook) = self.debug_hook.clone() {
            hook.on_break(self)?;
        }
        NEXT
    }

    // =========================
    // Native calls
    // =========================

    /// Reads the parameter block at the top of the stack.
    fn native_params(&self) -> Result<Vec<Cell>, AmxError> {
        let bytes = self.read(self.regs.stk)?;
        let count = usize::try_from(bytes).map_err(|_| AmxError::Native)? / CELL_SIZE;
        self.memory.read_cells(self.regs.stk, count + 1)
    }

    /// Runs a native and folds a raised error into the result. A sleep
    /// request still stores the native's return value in `pri`.
    fn invoke_native(&mut self, index: Cell, direct: bool) -> Result<(), AmxError> {
        let params = self.native_params()?;
        self.error = None;
        let result = if direct {
            self.call_native(index, &params)
        } else {
            let callback = self.callback.clone().ok_or(AmxError::Callback)?;
            callback.call(self, index, &params)
        };
        let value = result?;
        match self.error {
            None => {
                self.regs.pri = value;
                Ok(())
            }
            Some(AmxError::Sleep) => {
                self.regs.pri = value;
                Err(AmxError::Sleep)
            }
            Some(error) => Err(error),
        }
    }

    /// Rewrites the opcode at `site` to its direct form when allowed.
    fn patch_call_site(&mut self, site: Cell, index: Cell, direct: Instruction) -> Result<(), AmxError> {
        let allowed = self.direct_patch
            && self.callback.as_ref().is_some_and(|callback| callback.allows_direct_patch())
            && usize::try_from(index)
                .ok()
                .and_then(|index| self.natives.get(index))
                .is_some_and(Option::is_some);
        if allowed {
            self.code.patch(site, direct as Cell)?;
        }
        Ok(())
    }

    pub(super) fn op_sysreq(&mut self, index: Cell) -> Step {
        let site = self.regs.cip - 2 * CELL;
        self.patch_call_site(site, index, Instruction::SysreqD)?;
        self.invoke_native(index, false)?;
        NEXT
    }

    pub(super) fn op_sysreq_d(&mut self, index: Cell) -> Step {
        self.invoke_native(index, true)?;
        NEXT
    }

    /// Pushes the argument size, calls, and drops the arguments again.
    fn sysreq_with_args(&mut self, index: Cell, bytes: Cell, direct: bool) -> Step {
        self.push_cell(bytes)?;
        let result = self.invoke_native(index, direct);
        self.regs.stk = self.regs.stk.wrapping_add(bytes).wrapping_add(CELL);
        result?;
        NEXT
    }

    pub(super) fn op_sysreq_n(&mut self, index: Cell, bytes: Cell) -> Step {
        let site = self.regs.cip - 3 * CELL;
        self.patch_call_site(site, index, Instruction::SysreqNd)?;
        self.sysreq_with_args(index, bytes, false)
    }

    pub(super) fn op_sysreq_nd(&mut self, index: Cell, bytes: Cell) -> Step {
        self.sysreq_with_args(index, bytes, true)
    }

    // =========================
    // Overlays
    // =========================

    pub(super) fn op_call_ovl(&mut self, overlay: Cell) -> Step {
        let word = ((self.regs.cip as UCell) << OVERLAY_SHIFT) | (self.ovl_index as UCell & OVERLAY_MASK);
        self.push_cell(word as Cell)?;
        self.load_overlay(overlay)?;
        self.regs.cip = 0;
        NEXT
    }

    pub(super) fn op_retn_ovl(&mut self) -> Step {
        self.regs.frm = self.pop_cell()?;
        let word = self.pop_cell()? as UCell;
        let overlay = (word & OVERLAY_MASK) as Cell;
        let offs = (word >> OVERLAY_SHIFT) as Cell;
        self.pop_arguments()?;
        self.load_overlay(overlay).map_err(|_| AmxError::MemAccess)?;
        if offs < 0 || offs as usize >= self.code.len() {
            return Err(AmxError::MemAccess);
        }
        self.regs.cip = offs;
        NEXT
    }

    /// Like `SWITCH`, but the table selects an overlay to enter.
    pub(super) fn op_switch_ovl(&mut self, table: Cell) -> Step {
        if self.code.read_cell(table)? != Instruction::CasetblOvl as Cell {
            return Err(AmxError::InvInstr);
        }
        let records = self.code.read_cell(table + CELL)?;
        let mut overlay = self.code.read_cell(table + 2 * CELL)?;
        for record in 0..records {
            let at = table + (3 + 2 * record) * CELL;
            if self.code.read_cell(at)? == self.regs.pri {
                overlay = self.code.read_cell(at + CELL)?;
                break;
            }
        }
        self.load_overlay(overlay)?;
        self.regs.cip = 0;
        NEXT
    }
}
