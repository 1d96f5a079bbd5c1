//! Interpreter bodies.
//!
//! Both built-in executors are generated from [`dispatch_table!`], which maps
//! every instruction to its handler on [`Machine`] and names the operands the
//! handler takes. How each operand is decoded comes from the instruction
//! table. Packed forms reuse the handler of their unpacked twin and read the
//! operand from the opcode cell instead of the next code cell.

use super::Machine;
use crate::machine::cell::{Cell, split_opcode};
use crate::machine::errors::AmxError;
use crate::machine::isa::{Instruction, NUM_OPCODES, OperandKind};
use crate::machine::verifier::VerifyReport;

/// Outcome of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// `HALT 0`: the call finished with `pri` as its result.
    Halt(Cell),
}

pub type Step = Result<Flow, AmxError>;

/// Runs code until the current call halts or fails.
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Executes from the machine's current `cip`.
    fn run(&self, machine: &mut Machine) -> Result<Cell, AmxError>;

    /// Whether the executor translates code ahead of time. Compiling
    /// executors cannot run overlays or patch native call sites.
    fn compiles(&self) -> bool {
        false
    }

    /// Called once at load, after verification. INITJIT rejects the image.
    fn prepare(&self, report: &VerifyReport) -> Result<(), AmxError> {
        let _ = report;
        Ok(())
    }
}

/// Invokes `$callback` with the handler of every instruction.
macro_rules! dispatch_table {
    ($callback:ident) => {
        $callback! {
            Nop => op_nop(),
            LoadPri => op_load_pri(addr),
            LoadAlt => op_load_alt(addr),
            LoadSPri => op_load_s_pri(offs),
            LoadSAlt => op_load_s_alt(offs),
            LrefSPri => op_lref_s_pri(offs),
            LrefSAlt => op_lref_s_alt(offs),
            LoadI => op_load_i(),
            LodbI => op_lodb_i(width),
            ConstPri => op_const_pri(value),
            ConstAlt => op_const_alt(value),
            AddrPri => op_addr_pri(offs),
            AddrAlt => op_addr_alt(offs),
            Stor => op_stor(addr),
            StorS => op_stor_s(offs),
            SrefS => op_sref_s(offs),
            StorI => op_stor_i(),
            StrbI => op_strb_i(width),
            AlignPri => op_align_pri(width),
            Lctrl => op_lctrl(index),
            Sctrl => op_sctrl(index),
            Xchg => op_xchg(),
            PushPri => op_push_pri(),
            PushAlt => op_push_alt(),
            PushrPri => op_push_pri(),
            PopPri => op_pop_pri(),
            PopAlt => op_pop_alt(),
            Pick => op_pick(offs),
            Stack => op_stack(bytes),
            Heap => op_heap(bytes),
            Proc => op_proc(),
            Ret => op_ret(),
            Retn => op_retn(),
            Call => op_call(target),
            Jump => op_jump(target),
            Jzer => op_jzer(target),
            Jnz => op_jnz(target),
            Shl => op_shl(),
            Shr => op_shr(),
            Sshr => op_sshr(),
            ShlCPri => op_shl_c_pri(shift),
            ShlCAlt => op_shl_c_alt(shift),
            Smul => op_smul(),
            Sdiv => op_sdiv(),
            Add => op_add(),
            Sub => op_sub(),
            And => op_and(),
            Or => op_or(),
            Xor => op_xor(),
            Not => op_not(),
            Neg => op_neg(),
            Invert => op_invert(),
            Eq => op_eq(),
            Neq => op_neq(),
            Sless => op_sless(),
            Sleq => op_sleq(),
            Sgrtr => op_sgrtr(),
            Sgeq => op_sgeq(),
            IncPri => op_inc_pri(),
            IncAlt => op_inc_alt(),
            IncI => op_inc_i(),
            DecPri => op_dec_pri(),
            DecAlt => op_dec_alt(),
            DecI => op_dec_i(),
            Movs => op_movs(bytes),
            Cmps => op_cmps(bytes),
            Fill => op_fill(bytes),
            Halt => op_halt(code),
            Bounds => op_bounds(limit),
            Sysreq => op_sysreq(index),
            Switch => op_switch(table),
            SwapPri => op_swap_pri(),
            SwapAlt => op_swap_alt(),
            Break => op_break(),
            Casetbl => op_invalid(),
            SysreqD => op_sysreq_d(index),
            SysreqNd => op_sysreq_nd(index, bytes),
            CallOvl => op_call_ovl(overlay),
            RetnOvl => op_retn_ovl(),
            SwitchOvl => op_switch_ovl(table),
            CasetblOvl => op_invalid(),
            Lidx => op_lidx(),
            LidxB => op_lidx_b(shift),
            Idxaddr => op_idxaddr(),
            IdxaddrB => op_idxaddr_b(shift),
            PushC => op_push_c(value),
            Push => op_push(addr),
            PushS => op_push_s(offs),
            PushAdr => op_push_adr(offs),
            PushrC => op_push_c(value),
            PushrS => op_push_s(offs),
            PushrAdr => op_push_adr(offs),
            Jeq => op_jeq(target),
            Jneq => op_jneq(target),
            Jsless => op_jsless(target),
            Jsleq => op_jsleq(target),
            Jsgrtr => op_jsgrtr(target),
            Jsgeq => op_jsgeq(target),
            SdivInv => op_sdiv_inv(),
            SubInv => op_sub_inv(),
            AddC => op_add_c(value),
            SmulC => op_smul_c(value),
            ZeroPri => op_zero_pri(),
            ZeroAlt => op_zero_alt(),
            Zero => op_zero(addr),
            ZeroS => op_zero_s(offs),
            EqCPri => op_eq_c_pri(value),
            EqCAlt => op_eq_c_alt(value),
            Inc => op_inc(addr),
            IncS => op_inc_s(offs),
            Dec => op_dec(addr),
            DecS => op_dec_s(offs),
            SysreqN => op_sysreq_n(index, bytes),
            PushmC => op_pushm_c(count),
            Pushm => op_pushm(count),
            PushmS => op_pushm_s(count),
            PushmAdr => op_pushm_adr(count),
            PushrmC => op_pushm_c(count),
            PushrmS => op_pushm_s(count),
            PushrmAdr => op_pushm_adr(count),
            Load2 => op_load2(first, second),
            Load2S => op_load2_s(first, second),
            Const => op_const(addr, value),
            ConstS => op_const_s(offs, value),
            LoadPPri => op_load_pri(addr),
            LoadPAlt => op_load_alt(addr),
            LoadPSPri => op_load_s_pri(offs),
            LoadPSAlt => op_load_s_alt(offs),
            LrefPSPri => op_lref_s_pri(offs),
            LrefPSAlt => op_lref_s_alt(offs),
            LodbPI => op_lodb_i(width),
            ConstPPri => op_const_pri(value),
            ConstPAlt => op_const_alt(value),
            AddrPPri => op_addr_pri(offs),
            AddrPAlt => op_addr_alt(offs),
            StorP => op_stor(addr),
            StorPS => op_stor_s(offs),
            SrefPS => op_sref_s(offs),
            StrbPI => op_strb_i(width),
            LidxPB => op_lidx_b(shift),
            IdxaddrPB => op_idxaddr_b(shift),
            AlignPPri => op_align_pri(width),
            PushPC => op_push_c(value),
            PushP => op_push(addr),
            PushPS => op_push_s(offs),
            PushPAdr => op_push_adr(offs),
            PushrPC => op_push_c(value),
            PushrPS => op_push_s(offs),
            PushrPAdr => op_push_adr(offs),
            PushmPC => op_pushm_c(count),
            PushmP => op_pushm(count),
            PushmPS => op_pushm_s(count),
            PushmPAdr => op_pushm_adr(count),
            PushrmPC => op_pushm_c(count),
            PushrmPS => op_pushm_s(count),
            PushrmPAdr => op_pushm_adr(count),
            StackP => op_stack(bytes),
            HeapP => op_heap(bytes),
            ShlPCPri => op_shl_c_pri(shift),
            ShlPCAlt => op_shl_c_alt(shift),
            AddPC => op_add_c(value),
            SmulPC => op_smul_c(value),
            ZeroP => op_zero(addr),
            ZeroPS => op_zero_s(offs),
            EqPCPri => op_eq_c_pri(value),
            EqPCAlt => op_eq_c_alt(value),
            IncP => op_inc(addr),
            IncPS => op_inc_s(offs),
            DecP => op_dec(addr),
            DecPS => op_dec_s(offs),
            MovsP => op_movs(bytes),
            CmpsP => op_cmps(bytes),
            FillP => op_fill(bytes),
            HaltP => op_halt(code),
            BoundsP => op_bounds(limit),
        }
    };
}

/// Decodes the next operand of an instruction whose operand kinds are
/// `kinds`. Lists decode to their count; the handler reads the values itself.
#[inline(always)]
fn next_operand(
    m: &mut Machine,
    param: Cell,
    kinds: &[OperandKind],
    next: &mut usize,
) -> Result<Cell, AmxError> {
    let kind = kinds.get(*next).copied().ok_or(AmxError::InvInstr)?;
    *next += 1;
    match kind {
        OperandKind::Jump => m.fetch_jump(),
        kind if kind.is_packed() => Ok(param),
        _ => m.fetch(),
    }
}

/// Binds the handler's operands in order, taking their kinds from the
/// instruction table.
macro_rules! bind_operands {
    ($m:ident, $param:ident, $variant:ident, $( $field:ident ),*) => {
        #[allow(unused_variables)]
        let kinds = Instruction::$variant.operands();
        #[allow(unused_mut, unused_variables)]
        let mut next = 0usize;
        $( let $field = next_operand($m, $param, kinds, &mut next)?; )*
    };
}

macro_rules! switch_dispatch {
    ($( $variant:ident => $handler:ident ( $( $field:ident ),* ) ),* $(,)?) => {
        /// Executes one decoded instruction.
        pub(super) fn dispatch_switch(m: &mut Machine, instr: Instruction, param: Cell) -> Step {
            match instr {
                $(
                    Instruction::$variant => {
                        bind_operands!(m, param, $variant, $( $field ),*);
                        m.$handler($( $field ),*)
                    }
                )*
            }
        }
    };
}

dispatch_table!(switch_dispatch);

/// Decodes each instruction and dispatches through one `match`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchExecutor;

impl Executor for SwitchExecutor {
    fn name(&self) -> &'static str {
        "switch"
    }

    fn run(&self, machine: &mut Machine) -> Result<Cell, AmxError> {
        loop {
            if let Flow::Halt(value) = machine.step()? {
                return Ok(value);
            }
        }
    }
}

type Handler = fn(&mut Machine, Cell) -> Step;

fn invalid_opcode(_: &mut Machine, _: Cell) -> Step {
    Err(AmxError::InvInstr)
}

macro_rules! threaded_handlers {
    ($( $variant:ident => $handler:ident ( $( $field:ident ),* ) ),* $(,)?) => {
        fn handler_table() -> Vec<Handler> {
            let mut table: Vec<Handler> = vec![invalid_opcode as Handler; NUM_OPCODES];
            $(
                table[Instruction::$variant as usize] = {
                    #[allow(unused_variables)]
                    fn handler(m: &mut Machine, param: Cell) -> Step {
                        bind_operands!(m, param, $variant, $( $field ),*);
                        m.$handler($( $field ),*)
                    }
                    handler
                };
            )*
            table
        }
    };
}

dispatch_table!(threaded_handlers);

/// Jumps through a table of per-opcode handlers, skipping the decode into
/// [`Instruction`].
pub struct ThreadedExecutor {
    table: Vec<Handler>,
}

impl ThreadedExecutor {
    pub fn new() -> Self {
        Self {
            table: handler_table(),
        }
    }
}

impl Default for ThreadedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadedExecutor {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn run(&self, machine: &mut Machine) -> Result<Cell, AmxError> {
        loop {
            let (opcode, param) = split_opcode(machine.fetch()?);
            let handler = usize::try_from(opcode)
                .ok()
                .and_then(|opcode| self.table.get(opcode))
                .ok_or(AmxError::InvInstr)?;
            if let Flow::Halt(value) = handler(machine, param)? {
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! handler_arities {
        ($( $variant:ident => $handler:ident ( $( $field:ident ),* ) ),* $(,)?) => {
            vec![$(
                (Instruction::$variant, stringify!($handler), {
                    let fields: &[&str] = &[$( stringify!($field) ),*];
                    fields.len()
                }),
            )*]
        };
    }

    #[test]
    fn handlers_take_one_value_per_operand() {
        let arities = dispatch_table!(handler_arities);
        assert_eq!(arities.len(), NUM_OPCODES);
        for (instr, handler, fields) in arities {
            if handler == "op_invalid" {
                continue;
            }
            assert_eq!(fields, instr.operands().len(), "{}", instr.mnemonic());
        }
    }

    #[test]
    fn handler_table_covers_every_opcode() {
        assert_eq!(handler_table().len(), NUM_OPCODES);
        for opcode in 0..NUM_OPCODES {
            assert!(Instruction::try_from(opcode as u8).is_ok(), "gap at opcode {opcode}");
        }
    }
}
