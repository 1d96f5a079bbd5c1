//! Instruction set definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical instruction list and invokes a callback macro for code
//! generation, so the verifier, the executors and the assembler all derive
//! from one table.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - Per-instruction mnemonic, [`OpClass`] and operand [`OperandKind`]s
//!
//! # Bytecode Format
//!
//! Every item in the code segment is one cell, stored little-endian:
//! - Opcode cell: opcode in the lower half, packed parameter in the upper half
//!   (packed `*_P_*` forms only; zero otherwise)
//! - Operand cells follow the opcode; their count is given by the operand kinds
//! - Jump operands are relative: `target = opcode_address + operand`

use super::cell::{Cell, split_opcode};
use super::errors::AmxError;

/// How an operand is encoded and what the verifier checks about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Plain cell, unchecked.
    Imm,
    /// Data-segment address, must lie in `[0, datasize)`.
    Data,
    /// Frame offset, must lie in `[-stacksize, stacksize]`.
    Frame,
    /// Relative code offset, target must lie inside the code segment.
    Jump,
    /// Native function index.
    Native,
    /// Overlay index.
    Ovl,
    /// Cell count followed by that many cells.
    List,
    /// Case table: record count, default jump, then value/jump pairs.
    CaseTable,
    /// Overlay case table: record count, default overlay, then value/overlay pairs.
    OvlCaseTable,
    /// Packed parameter, unchecked.
    PImm,
    /// Packed data-segment address.
    PData,
    /// Packed frame offset.
    PFrame,
    /// Packed cell count followed by that many cells.
    PList,
}

impl OperandKind {
    /// Whether the operand lives in the opcode cell instead of its own cell.
    pub const fn is_packed(self) -> bool {
        matches!(
            self,
            OperandKind::PImm | OperandKind::PData | OperandKind::PFrame | OperandKind::PList
        )
    }
}

/// Verifier-relevant category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Ordinary instruction.
    Plain,
    /// Native call by index.
    Sysreq,
    /// Native call by index with an inline argument size.
    SysreqN,
    /// Direct native call written by the machine itself; never valid in an image.
    Patched,
    /// Needs overlay support.
    Overlay,
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// Entry format: `Name = opcode, "MNEMONIC" => [field: Kind, ...], Class,`
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Load and store
            // =========================
            /// NOP ; no operation
            Nop = 0, "NOP" => [], Plain,
            /// LOAD_PRI addr ; pri = [addr]
            LoadPri = 1, "LOAD_PRI" => [addr: Data], Plain,
            /// LOAD_ALT addr ; alt = [addr]
            LoadAlt = 2, "LOAD_ALT" => [addr: Data], Plain,
            /// LOAD_S_PRI offs ; pri = [frm + offs]
            LoadSPri = 3, "LOAD_S_PRI" => [offs: Frame], Plain,
            /// LOAD_S_ALT offs ; alt = [frm + offs]
            LoadSAlt = 4, "LOAD_S_ALT" => [offs: Frame], Plain,
            /// LREF_S_PRI offs ; pri = [[frm + offs]]
            LrefSPri = 5, "LREF_S_PRI" => [offs: Frame], Plain,
            /// LREF_S_ALT offs ; alt = [[frm + offs]]
            LrefSAlt = 6, "LREF_S_ALT" => [offs: Frame], Plain,
            /// LOAD_I ; pri = [pri]
            LoadI = 7, "LOAD_I" => [], Plain,
            /// LODB_I width ; pri = width bytes at pri
            LodbI = 8, "LODB_I" => [width: Imm], Plain,
            /// CONST_PRI value ; pri = value
            ConstPri = 9, "CONST_PRI" => [value: Imm], Plain,
            /// CONST_ALT value ; alt = value
            ConstAlt = 10, "CONST_ALT" => [value: Imm], Plain,
            /// ADDR_PRI offs ; pri = frm + offs
            AddrPri = 11, "ADDR_PRI" => [offs: Imm], Plain,
            /// ADDR_ALT offs ; alt = frm + offs
            AddrAlt = 12, "ADDR_ALT" => [offs: Imm], Plain,
            /// STOR addr ; [addr] = pri
            Stor = 13, "STOR" => [addr: Data], Plain,
            /// STOR_S offs ; [frm + offs] = pri
            StorS = 14, "STOR_S" => [offs: Frame], Plain,
            /// SREF_S offs ; [[frm + offs]] = pri
            SrefS = 15, "SREF_S" => [offs: Frame], Plain,
            /// STOR_I ; [alt] = pri
            StorI = 16, "STOR_I" => [], Plain,
            /// STRB_I width ; width bytes at alt = pri
            StrbI = 17, "STRB_I" => [width: Imm], Plain,
            /// ALIGN_PRI width ; little-endian sub-cell address fix-up
            AlignPri = 18, "ALIGN_PRI" => [width: Imm], Plain,
            /// LCTRL index ; pri = control register
            Lctrl = 19, "LCTRL" => [index: Imm], Plain,
            /// SCTRL index ; control register = pri
            Sctrl = 20, "SCTRL" => [index: Imm], Plain,
            /// XCHG ; swap pri and alt
            Xchg = 21, "XCHG" => [], Plain,
            // =========================
            // Stack and frames
            // =========================
            /// PUSH_PRI ; push pri
            PushPri = 22, "PUSH_PRI" => [], Plain,
            /// PUSH_ALT ; push alt
            PushAlt = 23, "PUSH_ALT" => [], Plain,
            /// PUSHR_PRI ; push pri (data-relative)
            PushrPri = 24, "PUSHR_PRI" => [], Plain,
            /// POP_PRI ; pop into pri
            PopPri = 25, "POP_PRI" => [], Plain,
            /// POP_ALT ; pop into alt
            PopAlt = 26, "POP_ALT" => [], Plain,
            /// PICK offs ; pri = [stk + offs]
            Pick = 27, "PICK" => [offs: Imm], Plain,
            /// STACK bytes ; alt = stk, stk += bytes
            Stack = 28, "STACK" => [bytes: Imm], Plain,
            /// HEAP bytes ; alt = hea, hea += bytes
            Heap = 29, "HEAP" => [bytes: Imm], Plain,
            /// PROC ; push frm, frm = stk
            Proc = 30, "PROC" => [], Plain,
            /// RET ; pop frm, pop cip
            Ret = 31, "RET" => [], Plain,
            /// RETN ; pop frm, pop cip, drop arguments
            Retn = 32, "RETN" => [], Plain,
            /// CALL target ; push return address, jump
            Call = 33, "CALL" => [target: Jump], Plain,
            // =========================
            // Branches
            // =========================
            /// JUMP target ; unconditional jump
            Jump = 34, "JUMP" => [target: Jump], Plain,
            /// JZER target ; jump if pri == 0
            Jzer = 35, "JZER" => [target: Jump], Plain,
            /// JNZ target ; jump if pri != 0
            Jnz = 36, "JNZ" => [target: Jump], Plain,
            // =========================
            // Arithmetic and logic
            // =========================
            /// SHL ; pri <<= alt
            Shl = 37, "SHL" => [], Plain,
            /// SHR ; pri >>= alt (logical)
            Shr = 38, "SHR" => [], Plain,
            /// SSHR ; pri >>= alt (arithmetic)
            Sshr = 39, "SSHR" => [], Plain,
            /// SHL_C_PRI shift ; pri <<= shift
            ShlCPri = 40, "SHL_C_PRI" => [shift: Imm], Plain,
            /// SHL_C_ALT shift ; alt <<= shift
            ShlCAlt = 41, "SHL_C_ALT" => [shift: Imm], Plain,
            /// SMUL ; pri *= alt
            Smul = 42, "SMUL" => [], Plain,
            /// SDIV ; pri = alt / pri, alt = alt mod pri (floored)
            Sdiv = 43, "SDIV" => [], Plain,
            /// ADD ; pri += alt
            Add = 44, "ADD" => [], Plain,
            /// SUB ; pri = alt - pri
            Sub = 45, "SUB" => [], Plain,
            /// AND ; pri &= alt
            And = 46, "AND" => [], Plain,
            /// OR ; pri |= alt
            Or = 47, "OR" => [], Plain,
            /// XOR ; pri ^= alt
            Xor = 48, "XOR" => [], Plain,
            /// NOT ; pri = !pri (logical)
            Not = 49, "NOT" => [], Plain,
            /// NEG ; pri = -pri
            Neg = 50, "NEG" => [], Plain,
            /// INVERT ; pri = ~pri
            Invert = 51, "INVERT" => [], Plain,
            /// EQ ; pri = pri == alt
            Eq = 52, "EQ" => [], Plain,
            /// NEQ ; pri = pri != alt
            Neq = 53, "NEQ" => [], Plain,
            /// SLESS ; pri = pri < alt
            Sless = 54, "SLESS" => [], Plain,
            /// SLEQ ; pri = pri <= alt
            Sleq = 55, "SLEQ" => [], Plain,
            /// SGRTR ; pri = pri > alt
            Sgrtr = 56, "SGRTR" => [], Plain,
            /// SGEQ ; pri = pri >= alt
            Sgeq = 57, "SGEQ" => [], Plain,
            /// INC_PRI ; pri += 1
            IncPri = 58, "INC_PRI" => [], Plain,
            /// INC_ALT ; alt += 1
            IncAlt = 59, "INC_ALT" => [], Plain,
            /// INC_I ; [pri] += 1
            IncI = 60, "INC_I" => [], Plain,
            /// DEC_PRI ; pri -= 1
            DecPri = 61, "DEC_PRI" => [], Plain,
            /// DEC_ALT ; alt -= 1
            DecAlt = 62, "DEC_ALT" => [], Plain,
            /// DEC_I ; [pri] -= 1
            DecI = 63, "DEC_I" => [], Plain,
            // =========================
            // Block memory, halting, natives
            // =========================
            /// MOVS bytes ; copy bytes from [pri] to [alt]
            Movs = 64, "MOVS" => [bytes: Imm], Plain,
            /// CMPS bytes ; pri = compare bytes at [alt] and [pri]
            Cmps = 65, "CMPS" => [bytes: Imm], Plain,
            /// FILL bytes ; fill bytes at [alt] with pri
            Fill = 66, "FILL" => [bytes: Imm], Plain,
            /// HALT code ; stop with exit code
            Halt = 67, "HALT" => [code: Imm], Plain,
            /// BOUNDS limit ; abort if pri > limit (unsigned)
            Bounds = 68, "BOUNDS" => [limit: Imm], Plain,
            /// SYSREQ index ; call native
            Sysreq = 69, "SYSREQ" => [index: Native], Sysreq,
            /// SWITCH table ; jump through a case table
            Switch = 70, "SWITCH" => [table: Jump], Plain,
            /// SWAP_PRI ; exchange pri with top of stack
            SwapPri = 71, "SWAP_PRI" => [], Plain,
            /// SWAP_ALT ; exchange alt with top of stack
            SwapAlt = 72, "SWAP_ALT" => [], Plain,
            /// BREAK ; call the debug hook
            Break = 73, "BREAK" => [], Plain,
            /// CASETBL ; case table data, invalid when executed
            Casetbl = 74, "CASETBL" => [table: CaseTable], Plain,
            /// SYSREQ_D index ; patched native call
            SysreqD = 75, "SYSREQ_D" => [index: Native], Patched,
            /// SYSREQ_ND index, bytes ; patched native call with argument size
            SysreqNd = 76, "SYSREQ_ND" => [index: Native, bytes: Imm], Patched,
            // =========================
            // Overlays
            // =========================
            /// CALL_OVL overlay ; call into an overlay
            CallOvl = 77, "CALL_OVL" => [overlay: Ovl], Overlay,
            /// RETN_OVL ; return from an overlay function
            RetnOvl = 78, "RETN_OVL" => [], Overlay,
            /// SWITCH_OVL table ; switch to an overlay through a case table
            SwitchOvl = 79, "SWITCH_OVL" => [table: Jump], Overlay,
            /// CASETBL_OVL ; overlay case table data
            CasetblOvl = 80, "CASETBL_OVL" => [table: OvlCaseTable], Overlay,
            // =========================
            // Macro instructions
            // =========================
            /// LIDX ; pri = [alt + pri * cell]
            Lidx = 81, "LIDX" => [], Plain,
            /// LIDX_B shift ; pri = [alt + (pri << shift)]
            LidxB = 82, "LIDX_B" => [shift: Imm], Plain,
            /// IDXADDR ; pri = alt + pri * cell
            Idxaddr = 83, "IDXADDR" => [], Plain,
            /// IDXADDR_B shift ; pri = alt + (pri << shift)
            IdxaddrB = 84, "IDXADDR_B" => [shift: Imm], Plain,
            /// PUSH_C value ; push value
            PushC = 85, "PUSH_C" => [value: Imm], Plain,
            /// PUSH addr ; push [addr]
            Push = 86, "PUSH" => [addr: Data], Plain,
            /// PUSH_S offs ; push [frm + offs]
            PushS = 87, "PUSH_S" => [offs: Frame], Plain,
            /// PUSH_ADR offs ; push frm + offs
            PushAdr = 88, "PUSH_ADR" => [offs: Imm], Plain,
            /// PUSHR_C value ; push value (data-relative)
            PushrC = 89, "PUSHR_C" => [value: Imm], Plain,
            /// PUSHR_S offs ; push [frm + offs] (data-relative)
            PushrS = 90, "PUSHR_S" => [offs: Frame], Plain,
            /// PUSHR_ADR offs ; push frm + offs (data-relative)
            PushrAdr = 91, "PUSHR_ADR" => [offs: Imm], Plain,
            /// JEQ target ; jump if pri == alt
            Jeq = 92, "JEQ" => [target: Jump], Plain,
            /// JNEQ target ; jump if pri != alt
            Jneq = 93, "JNEQ" => [target: Jump], Plain,
            /// JSLESS target ; jump if pri < alt
            Jsless = 94, "JSLESS" => [target: Jump], Plain,
            /// JSLEQ target ; jump if pri <= alt
            Jsleq = 95, "JSLEQ" => [target: Jump], Plain,
            /// JSGRTR target ; jump if pri > alt
            Jsgrtr = 96, "JSGRTR" => [target: Jump], Plain,
            /// JSGEQ target ; jump if pri >= alt
            Jsgeq = 97, "JSGEQ" => [target: Jump], Plain,
            /// SDIV_INV ; pri = pri / alt, alt = pri mod alt (floored)
            SdivInv = 98, "SDIV_INV" => [], Plain,
            /// SUB_INV ; pri -= alt
            SubInv = 99, "SUB_INV" => [], Plain,
            /// ADD_C value ; pri += value
            AddC = 100, "ADD_C" => [value: Imm], Plain,
            /// SMUL_C value ; pri *= value
            SmulC = 101, "SMUL_C" => [value: Imm], Plain,
            /// ZERO_PRI ; pri = 0
            ZeroPri = 102, "ZERO_PRI" => [], Plain,
            /// ZERO_ALT ; alt = 0
            ZeroAlt = 103, "ZERO_ALT" => [], Plain,
            /// ZERO addr ; [addr] = 0
            Zero = 104, "ZERO" => [addr: Imm], Plain,
            /// ZERO_S offs ; [frm + offs] = 0
            ZeroS = 105, "ZERO_S" => [offs: Imm], Plain,
            /// EQ_C_PRI value ; pri = pri == value
            EqCPri = 106, "EQ_C_PRI" => [value: Imm], Plain,
            /// EQ_C_ALT value ; pri = alt == value
            EqCAlt = 107, "EQ_C_ALT" => [value: Imm], Plain,
            /// INC addr ; [addr] += 1
            Inc = 108, "INC" => [addr: Data], Plain,
            /// INC_S offs ; [frm + offs] += 1
            IncS = 109, "INC_S" => [offs: Frame], Plain,
            /// DEC addr ; [addr] -= 1
            Dec = 110, "DEC" => [addr: Data], Plain,
            /// DEC_S offs ; [frm + offs] -= 1
            DecS = 111, "DEC_S" => [offs: Frame], Plain,
            /// SYSREQ_N index, bytes ; push bytes, call native, drop arguments
            SysreqN = 112, "SYSREQ_N" => [index: Native, bytes: Imm], SysreqN,
            /// PUSHM_C count, values.. ; push each value
            PushmC = 113, "PUSHM_C" => [values: List], Plain,
            /// PUSHM count, addrs.. ; push [addr] for each
            Pushm = 114, "PUSHM" => [addrs: List], Plain,
            /// PUSHM_S count, offsets.. ; push [frm + offs] for each
            PushmS = 115, "PUSHM_S" => [offsets: List], Plain,
            /// PUSHM_ADR count, offsets.. ; push frm + offs for each
            PushmAdr = 116, "PUSHM_ADR" => [offsets: List], Plain,
            /// PUSHRM_C count, values.. ; push each value (data-relative)
            PushrmC = 117, "PUSHRM_C" => [values: List], Plain,
            /// PUSHRM_S count, offsets.. ; push [frm + offs] for each (data-relative)
            PushrmS = 118, "PUSHRM_S" => [offsets: List], Plain,
            /// PUSHRM_ADR count, offsets.. ; push frm + offs for each (data-relative)
            PushrmAdr = 119, "PUSHRM_ADR" => [offsets: List], Plain,
            /// LOAD2 first, second ; pri = [first], alt = [second]
            Load2 = 120, "LOAD2" => [first: Data, second: Data], Plain,
            /// LOAD2_S first, second ; pri = [frm + first], alt = [frm + second]
            Load2S = 121, "LOAD2_S" => [first: Frame, second: Frame], Plain,
            /// CONST addr, value ; [addr] = value
            Const = 122, "CONST" => [addr: Data, value: Imm], Plain,
            /// CONST_S offs, value ; [frm + offs] = value
            ConstS = 123, "CONST_S" => [offs: Frame, value: Imm], Plain,
            // =========================
            // Packed forms
            // =========================
            /// LOAD_P_PRI addr ; packed LOAD_PRI
            LoadPPri = 124, "LOAD_P_PRI" => [addr: PData], Plain,
            /// LOAD_P_ALT addr ; packed LOAD_ALT
            LoadPAlt = 125, "LOAD_P_ALT" => [addr: PData], Plain,
            /// LOAD_P_S_PRI offs ; packed LOAD_S_PRI
            LoadPSPri = 126, "LOAD_P_S_PRI" => [offs: PFrame], Plain,
            /// LOAD_P_S_ALT offs ; packed LOAD_S_ALT
            LoadPSAlt = 127, "LOAD_P_S_ALT" => [offs: PFrame], Plain,
            /// LREF_P_S_PRI offs ; packed LREF_S_PRI
            LrefPSPri = 128, "LREF_P_S_PRI" => [offs: PFrame], Plain,
            /// LREF_P_S_ALT offs ; packed LREF_S_ALT
            LrefPSAlt = 129, "LREF_P_S_ALT" => [offs: PFrame], Plain,
            /// LODB_P_I width ; packed LODB_I
            LodbPI = 130, "LODB_P_I" => [width: PImm], Plain,
            /// CONST_P_PRI value ; packed CONST_PRI
            ConstPPri = 131, "CONST_P_PRI" => [value: PImm], Plain,
            /// CONST_P_ALT value ; packed CONST_ALT
            ConstPAlt = 132, "CONST_P_ALT" => [value: PImm], Plain,
            /// ADDR_P_PRI offs ; packed ADDR_PRI
            AddrPPri = 133, "ADDR_P_PRI" => [offs: PImm], Plain,
            /// ADDR_P_ALT offs ; packed ADDR_ALT
            AddrPAlt = 134, "ADDR_P_ALT" => [offs: PImm], Plain,
            /// STOR_P addr ; packed STOR
            StorP = 135, "STOR_P" => [addr: PData], Plain,
            /// STOR_P_S offs ; packed STOR_S
            StorPS = 136, "STOR_P_S" => [offs: PFrame], Plain,
            /// SREF_P_S offs ; packed SREF_S
            SrefPS = 137, "SREF_P_S" => [offs: PFrame], Plain,
            /// STRB_P_I width ; packed STRB_I
            StrbPI = 138, "STRB_P_I" => [width: PImm], Plain,
            /// LIDX_P_B shift ; packed LIDX_B
            LidxPB = 139, "LIDX_P_B" => [shift: PImm], Plain,
            /// IDXADDR_P_B shift ; packed IDXADDR_B
            IdxaddrPB = 140, "IDXADDR_P_B" => [shift: PImm], Plain,
            /// ALIGN_P_PRI width ; packed ALIGN_PRI
            AlignPPri = 141, "ALIGN_P_PRI" => [width: PImm], Plain,
            /// PUSH_P_C value ; packed PUSH_C
            PushPC = 142, "PUSH_P_C" => [value: PImm], Plain,
            /// PUSH_P addr ; packed PUSH
            PushP = 143, "PUSH_P" => [addr: PImm], Plain,
            /// PUSH_P_S offs ; packed PUSH_S
            PushPS = 144, "PUSH_P_S" => [offs: PImm], Plain,
            /// PUSH_P_ADR offs ; packed PUSH_ADR
            PushPAdr = 145, "PUSH_P_ADR" => [offs: PImm], Plain,
            /// PUSHR_P_C value ; packed PUSHR_C
            PushrPC = 146, "PUSHR_P_C" => [value: PImm], Plain,
            /// PUSHR_P_S offs ; packed PUSHR_S
            PushrPS = 147, "PUSHR_P_S" => [offs: PImm], Plain,
            /// PUSHR_P_ADR offs ; packed PUSHR_ADR
            PushrPAdr = 148, "PUSHR_P_ADR" => [offs: PImm], Plain,
            /// PUSHM_P_C count ; packed PUSHM_C
            PushmPC = 149, "PUSHM_P_C" => [values: PList], Plain,
            /// PUSHM_P count ; packed PUSHM
            PushmP = 150, "PUSHM_P" => [addrs: PList], Plain,
            /// PUSHM_P_S count ; packed PUSHM_S
            PushmPS = 151, "PUSHM_P_S" => [offsets: PList], Plain,
            /// PUSHM_P_ADR count ; packed PUSHM_ADR
            PushmPAdr = 152, "PUSHM_P_ADR" => [offsets: PList], Plain,
            /// PUSHRM_P_C count ; packed PUSHRM_C
            PushrmPC = 153, "PUSHRM_P_C" => [values: PList], Plain,
            /// PUSHRM_P_S count ; packed PUSHRM_S
            PushrmPS = 154, "PUSHRM_P_S" => [offsets: PList], Plain,
            /// PUSHRM_P_ADR count ; packed PUSHRM_ADR
            PushrmPAdr = 155, "PUSHRM_P_ADR" => [offsets: PList], Plain,
            /// STACK_P bytes ; packed STACK
            StackP = 156, "STACK_P" => [bytes: PImm], Plain,
            /// HEAP_P bytes ; packed HEAP
            HeapP = 157, "HEAP_P" => [bytes: PImm], Plain,
            /// SHL_P_C_PRI shift ; packed SHL_C_PRI
            ShlPCPri = 158, "SHL_P_C_PRI" => [shift: PImm], Plain,
            /// SHL_P_C_ALT shift ; packed SHL_C_ALT
            ShlPCAlt = 159, "SHL_P_C_ALT" => [shift: PImm], Plain,
            /// ADD_P_C value ; packed ADD_C
            AddPC = 160, "ADD_P_C" => [value: PImm], Plain,
            /// SMUL_P_C value ; packed SMUL_C
            SmulPC = 161, "SMUL_P_C" => [value: PImm], Plain,
            /// ZERO_P addr ; packed ZERO
            ZeroP = 162, "ZERO_P" => [addr: PImm], Plain,
            /// ZERO_P_S offs ; packed ZERO_S
            ZeroPS = 163, "ZERO_P_S" => [offs: PImm], Plain,
            /// EQ_P_C_PRI value ; packed EQ_C_PRI
            EqPCPri = 164, "EQ_P_C_PRI" => [value: PImm], Plain,
            /// EQ_P_C_ALT value ; packed EQ_C_ALT
            EqPCAlt = 165, "EQ_P_C_ALT" => [value: PImm], Plain,
            /// INC_P addr ; packed INC
            IncP = 166, "INC_P" => [addr: PData], Plain,
            /// INC_P_S offs ; packed INC_S
            IncPS = 167, "INC_P_S" => [offs: PFrame], Plain,
            /// DEC_P addr ; packed DEC
            DecP = 168, "DEC_P" => [addr: PData], Plain,
            /// DEC_P_S offs ; packed DEC_S
            DecPS = 169, "DEC_P_S" => [offs: PFrame], Plain,
            /// MOVS_P bytes ; packed MOVS
            MovsP = 170, "MOVS_P" => [bytes: PImm], Plain,
            /// CMPS_P bytes ; packed CMPS
            CmpsP = 171, "CMPS_P" => [bytes: PImm], Plain,
            /// FILL_P bytes ; packed FILL
            FillP = 172, "FILL_P" => [bytes: PImm], Plain,
            /// HALT_P code ; packed HALT
            HaltP = 173, "HALT_P" => [code: PImm], Plain,
            /// BOUNDS_P limit ; packed BOUNDS
            BoundsP = 174, "BOUNDS_P" => [limit: PImm], Plain,
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $class:ident
        ),* $(,)?
    ) => {
        // =========================
        // Instruction enum
        // =========================
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        /// Number of defined opcodes.
        pub const NUM_OPCODES: usize = [$( $opcode ),*].len();

        impl TryFrom<u8> for Instruction {
            type Error = AmxError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(AmxError::InvInstr),
                }
            }
        }

        impl Instruction {
            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Returns the verifier category for this instruction.
            pub const fn class(&self) -> OpClass {
                match self {
                    $( Instruction::$name => OpClass::$class, )*
                }
            }

            /// Returns the operand kinds, in encoding order.
            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }

            /// Looks up an instruction by mnemonic (exact, uppercase).
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl Instruction {
    /// Decodes an opcode cell into the instruction and its packed parameter.
    pub fn decode(word: Cell) -> Result<(Instruction, Cell), AmxError> {
        let (opcode, param) = split_opcode(word);
        let opcode = u8::try_from(opcode).map_err(|_| AmxError::InvInstr)?;
        Ok((Instruction::try_from(opcode)?, param))
    }

    /// Whether the instruction carries its operand in the opcode cell.
    pub fn is_packed(&self) -> bool {
        self.operands().iter().any(|kind| kind.is_packed())
    }

    /// Number of operand cells when the instruction has no variable-length operand.
    pub fn fixed_operand_cells(&self) -> Option<usize> {
        let mut count = 0;
        for kind in self.operands() {
            match kind {
                OperandKind::List | OperandKind::CaseTable | OperandKind::OvlCaseTable => {
                    return None;
                }
                OperandKind::PList => return None,
                kind if kind.is_packed() => {}
                _ => count += 1,
            }
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::cell::join_opcode;

    #[test]
    fn instruction_try_from_invalid() {
        assert!(matches!(Instruction::try_from(175), Err(AmxError::InvInstr)));
        assert!(matches!(Instruction::try_from(0xff), Err(AmxError::InvInstr)));
    }

    #[test]
    fn opcode_numbering_is_dense() {
        assert_eq!(NUM_OPCODES, 175);
        for op in 0..NUM_OPCODES as u8 {
            let instr = Instruction::try_from(op).unwrap();
            assert_eq!(instr as u8, op);
        }
    }

    #[test]
    fn anchor_opcodes() {
        assert_eq!(Instruction::Smul as u8, 42);
        assert_eq!(Instruction::Movs as u8, 64);
        assert_eq!(Instruction::Lidx as u8, 81);
        assert_eq!(Instruction::ZeroPri as u8, 102);
        assert_eq!(Instruction::Load2 as u8, 120);
        assert_eq!(Instruction::LoadPPri as u8, 124);
        assert_eq!(Instruction::AlignPPri as u8, 141);
        assert_eq!(Instruction::BoundsP as u8, 174);
    }

    #[test]
    fn decode_packed_word() {
        let word = join_opcode(Instruction::PushPC as Cell, -8);
        assert_eq!(Instruction::decode(word).unwrap(), (Instruction::PushPC, -8));
        assert!(Instruction::decode(200).is_err());
    }

    #[test]
    fn mnemonic_lookup() {
        assert_eq!(Instruction::from_mnemonic("SYSREQ_N"), Some(Instruction::SysreqN));
        assert_eq!(Instruction::SysreqN.mnemonic(), "SYSREQ_N");
        assert_eq!(Instruction::from_mnemonic("sysreq_n"), None);
    }

    #[test]
    fn operand_layout() {
        assert_eq!(Instruction::Const.fixed_operand_cells(), Some(2));
        assert_eq!(Instruction::LoadPPri.fixed_operand_cells(), Some(0));
        assert_eq!(Instruction::PushmC.fixed_operand_cells(), None);
        assert!(Instruction::StorPS.is_packed());
        assert!(!Instruction::StorS.is_packed());
        assert_eq!(Instruction::CallOvl.class(), OpClass::Overlay);
        assert_eq!(Instruction::SysreqD.class(), OpClass::Patched);
    }
}
