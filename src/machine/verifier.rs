//! Static bytecode verification.
//!
//! One forward pass over a code segment. Every opcode must be known and every
//! operand that names a global, a frame slot or a jump target must be in
//! range. The pass never writes to the code; the report it returns tells the
//! loader which native-call form the code uses and how many instructions and
//! relocations an alternate backend would have to handle.

use super::cell::{CELL, CELL_SIZE, Cell, cell_from_le};
use super::errors::AmxError;
use super::isa::{Instruction, OpClass, OperandKind};

/// Sizes the operand checks are made against, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSizes {
    /// Size of the code being verified.
    pub code: Cell,
    /// Global data size (`hea - dat`).
    pub data: Cell,
    /// Stack plus heap size (`stp - hea`).
    pub stack: Cell,
}

/// Options that change what the verifier accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyOptions {
    /// An overlay loader is installed.
    pub overlay_loader: bool,
    /// The executor compiles the code; overlay opcodes are refused.
    pub compiling: bool,
}

/// Which native-call instructions appear in the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SysreqForm {
    #[default]
    None,
    Sysreq,
    SysreqN,
    Mixed,
}

impl SysreqForm {
    fn with(self, seen: SysreqForm) -> SysreqForm {
        match (self, seen) {
            (SysreqForm::None, seen) => seen,
            (current, SysreqForm::None) => current,
            (current, seen) if current == seen => current,
            _ => SysreqForm::Mixed,
        }
    }

    /// Whether exactly one native-call form is used.
    pub fn is_single(self) -> bool {
        matches!(self, SysreqForm::Sysreq | SysreqForm::SysreqN)
    }
}

/// Result of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyReport {
    pub sysreq: SysreqForm,
    /// Number of instructions.
    pub opcodes: usize,
    /// Number of code-relative operands (jumps and case table entries).
    pub relocations: usize,
}

impl VerifyReport {
    /// Combines the reports of several code segments (overlays).
    pub fn merge(self, other: VerifyReport) -> VerifyReport {
        VerifyReport {
            sysreq: self.sysreq.with(other.sysreq),
            opcodes: self.opcodes + other.opcodes,
            relocations: self.relocations + other.relocations,
        }
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Result<Cell, AmxError> {
        let cell = self
            .code
            .get(self.at..)
            .and_then(cell_from_le)
            .ok_or(AmxError::InvInstr)?;
        self.at += CELL_SIZE;
        Ok(cell)
    }

    fn skip(&mut self, cells: Cell) -> Result<(), AmxError> {
        let cells = usize::try_from(cells).map_err(|_| AmxError::InvInstr)?;
        let end = cells
            .checked_mul(CELL_SIZE)
            .and_then(|bytes| self.at.checked_add(bytes))
            .ok_or(AmxError::InvInstr)?;
        if end > self.code.len() {
            return Err(AmxError::InvInstr);
        }
        self.at = end;
        Ok(())
    }
}

/// Cells following the record count of a case table.
fn table_cells(records: Cell) -> Result<Cell, AmxError> {
    if records < 0 {
        return Err(AmxError::InvInstr);
    }
    records
        .checked_mul(2)
        .and_then(|n| n.checked_add(1))
        .ok_or(AmxError::InvInstr)
}

fn check_data(addr: Cell, sizes: &SegmentSizes) -> Result<(), AmxError> {
    if addr < 0 || addr >= sizes.data {
        return Err(AmxError::Bounds);
    }
    Ok(())
}

fn check_frame(offs: Cell, sizes: &SegmentSizes) -> Result<(), AmxError> {
    if offs < -sizes.stack || offs > sizes.stack {
        return Err(AmxError::Bounds);
    }
    Ok(())
}

fn check_target(target: Option<Cell>, sizes: &SegmentSizes) -> Result<(), AmxError> {
    match target {
        Some(target) if target >= 0 && target < sizes.code => Ok(()),
        _ => Err(AmxError::Bounds),
    }
}

/// Verifies a code segment.
pub fn verify(
    code: &[u8],
    sizes: &SegmentSizes,
    options: VerifyOptions,
) -> Result<VerifyReport, AmxError> {
    let mut report = VerifyReport::default();
    let mut cursor = Cursor { code, at: 0 };

    while cursor.at < code.len() {
        let opcode_at = cursor.at as Cell;
        let (instr, param) = Instruction::decode(cursor.next()?)?;
        report.opcodes += 1;

        match instr.class() {
            OpClass::Plain => {}
            OpClass::Sysreq => report.sysreq = report.sysreq.with(SysreqForm::Sysreq),
            OpClass::SysreqN => report.sysreq = report.sysreq.with(SysreqForm::SysreqN),
            OpClass::Patched => return Err(AmxError::InvInstr),
            OpClass::Overlay => {
                if !options.overlay_loader || options.compiling {
                    return Err(AmxError::Overlay);
                }
            }
        }

        for kind in instr.operands() {
            match kind {
                OperandKind::Imm | OperandKind::Native | OperandKind::Ovl => {
                    cursor.next()?;
                }
                OperandKind::Data => check_data(cursor.next()?, sizes)?,
                OperandKind::Frame => check_frame(cursor.next()?, sizes)?,
                OperandKind::Jump => {
                    let rel = cursor.next()?;
                    check_target(opcode_at.checked_add(rel), sizes)?;
                    report.relocations += 1;
                }
                OperandKind::List => {
                    let count = cursor.next()?;
                    cursor.skip(count)?;
                }
                OperandKind::CaseTable => {
                    let records = cursor.next()?;
                    let base = cursor.at;
                    cursor.skip(table_cells(records)?)?;
                    // The default jump and each record's jump are relative to
                    // their own cell, minus one cell.
                    for i in 0..=records as usize {
                        let at = base + 2 * i * CELL_SIZE;
                        let rel = cell_from_le(&code[at..]).ok_or(AmxError::InvInstr)?;
                        let target = (at as Cell)
                            .checked_add(rel)
                            .and_then(|t| t.checked_sub(CELL));
                        check_target(target, sizes)?;
                        report.relocations += 1;
                    }
                }
                OperandKind::OvlCaseTable => {
                    let records = cursor.next()?;
                    cursor.skip(table_cells(records)?)?;
                }
                OperandKind::PImm => {}
                OperandKind::PData => check_data(param, sizes)?,
                OperandKind::PFrame => check_frame(param, sizes)?,
                OperandKind::PList => cursor.skip(param)?,
            }
        }
    }

    Ok(report)
}
