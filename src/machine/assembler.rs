//! Assembly language parser and image writer.
//!
//! Converts human-readable assembly into a complete program image. Mnemonics
//! and operand layouts come from [`for_each_instruction!`](crate::for_each_instruction)
//! through [`Instruction`], so the assembler never disagrees with the
//! verifier about instruction sizes.
//!
//! # Syntax
//!
//! ```text
//! [ stack 1024 ]              # stack + heap size in cells
//! [ data ]
//! pub counter: CELLS 0        # public variable
//! greeting:    STRING "hi"    # unpacked, zero terminated
//! [ code ]
//! pub add:                    # public function
//!     PROC
//!     LOAD_S_PRI 12
//!     LOAD_S_ALT 16
//!     ADD
//!     RETN
//! main:                       # entry point
//!     SYSREQ "print"          # natives are named by string operands
//!     HALT 0
//! ```
//!
//! - `#` starts a comment; commas between operands are optional
//! - Numbers are decimal or `0x` hex, optionally negative; `'c'` is a character
//! - Jump operands take a label and are encoded relative to the instruction
//! - Data operands take a number or a data label
//! - `PUSHM_*` take their values directly; the count is implied
//! - `CASETBL default, value label, ...` writes a case table for `SWITCH`
//! - `[ overlay NAME ]` starts an overlay; labels are local to it and
//!   `CALL_OVL NAME` enters it. An overlay holding a public function or
//!   `main:` must start with it.
//!
//! Code always starts with an implicit `HALT 0`: public functions return to
//! address 0 when called by the host.

use super::builder::{DEFAULT_STACK_CELLS, ImageBuilder};
use super::cell::{CELL, CELL_SIZE, Cell, NAME_MAX, PACKED_SHIFT, UCell, join_opcode};
use super::errors::AsmError;
use super::isa::{Instruction, OperandKind};
use super::strings;
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';
const PUBLIC_PREFIX: &str = "pub";
const ENTRY_LABEL: &str = "main";

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &AsmError) -> Option<(usize, usize, String)> {
    match err {
        AsmError::Located {
            line,
            offset,
            message,
        } => Some((*line, *offset, message.clone())),
        AsmError::Parse {
            line,
            offset,
            message,
        } => Some((*line, *offset, message.to_string())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for an assembly failure.
pub fn render_diagnostic(file: &str, source: &str, err: &AsmError) -> String {
    let Some((line, offset, message)) = assembly_error_location(err) else {
        return format!("error: {err}\n");
    };
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

/// Which part of the image a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Data,
    /// Code unit by index; 0 is the main code segment.
    Code(usize),
}

/// A `[ ... ]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Code,
    Data,
    Overlay(String),
    Stack(usize),
}

#[derive(Debug, Clone)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` starts a comment
/// - commas are ignored
/// - whitespace-separated tokens
/// - `"..."` and `'...'` are single tokens; `\` escapes the next character
fn tokenize(line_no: usize, line: &str) -> Result<Vec<Token<'_>>, AsmError> {
    let mut out = Vec::with_capacity(8);

    let mut start: Option<usize> = None;
    let mut start_col: usize = 0;
    let mut quote: Option<u8> = None;

    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match b {
            _ if b == COMMENT_CHAR as u8 => break,
            b'"' | b'\'' => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                quote = Some(b);
                i += 1;
            }
            b',' | b' ' | b'\t' => {
                if let Some(s) = start.take() {
                    out.push(Token {
                        text: &line[s..i],
                        offset: start_col,
                    });
                }
                i += 1;
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                    start_col = i + 1;
                }
                i += 1;
            }
        }
    }

    if quote.is_some() {
        return Err(AsmError::Parse {
            line: line_no,
            offset: start_col,
            message: "unterminated string literal (missing closing quote)",
        });
    }

    if let Some(s) = start {
        let text = line[s..bytes.len().min(i)].trim_end();
        if !text.is_empty() {
            out.push(Token {
                text,
                offset: start_col,
            });
        }
    }

    Ok(out)
}

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

/// Parses a `[ ... ]` section marker; `None` for ordinary lines.
fn parse_section_marker(line: &str) -> Result<Option<Marker>, AsmError> {
    let trimmed = line.split(COMMENT_CHAR).next().unwrap_or("").trim();
    let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        return Ok(None);
    };
    let words: Vec<&str> = inner.split_whitespace().collect();
    let marker = match words.as_slice() {
        [word] if word.eq_ignore_ascii_case("code") => Marker::Code,
        [word] if word.eq_ignore_ascii_case("data") => Marker::Data,
        [word, name] if word.eq_ignore_ascii_case("overlay") => Marker::Overlay(name.to_string()),
        [word, cells] if word.eq_ignore_ascii_case("stack") => Marker::Stack(
            cells
                .parse()
                .map_err(|_| AsmError::InvalidOperand(cells.to_string()))?,
        ),
        _ => return Err(AsmError::UnknownDirective(inner.trim().to_string())),
    };
    Ok(Some(marker))
}

/// Parses a decimal or `0x` hexadecimal number, optionally negative. Hex
/// values may use the full unsigned cell range.
pub(crate) fn parse_number(tok: &str) -> Option<Cell> {
    let (negative, digits) = match tok.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, tok),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse::<u64>().ok()?
        }
        None => return None,
    };
    let value = UCell::try_from(magnitude).ok()? as Cell;
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Resolves backslash escapes in a quoted literal's body.
fn unescape(body: &str) -> Result<String, AsmError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some(c @ ('\\' | '"' | '\'')) => c,
            _ => return Err(AsmError::InvalidOperand(format!("\"{body}\""))),
        });
    }
    Ok(out)
}

/// Body of a `"..."` literal.
fn string_literal(tok: &str) -> Result<String, AsmError> {
    let body = tok
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| AsmError::InvalidOperand(tok.to_string()))?;
    unescape(body)
}

/// Value of a `'c'` literal.
fn char_literal(tok: &str) -> Option<Result<Cell, AsmError>> {
    let body = tok.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(unescape(body).and_then(|text| {
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c as u32 as Cell),
            _ => Err(AsmError::InvalidOperand(tok.to_string())),
        }
    }))
}

fn check_name(name: &str) -> Result<(), AsmError> {
    if name.len() > NAME_MAX {
        return Err(AsmError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Number of code cells an instruction occupies, given its operand tokens.
fn encoded_cells(instr: Instruction, operands: usize) -> Result<usize, AsmError> {
    let arity = |expected: usize| AsmError::ArityMismatch {
        instruction: instr.mnemonic().to_string(),
        expected,
        actual: operands,
    };
    match instr.operands() {
        [OperandKind::List] => Ok(2 + operands),
        [OperandKind::PList] => Ok(1 + operands),
        [OperandKind::CaseTable] | [OperandKind::OvlCaseTable] => {
            if operands % 2 == 0 {
                return Err(arity(operands + 1));
            }
            Ok(2 + operands)
        }
        kinds => {
            if operands != kinds.len() {
                return Err(arity(kinds.len()));
            }
            Ok(1 + kinds.iter().filter(|kind| !kind.is_packed()).count())
        }
    }
}

/// One instruction waiting for label resolution.
#[derive(Debug)]
struct PendingInstr<'a> {
    line: usize,
    instr: Instruction,
    tokens: Vec<Token<'a>>,
    /// Byte address of the opcode within its unit.
    at: Cell,
}

/// A contiguous piece of code: the main segment or one overlay.
#[derive(Debug, Default)]
struct Unit<'a> {
    name: String,
    cells: usize,
    labels: HashMap<String, Cell>,
    instrs: Vec<PendingInstr<'a>>,
    /// First line with user code, for error reporting.
    first_line: Option<usize>,
}

/// Assembly state for both passes.
#[derive(Debug, Default)]
struct AsmContext<'a> {
    units: Vec<Unit<'a>>,
    data: Vec<Cell>,
    data_labels: HashMap<String, Cell>,
    natives: Vec<String>,
    /// `(name, unit, address)` of every public function.
    publics: Vec<(String, usize, Cell)>,
    pubvars: Vec<(String, Cell)>,
    main: Option<(usize, Cell)>,
    stack_cells: usize,
}

impl<'a> AsmContext<'a> {
    fn new() -> Self {
        let entry = Unit {
            name: String::from("<code>"),
            cells: 2,
            ..Unit::default()
        };
        Self {
            units: vec![entry],
            stack_cells: DEFAULT_STACK_CELLS,
            ..Self::default()
        }
    }

    fn has_overlays(&self) -> bool {
        self.units.len() > 1
    }

    fn overlay_index(&self, name: &str) -> Option<usize> {
        self.units.iter().skip(1).position(|unit| unit.name == name).map(|i| i + 1)
    }

    /// Adds a native to the table, returning its index.
    fn intern_native(&mut self, name: String) -> Result<Cell, AsmError> {
        check_name(&name)?;
        if let Some(index) = self.natives.iter().position(|n| *n == name) {
            return Ok(index as Cell);
        }
        self.natives.push(name);
        Ok((self.natives.len() - 1) as Cell)
    }

    fn define_label(&mut self, section: Section, name: &str, public: bool) -> Result<(), AsmError> {
        match section {
            Section::Data => {
                let addr = (self.data.len() * CELL_SIZE) as Cell;
                if self.data_labels.insert(name.to_string(), addr).is_some() {
                    return Err(AsmError::DuplicateLabel(name.to_string()));
                }
                if public {
                    check_name(name)?;
                    self.pubvars.push((name.to_string(), addr));
                }
            }
            Section::Code(unit) => {
                let addr = (self.units[unit].cells * CELL_SIZE) as Cell;
                if self.units[unit].labels.insert(name.to_string(), addr).is_some() {
                    return Err(AsmError::DuplicateLabel(name.to_string()));
                }
                if public {
                    check_name(name)?;
                    if self.publics.iter().any(|(n, _, _)| n == name) {
                        return Err(AsmError::DuplicateName(name.to_string()));
                    }
                    self.publics.push((name.to_string(), unit, addr));
                }
                if name == ENTRY_LABEL {
                    self.main = Some((unit, addr));
                }
            }
        }
        Ok(())
    }

    /// Value of a number, character or label operand.
    fn value(&self, unit: usize, tok: &str) -> Result<Cell, AsmError> {
        if let Some(value) = parse_number(tok) {
            return Ok(value);
        }
        if let Some(value) = char_literal(tok) {
            return value;
        }
        if let Some(&addr) = self.data_labels.get(tok) {
            return Ok(addr);
        }
        if let Some(&addr) = self.units[unit].labels.get(tok) {
            return Ok(addr);
        }
        if tok.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return Err(AsmError::UndefinedLabel(tok.to_string()));
        }
        Err(AsmError::InvalidOperand(tok.to_string()))
    }

    /// Address of a code label in `unit`, or a raw number.
    fn code_target(&self, unit: usize, tok: &str) -> Result<Option<Cell>, AsmError> {
        if parse_number(tok).is_some() {
            return Ok(None);
        }
        self.units[unit]
            .labels
            .get(tok)
            .copied()
            .map(Some)
            .ok_or_else(|| AsmError::UndefinedLabel(tok.to_string()))
    }

    /// Jump operand stored in the cell at `cell_at`: labels become
    /// `target - cell_at + bias`, numbers are taken as already relative.
    fn relative(&self, unit: usize, tok: &str, cell_at: Cell, bias: Cell) -> Result<Cell, AsmError> {
        match self.code_target(unit, tok)? {
            Some(target) => Ok(target - cell_at + bias),
            None => self.value(unit, tok),
        }
    }

    fn overlay_operand(&self, tok: &str) -> Result<Cell, AsmError> {
        if let Some(value) = parse_number(tok) {
            return Ok(value);
        }
        self.overlay_index(tok)
            .map(|index| index as Cell)
            .ok_or_else(|| AsmError::UndefinedLabel(tok.to_string()))
    }

    fn packed(value: Cell, tok: &str) -> Result<Cell, AsmError> {
        let limit: Cell = 1 << (PACKED_SHIFT - 1);
        if value < -limit || value >= limit {
            return Err(AsmError::InvalidOperand(tok.to_string()));
        }
        Ok(value)
    }

    /// Encodes one instruction. Natives are interned in encoding order.
    fn encode(&mut self, unit: usize, instr: Instruction, ops: &[Token], at: Cell) -> Result<Vec<Cell>, AsmError> {
        let opcode = instr as Cell;
        let mut out = Vec::with_capacity(1 + ops.len());
        match instr.operands() {
            [OperandKind::List] => {
                out.push(opcode);
                out.push(ops.len() as Cell);
                for tok in ops {
                    out.push(self.value(unit, tok.text)?);
                }
            }
            [OperandKind::PList] => {
                out.push(join_opcode(opcode, Self::packed(ops.len() as Cell, "")?));
                for tok in ops {
                    out.push(self.value(unit, tok.text)?);
                }
            }
            [OperandKind::CaseTable] => {
                let records = ops.len() / 2;
                out.extend([opcode, records as Cell]);
                out.push(self.relative(unit, ops[0].text, at + 2 * CELL, CELL)?);
                for (i, pair) in ops[1..].chunks(2).enumerate() {
                    out.push(self.value(unit, pair[0].text)?);
                    let cell_at = at + (4 + 2 * i as Cell) * CELL;
                    out.push(self.relative(unit, pair[1].text, cell_at, CELL)?);
                }
            }
            [OperandKind::OvlCaseTable] => {
                let records = ops.len() / 2;
                out.extend([opcode, records as Cell]);
                out.push(self.overlay_operand(ops[0].text)?);
                for pair in ops[1..].chunks(2) {
                    out.push(self.value(unit, pair[0].text)?);
                    out.push(self.overlay_operand(pair[1].text)?);
                }
            }
            kinds => {
                let mut param = 0;
                let mut operands = Vec::with_capacity(kinds.len());
                for (kind, tok) in kinds.iter().zip(ops) {
                    let value = match kind {
                        OperandKind::Jump => self.relative(unit, tok.text, at, 0)?,
                        OperandKind::Native => match parse_number(tok.text) {
                            Some(index) => index,
                            None => self.intern_native(string_literal(tok.text)?)?,
                        },
                        OperandKind::Ovl => self.overlay_operand(tok.text)?,
                        _ => self.value(unit, tok.text)?,
                    };
                    if kind.is_packed() {
                        param = Self::packed(value, tok.text)?;
                    } else {
                        operands.push(value);
                    }
                }
                out.push(join_opcode(opcode, param));
                out.extend(operands);
            }
        }
        Ok(out)
    }

    /// Handles a line of the data section.
    fn data_directive(&mut self, tokens: &[Token]) -> Result<(), AsmError> {
        let directive = tokens[0].text.to_ascii_uppercase();
        let args = &tokens[1..];
        match directive.as_str() {
            "CELLS" => {
                for tok in args {
                    let value = match parse_number(tok.text) {
                        Some(value) => value,
                        None => match char_literal(tok.text) {
                            Some(value) => value?,
                            None => self
                                .data_labels
                                .get(tok.text)
                                .copied()
                                .ok_or_else(|| AsmError::UndefinedLabel(tok.text.to_string()))?,
                        },
                    };
                    self.data.push(value);
                }
            }
            "STRING" | "PACKED" => {
                let [tok] = args else {
                    return Err(AsmError::ArityMismatch {
                        instruction: directive,
                        expected: 1,
                        actual: args.len(),
                    });
                };
                let text = string_literal(tok.text)?;
                let packed = directive == "PACKED";
                let size = if packed {
                    text.len() / CELL_SIZE + 1
                } else {
                    text.chars().count() + 1
                };
                let mut cells = vec![0; size];
                strings::set_string(&mut cells, &text, packed, size)
                    .map_err(|e| AsmError::InvalidOperand(e.to_string()))?;
                self.data.extend(cells);
            }
            "ZERO" => {
                let [tok] = args else {
                    return Err(AsmError::ArityMismatch {
                        instruction: directive,
                        expected: 1,
                        actual: args.len(),
                    });
                };
                let count = parse_number(tok.text)
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| AsmError::InvalidOperand(tok.text.to_string()))?;
                self.data.resize(self.data.len() + count, 0);
            }
            _ => return Err(AsmError::UnknownDirective(tokens[0].text.to_string())),
        }
        Ok(())
    }
}

fn located(line: usize, offset: usize) -> impl Fn(AsmError) -> AsmError {
    move |e| AsmError::Located {
        line,
        offset,
        message: e.to_string(),
    }
}

/// Pass 1: tokenizes, records labels and instruction sizes, and writes the
/// data section.
fn collect<'a>(ctx: &mut AsmContext<'a>, source: &'a str) -> Result<(), AsmError> {
    let mut section = Section::Code(0);

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        let at_line = located(line_no, 1);
        match parse_section_marker(line).map_err(&at_line)? {
            Some(Marker::Code) => {
                section = Section::Code(0);
                continue;
            }
            Some(Marker::Data) => {
                section = Section::Data;
                continue;
            }
            Some(Marker::Overlay(name)) => {
                check_name(&name).map_err(&at_line)?;
                if ctx.overlay_index(&name).is_some() {
                    return Err(at_line(AsmError::DuplicateName(name)));
                }
                ctx.units.push(Unit {
                    name,
                    ..Unit::default()
                });
                section = Section::Code(ctx.units.len() - 1);
                continue;
            }
            Some(Marker::Stack(cells)) => {
                ctx.stack_cells = cells;
                continue;
            }
            None => {}
        }

        let tokens = tokenize(line_no, line)?;
        if tokens.is_empty() {
            continue;
        }

        let public = tokens[0].text == PUBLIC_PREFIX && tokens.len() > 1;
        let label_idx = usize::from(public);
        let mut rest = &tokens[..];
        if is_label_def(tokens[label_idx].text) {
            let name = label_name(tokens[label_idx].text);
            ctx.define_label(section, name, public)
                .map_err(located(line_no, tokens[0].offset))?;
            rest = &tokens[label_idx + 1..];
        } else if public {
            return Err(located(line_no, tokens[1].offset)(AsmError::InvalidOperand(
                tokens[1].text.to_string(),
            )));
        }
        if rest.is_empty() {
            continue;
        }

        let at_token = located(line_no, rest[0].offset);
        match section {
            Section::Data => ctx.data_directive(rest).map_err(at_token)?,
            Section::Code(unit) => {
                let mnemonic = rest[0].text.to_ascii_uppercase();
                let instr = Instruction::from_mnemonic(&mnemonic)
                    .ok_or_else(|| at_token(AsmError::UnknownInstruction(rest[0].text.to_string())))?;
                let cells = encoded_cells(instr, rest.len() - 1).map_err(&at_token)?;
                let unit = &mut ctx.units[unit];
                unit.instrs.push(PendingInstr {
                    line: line_no,
                    instr,
                    tokens: rest.to_vec(),
                    at: (unit.cells * CELL_SIZE) as Cell,
                });
                unit.cells += cells;
                unit.first_line.get_or_insert(line_no);
            }
        }
    }
    Ok(())
}

/// Pass 2: encodes every unit and writes the image.
fn emit(mut ctx: AsmContext) -> Result<Vec<u8>, AsmError> {
    let overlays = ctx.has_overlays();
    if overlays {
        if let Some(line) = ctx.units[0].first_line {
            return Err(located(line, 1)(AsmError::OutsideSection));
        }
    }

    let mut units_code: Vec<Vec<Cell>> = Vec::with_capacity(ctx.units.len());
    for unit in 0..ctx.units.len() {
        let mut code = Vec::with_capacity(ctx.units[unit].cells);
        if unit == 0 {
            code.extend([Instruction::Halt as Cell, 0]);
        }
        let instrs = std::mem::take(&mut ctx.units[unit].instrs);
        for pending in &instrs {
            let offset = pending.tokens[0].offset;
            let cells = ctx
                .encode(unit, pending.instr, &pending.tokens[1..], pending.at)
                .map_err(located(pending.line, offset))?;
            code.extend(cells);
        }
        units_code.push(code);
    }

    // overlay images name functions by overlay index
    let entry_address = |unit: usize, addr: Cell, name: &str| -> Result<u32, AsmError> {
        if !overlays {
            return Ok(addr as u32);
        }
        if addr != 0 {
            return Err(AsmError::InvalidOperand(format!(
                "'{name}' must be the first label of its overlay"
            )));
        }
        Ok(unit as u32)
    };

    let mut builder = ImageBuilder::new()
        .stack_cells(ctx.stack_cells)
        .data_cells(&ctx.data);
    for (unit, code) in units_code.iter().enumerate() {
        let offset = builder.code_len();
        builder = builder.code_cells(code);
        if overlays {
            builder = builder.overlay(offset, code.len() * CELL_SIZE);
        }
        if unit == 0 && !overlays {
            break;
        }
    }
    for (name, unit, addr) in &ctx.publics {
        builder = builder.public(name.clone(), entry_address(*unit, *addr, name)?);
    }
    for name in &ctx.natives {
        builder = builder.native(name.clone());
    }
    for (name, addr) in &ctx.pubvars {
        builder = builder.pubvar(name.clone(), *addr as u32);
    }
    if let Some((unit, addr)) = ctx.main {
        builder = builder.main(entry_address(unit, addr, ENTRY_LABEL)? as Cell);
    }
    Ok(builder.build())
}

/// Assembles a full source string into image bytes.
///
/// Uses two-pass assembly:
/// 1. Tokenize lines, record label positions and sizes, write the data section
/// 2. Encode instructions with label resolution, then lay out the image
pub fn assemble_source(source: &str) -> Result<Vec<u8>, AsmError> {
    let mut ctx = AsmContext::new();
    collect(&mut ctx, source)?;
    emit(ctx)
}

/// Convenience: assemble directly from a file path. Diagnostics for failures
/// are printed to stderr.
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, AsmError> {
    let path_ref = path.as_ref();
    let name = path_ref.display().to_string();
    let source = fs::read_to_string(path_ref).map_err(|e| AsmError::Io {
        path: name.clone(),
        message: e.to_string(),
    })?;
    assemble_source(&source).inspect_err(|err| eprint!("{}", render_diagnostic(&name, &source, err)))
}
