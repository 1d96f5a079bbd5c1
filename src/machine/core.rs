//! Core natives: argument access, heap queries and small integer helpers.
//!
//! These only touch the calling context, so every machine can register the
//! same list. Natives that keep state between calls live in
//! [`SharedState`](super::host::SharedState).

use super::cell::{CELL, Cell};
use super::errors::AmxError;
use super::natives::{Native, arg, arg_count, native};
use super::vm::Machine;

/// Argument `index` or `default` when the script left it out.
fn arg_or(params: &[Cell], index: usize, default: Cell) -> Result<Cell, AmxError> {
    if index > arg_count(params) {
        return Ok(default);
    }
    arg(params, index)
}

/// Address of the cell `offset` cells into the argument `index` of the
/// calling function. Variadic arguments are passed by reference.
fn argument_address(machine: &Machine, index: Cell, offset: Cell) -> Result<Cell, AmxError> {
    let frm = machine.registers().frm;
    let slot = index
        .checked_add(3)
        .and_then(|slot| slot.checked_mul(CELL))
        .and_then(|bytes| frm.checked_add(bytes))
        .ok_or(AmxError::MemAccess)?;
    let base = machine.read_cell(slot)?;
    offset
        .checked_mul(CELL)
        .and_then(|bytes| base.checked_add(bytes))
        .ok_or(AmxError::MemAccess)
}

fn numargs(machine: &mut Machine, _params: &[Cell]) -> Result<Cell, AmxError> {
    let slot = machine
        .registers()
        .frm
        .checked_add(2 * CELL)
        .ok_or(AmxError::MemAccess)?;
    Ok(machine.read_cell(slot)? / CELL)
}

fn getarg(machine: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let addr = argument_address(machine, arg(params, 1)?, arg_or(params, 2, 0)?)?;
    machine.read_cell(addr)
}

/// Returns 1 on success and 0 when the target cell is not writable.
fn setarg(machine: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let addr = argument_address(machine, arg(params, 1)?, arg_or(params, 2, 0)?)?;
    let value = arg(params, 3)?;
    Ok(Cell::from(machine.write_cell(addr, value).is_ok()))
}

fn heapspace(machine: &mut Machine, _params: &[Cell]) -> Result<Cell, AmxError> {
    let regs = machine.registers();
    regs.stk.checked_sub(regs.hea).ok_or(AmxError::MemAccess)
}

fn funcidx(machine: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let name = machine.get_string(arg(params, 1)?)?;
    Ok(machine
        .find_public(&name)
        .map_or(-1, |index| index as Cell))
}

fn swapchars(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(arg(params, 1)?.swap_bytes())
}

fn tolower(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let c = arg(params, 1)?;
    Ok(if (Cell::from(b'A')..=Cell::from(b'Z')).contains(&c) {
        c + 32
    } else {
        c
    })
}

fn toupper(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let c = arg(params, 1)?;
    Ok(if (Cell::from(b'a')..=Cell::from(b'z')).contains(&c) {
        c - 32
    } else {
        c
    })
}

fn min(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(arg(params, 1)?.min(arg(params, 2)?))
}

fn max(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(arg(params, 1)?.max(arg(params, 2)?))
}

fn clamp(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let value = arg(params, 1)?;
    let low = arg_or(params, 2, Cell::MIN)?;
    let high = arg_or(params, 3, Cell::MAX)?;
    if low > high {
        return Err(AmxError::Native);
    }
    Ok(value.clamp(low, high))
}

/// The core natives, ready for [`Machine::register_natives`].
pub fn core_natives() -> Vec<(&'static str, Native)> {
    vec![
        ("numargs", native(numargs)),
        ("getarg", native(getarg)),
        ("setarg", native(setarg)),
        ("heapspace", native(heapspace)),
        ("funcidx", native(funcidx)),
        ("swapchars", native(swapchars)),
        ("tolower", native(tolower)),
        ("toupper", native(toupper)),
        ("min", native(min)),
        ("max", native(max)),
        ("clamp", native(clamp)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::assembler::assemble_source;
    use crate::machine::image::Image;
    use crate::machine::vm::Entry;

    fn machine(source: &str) -> Machine {
        let image = Image::from_bytes(assemble_source(source).unwrap()).unwrap();
        let mut machine = Machine::load(image).unwrap();
        machine.register_natives(&core_natives()).unwrap();
        machine
    }

    /// Runs `main` after pushing `args` onto the stack in order.
    fn call(source: &str, args: &[Cell]) -> Result<Cell, AmxError> {
        let mut m = machine(source);
        for &value in args.iter().rev() {
            m.push(value).unwrap();
        }
        m.exec(Entry::Main)
    }

    #[test]
    fn min_max_and_clamp() {
        let min_src = "main:\nPROC\nPUSH_S 16\nPUSH_S 12\nSYSREQ_N \"min\" 8\nRETN\n";
        assert_eq!(call(min_src, &[4, -9]), Ok(-9));
        let max_src = min_src.replace("min", "max");
        assert_eq!(call(&max_src, &[4, -9]), Ok(4));

        let clamp_src = "main:\nPROC\nPUSH_S 20\nPUSH_S 16\nPUSH_S 12\nSYSREQ_N \"clamp\" 12\nRETN\n";
        assert_eq!(call(clamp_src, &[50, 0, 10]), Ok(10));
        assert_eq!(call(clamp_src, &[-5, 0, 10]), Ok(0));
        assert_eq!(call(clamp_src, &[5, 10, 0]), Err(AmxError::Native));
    }

    #[test]
    fn clamp_defaults_to_cell_range() {
        let src = "main:\nPUSH_C 7\nSYSREQ_N \"clamp\" 4\nHALT 0\n";
        assert_eq!(call(src, &[]), Ok(7));
    }

    #[test]
    fn character_helpers() {
        let src = |name: &str, c: char| {
            let source = format!("main:\nPUSH_C '{c}'\nSYSREQ_N \"{name}\" 4\nHALT 0\n");
            call(&source, &[]).unwrap()
        };
        assert_eq!(src("tolower", 'Q'), 'q' as Cell);
        assert_eq!(src("tolower", '1'), '1' as Cell);
        assert_eq!(src("toupper", 'q'), 'Q' as Cell);
        assert_eq!(src("toupper", '{'), '{' as Cell);

        let swap = "main:\nPUSH_C 0x01020304\nSYSREQ_N \"swapchars\" 4\nHALT 0\n";
        assert_eq!(call(swap, &[]), Ok((0x01020304 as Cell).swap_bytes()));
    }

    #[test]
    fn numargs_counts_caller_arguments() {
        let src = "main:\nPROC\nSYSREQ_N \"numargs\" 0\nRETN\n";
        assert_eq!(call(src, &[1, 2, 3]), Ok(3));
        assert_eq!(call(src, &[]), Ok(0));
    }

    #[test]
    fn getarg_and_setarg_follow_references() {
        // main(&a[]): setarg(0, 1, 42); return getarg(0, 1)
        let src = "main:\nPROC\n\
                   PUSH_C 42\nPUSH_C 1\nPUSH_C 0\nSYSREQ_N \"setarg\" 12\n\
                   PUSH_C 1\nPUSH_C 0\nSYSREQ_N \"getarg\" 8\nRETN\n";
        let mut m = machine(src);
        let addr = m.push_array(&[7, 8]).unwrap();
        assert_eq!(m.exec(Entry::Main), Ok(42));
        assert_eq!(m.read_cells(addr, 2).unwrap(), vec![7, 42]);
    }

    #[test]
    fn setarg_reports_unwritable_target() {
        // the argument points into the free gap above the heap
        let src = "main:\nPROC\nPUSH_C 5\nPUSH_C 0\nPUSH_C 0\nSYSREQ_N \"setarg\" 12\nRETN\n";
        let mut m = machine(src);
        let gap = m.registers().hea + 64 * CELL;
        m.push(gap).unwrap();
        assert_eq!(m.exec(Entry::Main), Ok(0));
    }

    #[test]
    fn heapspace_is_gap_size() {
        let src = "main:\nSYSREQ_N \"heapspace\" 0\nHALT 0\n";
        let mut m = machine(src);
        let before = m.registers();
        let free = m.exec(Entry::Main).unwrap();
        // two cells for the entry frame, one for the native's byte count
        assert_eq!(free, before.stk - before.hea - 3 * CELL);
    }

    #[test]
    fn scrambled_registers_fail_cleanly() {
        let heap = format!(
            "main:\nCONST_PRI {}\nSCTRL 2\nSYSREQ_N \"heapspace\" 0\nHALT 0\n",
            Cell::MIN
        );
        assert_eq!(call(&heap, &[]), Err(AmxError::MemAccess));

        let frame = format!(
            "main:\nCONST_PRI {}\nSCTRL 5\nSYSREQ_N \"numargs\" 0\nHALT 0\n",
            Cell::MAX
        );
        assert_eq!(call(&frame, &[]), Err(AmxError::MemAccess));

        let arg = frame.replace("\"numargs\" 0", "\"getarg\" 4").replace("SCTRL", "PUSH_C 0\nSCTRL");
        assert_eq!(call(&arg, &[]), Err(AmxError::MemAccess));
    }

    #[test]
    fn funcidx_finds_publics() {
        let src = "[ data ]\nname: STRING \"beta\"\nmissing: STRING \"gamma\"\n[ code ]\n\
                   pub alpha:\nHALT 0\npub beta:\nHALT 0\n\
                   main:\nPUSH_C name\nSYSREQ_N \"funcidx\" 4\nHALT 0\n\
                   pub other:\nPUSH_C missing\nSYSREQ_N \"funcidx\" 4\nHALT 0\n";
        let mut m = machine(src);
        assert_eq!(m.exec(Entry::Main), Ok(1));
        let other = m.find_public("other").unwrap();
        assert_eq!(m.exec(Entry::Public(other)), Ok(-1));
    }
}
