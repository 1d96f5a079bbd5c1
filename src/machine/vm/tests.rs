use super::*;
use crate::machine::assembler::assemble_source;
use crate::machine::config::ExecutorKind;
use crate::machine::natives::{arg, native};
use crate::machine::overlay::ImageOverlays;
use proptest::prelude::*;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Frame offset of argument `i` inside a function after `PROC`.
fn a(i: Cell) -> Cell {
    (3 + i) * CELL
}

fn image(source: &str) -> Image {
    let bytes = assemble_source(source).expect("assembly failed");
    Image::from_bytes(bytes).expect("image rejected")
}

fn load(source: &str) -> Machine {
    Machine::load(image(source)).expect("load failed")
}

fn load_with(source: &str, config: MachineConfig) -> Machine {
    Machine::load_with(image(source), config).expect("load failed")
}

fn run_main(source: &str) -> Result<Cell, AmxError> {
    load(source).exec(Entry::Main)
}

/// Calls public `name` with `args`, first argument first.
fn run_public(m: &mut Machine, name: &str, args: &[Cell]) -> Result<Cell, AmxError> {
    let index = m.find_public(name)?;
    for &value in args.iter().rev() {
        m.push(value)?;
    }
    m.exec(Entry::Public(index))
}

fn run_public_src(source: &str, name: &str, args: &[Cell]) -> Result<Cell, AmxError> {
    run_public(&mut load(source), name, args)
}

/// Runs `main` and checks that the stack and heap are back at their
/// starting points afterwards, whatever the outcome.
fn run_expect_err(source: &str) -> AmxError {
    let mut m = load(source);
    let before = m.registers();
    let err = m.exec(Entry::Main).expect_err("expected error");
    let after = m.registers();
    assert_eq!((after.stk, after.hea), (before.stk, before.hea));
    assert_eq!(m.state(), ExecState::Halted);
    err
}

fn sleeper() -> (&'static str, Native) {
    (
        "wait",
        native(|m, params| {
            m.raise_error(AmxError::Sleep);
            Ok(params.get(1).copied().unwrap_or(7))
        }),
    )
}

// ==================== Entry points ====================

#[test]
fn identity_public_returns_argument() {
    let source = format!("pub identity:\nPROC\nLOAD_S_PRI {}\nRETN\n", a(0));
    let mut m = load(&source);
    assert_eq!(run_public(&mut m, "identity", &[5]), Ok(5));
    assert_eq!(m.pending_error(), None);
    assert_eq!(m.state(), ExecState::Halted);
}

#[test]
fn main_result_is_pri() {
    assert_eq!(run_main("main:\nCONST_PRI 42\nHALT 0\n"), Ok(42));
}

#[test]
fn missing_main_and_bad_public_index() {
    let mut m = load("pub f:\nHALT 0\n");
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Index));
    assert_eq!(m.exec(Entry::Public(3)), Err(AmxError::Index));
    assert_eq!(m.exec(Entry::Public(0)), Ok(0));
}

#[test]
fn arguments_consumed_by_call() {
    let source = format!(
        "pub sub:\nPROC\nLOAD_S_PRI {}\nLOAD_S_ALT {}\nSUB_INV\nRETN\n",
        a(0),
        a(1)
    );
    let mut m = load(&source);
    let before = m.registers();
    assert_eq!(run_public(&mut m, "sub", &[10, 3]), Ok(7));
    assert_eq!(m.registers().stk, before.stk);
    assert_eq!(run_public(&mut m, "sub", &[3, 10]), Ok(-7));
}

// ==================== Loading ====================

#[test]
fn bad_jump_target_rejected_at_load() {
    let err = Machine::load(image("main:\nJUMP 0x1000\nHALT 0\n")).unwrap_err();
    assert_eq!(err, AmxError::Bounds);
}

#[test]
fn bad_magic_and_version_rejected() {
    let mut bytes = assemble_source("main:\nHALT 0\n").unwrap();
    bytes[4] ^= 0xff;
    assert_eq!(Image::from_bytes(bytes.clone()).unwrap_err(), AmxError::Format);
    bytes[4] ^= 0xff;
    bytes[6] = crate::machine::cell::CUR_FILE_VERSION + 1;
    assert_eq!(Image::from_bytes(bytes).unwrap_err(), AmxError::Version);
}

#[test]
fn loaded_context_is_initialized() {
    let m = load("main:\nHALT 0\n");
    assert!(m.flags().contains(Flags::INIT));
    assert!(!m.flags().contains(Flags::VERIFY));
    assert_eq!(m.state(), ExecState::Ready);
    assert_eq!(m.verify_report().opcodes, 2);
    assert_eq!(m.mem_info().code, 4 * CELL_SIZE);
}

#[test]
fn sysreq_n_sets_flag() {
    let mut m = load("main:\nSYSREQ_N \"heapspace\" 0\nHALT 0\n");
    assert!(m.flags().contains(Flags::SYSREQN));
    m.register_natives(&crate::machine::core_natives()).unwrap();
    assert!(m.exec(Entry::Main).unwrap() > 0);
}

// ==================== Natives ====================

#[test]
fn unresolved_native_fails_before_running() {
    let source = "[ data ]\nran: CELLS 0\n[ code ]\nmain:\nCONST_PRI 1\nSTOR ran\nSYSREQ_N \"missing\" 0\nHALT 0\n";
    let mut m = load(source);
    assert_eq!(m.unresolved_natives(), vec!["missing"]);
    assert_eq!(m.exec(Entry::Main), Err(AmxError::NotFound));
    assert_eq!(m.read_cell(0), Ok(0));
    assert_eq!(m.state(), ExecState::Ready);
}

#[test]
fn partial_registration_reports_not_found() {
    let source = "main:\nSYSREQ_N \"one\" 0\nSYSREQ_N \"two\" 0\nHALT 0\n";
    let mut m = load(source);
    let one = ("one", native(|_, _| Ok(1)));
    assert_eq!(m.register_natives(&[one]), Err(AmxError::NotFound));
    assert!(!m.flags().contains(Flags::NTVREG));
    let two = ("two", native(|_, _| Ok(2)));
    assert_eq!(m.register_natives(&[two]), Ok(()));
    assert!(m.flags().contains(Flags::NTVREG));
    assert_eq!(m.exec(Entry::Main), Ok(2));
}

#[test]
fn native_receives_arguments_and_sets_pri() {
    let source = "main:\nPUSH_C 4\nPUSH_C 30\nSYSREQ_N \"sub\" 8\nHALT 0\n";
    let mut m = load(source);
    let sub = native(|_, params| Ok(arg(params, 1)? - arg(params, 2)?));
    m.register_natives(&[("sub", sub)]).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(26));
}

#[test]
fn classic_sysreq_leaves_cleanup_to_script() {
    let source = "main:\nPUSH_C 9\nPUSH_C 4\nSYSREQ \"id\"\nSTACK 8\nHALT 0\n";
    let mut m = load(source);
    m.register_natives(&[("id", native(|_, params| arg(params, 1)))]).unwrap();
    let before = m.registers();
    assert_eq!(m.exec(Entry::Main), Ok(9));
    assert_eq!(m.registers().stk, before.stk);
}

#[test]
fn native_error_aborts_call() {
    let source = "main:\nSYSREQ_N \"fail\" 0\nHALT 0\n";
    let mut m = load(source);
    let fail = native(|m, _| {
        m.raise_error(AmxError::Domain);
        Ok(0)
    });
    m.register_natives(&[("fail", fail)]).unwrap();
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Domain));
    assert_eq!(m.pending_error(), Some(AmxError::Domain));
}

#[test]
fn host_callback_intercepts_calls() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let callback = move |_: &mut Machine, index: Cell, params: &[Cell]| -> Result<Cell, AmxError> {
        log.lock().unwrap().push((index, params.to_vec()));
        Ok(index * 10)
    };
    let config = MachineConfig {
        callback: Some(Arc::new(callback)),
        ..MachineConfig::default()
    };
    let source = "main:\nSYSREQ_N \"a\" 0\nPUSH_C 3\nSYSREQ_N \"b\" 4\nHALT 0\n";
    let mut m = load_with(source, config);
    m.register_natives(&[("a", native(|_, _| Ok(0))), ("b", native(|_, _| Ok(0)))])
        .unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(10));
    assert_eq!(*seen.lock().unwrap(), vec![(0, vec![0]), (1, vec![CELL, 3])]);
}

#[test]
fn missing_callback_is_reported() {
    let mut m = load("main:\nHALT 0\n");
    m.clear_callback();
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Callback));
}

#[test]
fn native_can_call_back_into_script() {
    let source = format!(
        "pub helper:\nPROC\nLOAD_S_PRI {}\nADD_C 100\nRETN\n\
         main:\nCONST_ALT 1000\nSYSREQ_N \"reenter\" 0\nADD_C 1\nADD\nHALT 0\n",
        a(0)
    );
    let mut m = load(&source);
    let reenter = native(|m, _| {
        let helper = m.find_public("helper")?;
        m.push(5)?;
        m.exec(Entry::Public(helper))
    });
    m.register_natives(&[("reenter", reenter)]).unwrap();
    let before = m.registers();
    assert_eq!(m.exec(Entry::Main), Ok(1106));
    assert_eq!(m.registers().stk, before.stk);
}

// ==================== Direct patching ====================

const PATCHABLE: &str = "main:\nPUSH_C 2\nSYSREQ_N \"double\" 4\nHALT 0\n";

fn double() -> (&'static str, Native) {
    ("double", native(|_, params| Ok(arg(params, 1)? * 2)))
}

#[test]
fn direct_patch_rewrites_private_code() {
    let config = MachineConfig {
        direct_patch: true,
        ..MachineConfig::default()
    };
    let mut m = load_with(PATCHABLE, config);
    m.register_natives(&[double()]).unwrap();
    assert!(!m.code_is_patched());
    assert_eq!(m.exec(Entry::Main), Ok(4));
    assert!(m.code_is_patched());
    assert_eq!(m.exec(Entry::Main), Ok(4));

    // other contexts on the same image keep the original code
    let other = Machine::load(m.image().clone()).unwrap();
    assert!(!other.code_is_patched());
}

#[test]
fn direct_patch_is_opt_in() {
    let mut m = load(PATCHABLE);
    m.register_natives(&[double()]).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(4));
    assert!(!m.code_is_patched());
}

#[test]
fn direct_patch_skipped_with_host_callback() {
    let callback = |m: &mut Machine, index: Cell, params: &[Cell]| m.call_native(index, params);
    let config = MachineConfig {
        direct_patch: true,
        callback: Some(Arc::new(callback)),
        ..MachineConfig::default()
    };
    let mut m = load_with(PATCHABLE, config);
    m.register_natives(&[double()]).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(4));
    assert!(!m.code_is_patched());
}

#[test]
fn direct_patch_refused_for_mixed_call_forms() {
    let source = "main:\nPUSH_C 1\nPUSH_C 4\nSYSREQ \"double\"\nSTACK 8\nPUSH_C 2\nSYSREQ_N \"double\" 4\nHALT 0\n";
    let config = MachineConfig {
        direct_patch: true,
        ..MachineConfig::default()
    };
    let mut m = load_with(source, config);
    m.register_natives(&[double()]).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(4));
    assert!(!m.code_is_patched());
}

// ==================== Arithmetic and control flow ====================

#[test]
fn signed_division_floors() {
    let div = |dividend: Cell, divisor: Cell| {
        let source = format!(
            "main:\nCONST_ALT {dividend}\nCONST_PRI {divisor}\nSDIV\nHALT 0\n"
        );
        run_main(&source)
    };
    assert_eq!(div(7, 2), Ok(3));
    assert_eq!(div(-7, 2), Ok(-4));
    assert_eq!(div(7, -2), Ok(-4));
    assert_eq!(div(-7, -2), Ok(3));
    let remainder = run_main("main:\nCONST_ALT -7\nCONST_PRI 2\nSDIV\nXCHG\nHALT 0\n");
    assert_eq!(remainder, Ok(1));
}

#[test]
fn divide_by_zero_restores_stack() {
    let source = "main:\nPUSH_C 1\nPUSH_C 2\nCONST_ALT 5\nZERO_PRI\nSDIV\nHALT 0\n";
    assert_eq!(run_expect_err(source), AmxError::Divide);
}

#[test]
fn loop_sums_globals() {
    let source = "[ data ]\nsum: CELLS 0\ni: CELLS 10\n[ code ]\nmain:\n\
                  loop:\nLOAD_PRI i\nJZER done\nLOAD_ALT sum\nADD\nSTOR sum\nDEC i\nJUMP loop\n\
                  done:\nLOAD_PRI sum\nHALT 0\n";
    assert_eq!(run_main(source), Ok(55));
}

#[test]
fn call_passes_arguments_on_stack() {
    let source = format!(
        "pub twice_plus_one:\nPROC\nPUSH_S {a0}\nPUSH_C {one}\nCALL double\nADD_C 1\nRETN\n\
         double:\nPROC\nLOAD_S_PRI {a0}\nSMUL_C 2\nRETN\n",
        a0 = a(0),
        one = CELL
    );
    assert_eq!(run_public_src(&source, "twice_plus_one", &[20]), Ok(41));
}

#[test]
fn switch_selects_case() {
    let source = format!(
        "pub pick:\nPROC\nLOAD_S_PRI {}\nSWITCH table\n\
         one:\nCONST_PRI 100\nRETN\n\
         two:\nCONST_PRI 200\nRETN\n\
         other:\nCONST_PRI -1\nRETN\n\
         table:\nCASETBL other, 1, one, 2, two\n",
        a(0)
    );
    let mut m = load(&source);
    assert_eq!(run_public(&mut m, "pick", &[1]), Ok(100));
    assert_eq!(run_public(&mut m, "pick", &[2]), Ok(200));
    assert_eq!(run_public(&mut m, "pick", &[9]), Ok(-1));
}

#[test]
fn halt_codes_map_to_errors() {
    assert_eq!(run_expect_err("main:\nHALT 2\n"), AmxError::Assert);
    assert_eq!(run_expect_err("main:\nHALT 1\n"), AmxError::Exit);
    assert_eq!(run_expect_err("main:\nHALT 99\n"), AmxError::Other(99));
}

#[test]
fn bounds_instruction() {
    assert_eq!(run_main("main:\nCONST_PRI 10\nBOUNDS 10\nHALT 0\n"), Ok(10));
    assert_eq!(run_expect_err("main:\nCONST_PRI 11\nBOUNDS 10\nHALT 0\n"), AmxError::Bounds);
    assert_eq!(run_expect_err("main:\nCONST_PRI -1\nBOUNDS 10\nHALT 0\n"), AmxError::Bounds);
}

#[test]
fn packed_forms_match_plain_forms() {
    let plain = "main:\nCONST_PRI 3\nSMUL_C 5\nADD_C -1\nPUSH_PRI\nPOP_ALT\nCONST_PRI 2\nSUB\nHALT 0\n";
    let packed = "main:\nCONST_P_PRI 3\nSMUL_P_C 5\nADD_P_C -1\nPUSH_PRI\nPOP_ALT\nCONST_P_PRI 2\nSUB\nHALT_P 0\n";
    assert_eq!(run_main(plain), Ok(12));
    assert_eq!(run_main(packed), Ok(12));
}

#[test]
fn pushm_pushes_in_order() {
    let source = "main:\nPUSHM_C 1 2 3\nPOP_PRI\nPOP_ALT\nSUB\nPOP_ALT\nADD\nHALT 0\n";
    // pops 3, 2 (2-3 = -1), then 1 + -1
    assert_eq!(run_main(source), Ok(0));
}

// ==================== Memory safety ====================

#[test]
fn indirect_load_outside_memory() {
    assert_eq!(run_expect_err("main:\nCONST_PRI -4\nLOAD_I\nHALT 0\n"), AmxError::MemAccess);
    assert_eq!(
        run_expect_err("main:\nCONST_PRI 0x7ffffff0\nLOAD_I\nHALT 0\n"),
        AmxError::MemAccess
    );
}

#[test]
fn indirect_store_into_gap() {
    // LCTRL 2 loads the heap top, which is the first free byte
    let source = "main:\nLCTRL 2\nXCHG\nCONST_PRI 1\nSTOR_I\nHALT 0\n";
    assert_eq!(run_expect_err(source), AmxError::MemAccess);
}

#[test]
fn invalid_byte_width() {
    assert_eq!(run_expect_err("main:\nZERO_PRI\nLODB_I 3\nHALT 0\n"), AmxError::InvInstr);
}

#[test]
fn byte_access_reads_single_bytes() {
    let source = "[ data ]\nword: CELLS 0x01020304\n[ code ]\nmain:\nCONST_PRI word\nLODB_I 1\nHALT 0\n";
    assert_eq!(run_main(source), Ok(0x04));
}

#[test]
fn stack_and_heap_limits() {
    assert_eq!(run_expect_err("main:\nSTACK 0x100000\nHALT 0\n"), AmxError::StackLow);
    assert_eq!(run_expect_err("main:\nHEAP -4\nHALT 0\n"), AmxError::HeapLow);
    assert_eq!(run_expect_err("main:\nHEAP 0x100000\nHALT 0\n"), AmxError::StackErr);
}

#[test]
fn failed_entry_releases_pushed_arguments() {
    let mut m = load("main:\nHALT 0\n");
    let start = m.registers();
    // leave one cell above the margin: enough for an argument, not a frame
    let free = ((start.stk - start.hea) / CELL) as usize;
    m.allot(free - (STKMARGIN / CELL) as usize - 1).unwrap();
    let before_push = m.registers().stk;
    m.push(7).unwrap();
    assert_eq!(m.exec(Entry::Main), Err(AmxError::StackErr));
    assert_eq!(m.registers().stk, before_push);
    assert_eq!(m.state(), ExecState::Halted);

    m.release(start.hea);
    m.push(7).unwrap();
    assert_eq!(m.exec(Entry::Public(9)), Err(AmxError::Index));
    assert_eq!((m.registers().stk, m.registers().hea), (start.stk, start.hea));
    assert_eq!(m.exec(Entry::Main), Ok(0));
    assert_eq!(m.registers().stk, start.stk);
}

#[test]
fn allot_rejects_scrambled_heap() {
    let grab = (
        "grab",
        native(|m: &mut Machine, _: &[Cell]| -> Result<Cell, AmxError> { m.allot(1) }),
    );
    let source = format!("main:\nCONST_PRI {}\nSCTRL 2\nSYSREQ_N \"grab\" 0\nHALT 0\n", Cell::MIN);
    let mut m = load(&source);
    m.register_natives(&[grab]).unwrap();
    let before = m.registers();
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Memory));
    assert_eq!(m.registers().hea, before.hea);
}

#[test]
fn heap_grows_and_is_reset() {
    let source = format!("main:\nHEAP {}\nLCTRL 2\nHALT 0\n", 4 * CELL);
    let mut m = load(&source);
    let before = m.registers();
    assert_eq!(m.exec(Entry::Main), Ok(before.hea + 4 * CELL));
    assert_eq!(m.registers().hea, before.hea);
}

#[test]
fn block_copy_fill_and_compare() {
    let source = format!(
        "[ data ]\nsrc: CELLS 1 2 3\ndst: ZERO 3\n[ code ]\nmain:\n\
         CONST_PRI src\nCONST_ALT dst\nMOVS {bytes}\n\
         CONST_PRI src\nCONST_ALT dst\nCMPS {bytes}\nJNZ bad\n\
         CONST_PRI 9\nCONST_ALT dst\nFILL {cell}\n\
         CONST_PRI src\nCONST_ALT dst\nCMPS {bytes}\nHALT 0\n\
         bad:\nHALT 27\n",
        bytes = 3 * CELL,
        cell = CELL
    );
    let mut m = load(&source);
    // first differing byte is 9 (dst) against 1 (src)
    assert_eq!(m.exec(Entry::Main), Ok(8));
    assert_eq!(m.read_cells(3 * CELL, 3).unwrap(), vec![9, 2, 3]);
}

#[test]
fn host_memory_access_is_checked() {
    let mut m = load("main:\nHALT 0\n");
    let regs = m.registers();
    assert_eq!(m.read_cell(-CELL), Err(AmxError::MemAccess));
    assert_eq!(m.read_cell(regs.hea), Err(AmxError::MemAccess));
    assert_eq!(m.write_cell(regs.stp, 1), Err(AmxError::MemAccess));
    assert_eq!(m.read_cells(regs.hea - CELL, 2), Err(AmxError::MemAccess));
    assert_eq!(m.push_address(regs.stp), Err(AmxError::MemAccess));
    assert_eq!(m.allot(1 << 20), Err(AmxError::Memory));
}

#[test]
fn strings_pushed_by_host() {
    let source = format!("pub len:\nPROC\nPUSH_S {}\nSYSREQ_N \"strlen\" {}\nRETN\n", a(0), CELL);
    let mut m = load(&source);
    let strlen = native(|m, params| Ok(m.str_len(arg(params, 1)?)? as Cell));
    m.register_natives(&[("strlen", strlen)]).unwrap();

    let hea = m.registers().hea;
    let index = m.find_public("len").unwrap();
    let addr = m.push_string("hello", true).unwrap();
    assert_eq!(m.exec(Entry::Public(index)), Ok(5));
    assert_eq!(m.get_string(addr).unwrap(), "hello");
    m.release(addr);
    assert_eq!(m.registers().hea, hea);

    m.push_string("héllo", false).unwrap();
    assert_eq!(m.exec(Entry::Public(index)), Ok(5));
}

#[test]
fn arrays_pushed_by_host_are_writable() {
    let source = format!("pub fill:\nPROC\nLOAD_S_ALT {}\nCONST_PRI 7\nFILL {}\nRETN\n", a(0), 2 * CELL);
    let mut m = load(&source);
    let index = m.find_public("fill").unwrap();
    let addr = m.push_array(&[1, 2]).unwrap();
    m.exec(Entry::Public(index)).unwrap();
    assert_eq!(m.read_cells(addr, 2).unwrap(), vec![7, 7]);
}

// ==================== Suspension ====================

#[test]
fn sleep_suspends_and_continue_resumes() {
    let source = "main:\nSYSREQ_N \"wait\" 0\nADD_C 1\nHALT 0\n";
    let mut m = load(source);
    m.register_natives(&[sleeper()]).unwrap();
    let before = m.registers();

    assert_eq!(m.exec(Entry::Main), Err(AmxError::Sleep));
    assert_eq!(m.state(), ExecState::Suspended);
    assert_eq!(m.registers().pri, 7);
    assert_eq!(m.exec(Entry::Continue), Ok(8));
    assert_eq!(m.state(), ExecState::Halted);
    assert_eq!(m.registers().stk, before.stk);
    assert_eq!(m.exec(Entry::Continue), Err(AmxError::InvState));
}

#[test]
fn suspension_is_transparent() {
    let source = format!(
        "[ data ]\ntotal: CELLS 0\n[ code ]\npub run:\nPROC\n\
         PUSH_C 5\nSYSREQ_N \"wait\" {c}\nADD_C 1\nSTOR total\n\
         PUSH_S {a0}\nSYSREQ_N \"wait\" {c}\nLOAD_ALT total\nADD\nRETN\n",
        c = CELL,
        a0 = a(0)
    );
    let mut plain = load(&source);
    plain
        .register_natives(&[("wait", native(|_, params| arg(params, 1)))])
        .unwrap();
    let expected = run_public(&mut plain, "run", &[30]).unwrap();

    let mut m = load(&source);
    m.register_natives(&[sleeper()]).unwrap();
    let mut result = run_public(&mut m, "run", &[30]);
    let mut sleeps = 0;
    while result == Err(AmxError::Sleep) {
        sleeps += 1;
        result = m.exec(Entry::Continue);
    }
    assert_eq!(sleeps, 2);
    assert_eq!(result, Ok(expected));
    assert_eq!(expected, 36);
}

#[test]
fn new_call_abandons_suspended_one() {
    let source = "main:\nSYSREQ_N \"wait\" 0\nHALT 0\npub other:\nCONST_PRI 3\nHALT 0\n";
    let mut m = load(source);
    m.register_natives(&[sleeper()]).unwrap();
    let before = m.registers();
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Sleep));
    let other = m.find_public("other").unwrap();
    assert_eq!(m.exec(Entry::Public(other)), Ok(3));
    assert_eq!(m.registers().stk, before.stk);
    assert_eq!(m.exec(Entry::Continue), Err(AmxError::InvState));
}

#[test]
fn debug_hook_runs_on_break() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let hook = move |_: &mut Machine| -> Result<(), AmxError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let config = MachineConfig {
        debug_hook: Some(Arc::new(hook)),
        ..MachineConfig::default()
    };
    let mut m = load_with("main:\nBREAK\nBREAK\nCONST_PRI 1\nHALT 0\n", config);
    assert_eq!(m.exec(Entry::Main), Ok(1));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let sleep = |_: &mut Machine| -> Result<(), AmxError> { Err(AmxError::Sleep) };
    m.set_debug_hook(Some(Arc::new(sleep)));
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Sleep));
    m.set_debug_hook(None);
    assert_eq!(m.exec(Entry::Continue), Ok(1));
}

// ==================== Executors ====================

const SUM_TO_TEN: &str = "[ data ]\nsum: CELLS 0\ni: CELLS 10\n[ code ]\nmain:\n\
                          loop:\nLOAD_PRI i\nJZER done\nLOAD_ALT sum\nADD\nSTOR sum\nDEC i\nJUMP loop\n\
                          done:\nLOAD_PRI sum\nHALT 0\n";

#[test]
fn zero_clears_globals_and_locals() {
    let source = format!(
        "[ data ]\npad: CELLS 0\nslot: CELLS 9\n[ code ]\n\
         main:\nPROC\nPUSH_C 5\nZERO slot\nZERO_S -{c}\n\
         LOAD_S_PRI -{c}\nLOAD_ALT slot\nADD\nADD_C 1\nSTACK {c}\nRETN\n",
        c = CELL
    );
    for kind in [ExecutorKind::Switch, ExecutorKind::Threaded] {
        let config = MachineConfig {
            executor: kind.clone(),
            ..MachineConfig::default()
        };
        let mut m = load_with(&source, config);
        assert_eq!(m.exec(Entry::Main), Ok(1), "{kind:?}");
        assert_eq!(m.read_cell(CELL), Ok(0), "{kind:?}");
    }
}

#[test]
fn executors_agree() {
    for kind in [ExecutorKind::Switch, ExecutorKind::Threaded] {
        let config = MachineConfig {
            executor: kind.clone(),
            ..MachineConfig::default()
        };
        let mut m = load_with(SUM_TO_TEN, config);
        assert_eq!(m.exec(Entry::Main), Ok(55), "{kind:?}");
    }
}

#[test]
fn threaded_executor_reports_errors() {
    let config = MachineConfig {
        executor: ExecutorKind::Threaded,
        ..MachineConfig::default()
    };
    let mut m = load_with("main:\nCONST_PRI 1\nZERO_ALT\nSDIV_INV\nHALT 0\n", config);
    assert_eq!(m.executor_name(), "threaded");
    assert_eq!(m.exec(Entry::Main), Err(AmxError::Divide));
}

#[derive(Debug)]
struct CompilingExecutor;

impl Executor for CompilingExecutor {
    fn name(&self) -> &'static str {
        "compiling"
    }

    fn run(&self, machine: &mut Machine) -> Result<Cell, AmxError> {
        SwitchExecutor.run(machine)
    }

    fn compiles(&self) -> bool {
        true
    }
}

#[test]
fn compiling_executor_refuses_patching() {
    let config = MachineConfig {
        executor: ExecutorKind::Custom(Arc::new(CompilingExecutor)),
        direct_patch: true,
        ..MachineConfig::default()
    };
    let mut m = load_with(PATCHABLE, config);
    assert!(m.flags().contains(Flags::JITC));
    m.register_natives(&[double()]).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(4));
    assert!(!m.code_is_patched());
}

// ==================== Overlays ====================

fn overlay_source() -> String {
    format!(
        "[ overlay main ]\nmain:\nPUSH_C 6\nPUSH_C {c}\nCALL_OVL triple\nADD_C 1\nHALT 0\n\
         [ overlay triple ]\npub triple:\nPROC\nLOAD_S_PRI {a0}\nSMUL_C 3\nRETN_OVL\n",
        c = CELL,
        a0 = a(0)
    )
}

fn overlay_config() -> MachineConfig {
    MachineConfig {
        overlay_loader: Some(Arc::new(ImageOverlays)),
        ..MachineConfig::default()
    }
}

#[test]
fn overlays_call_and_return() {
    let mut m = load_with(&overlay_source(), overlay_config());
    assert_eq!(m.exec(Entry::Main), Ok(19));
    assert_eq!(run_public(&mut m, "triple", &[5]), Ok(15));
}

#[test]
fn overlay_image_needs_loader() {
    let err = Machine::load(image(&overlay_source())).unwrap_err();
    assert_eq!(err, AmxError::Overlay);
}

#[test]
fn overlay_loads_go_through_loader() {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&loads);
    let loader = move |image: &Image, index: Cell| {
        seen.lock().unwrap().push(index);
        image.overlay_code(index)
    };
    let config = MachineConfig {
        overlay_loader: Some(Arc::new(loader)),
        ..MachineConfig::default()
    };
    let mut m = load_with(&overlay_source(), config);
    loads.lock().unwrap().clear();
    assert_eq!(m.exec(Entry::Main), Ok(19));
    // main, triple, back to main
    assert_eq!(*loads.lock().unwrap(), vec![1, 2, 1]);
    assert_eq!(m.overlay_index(), 1);
}

#[test]
fn switch_overlay_enters_selected_overlay() {
    let source = "[ overlay main ]\nmain:\nCONST_PRI 2\nSWITCH_OVL table\ntable:\nCASETBL_OVL low, 2, high\n\
                  [ overlay low ]\nCONST_PRI 10\nHALT 0\n\
                  [ overlay high ]\nCONST_PRI 20\nHALT 0\n";
    let mut m = load_with(source, overlay_config());
    assert_eq!(m.exec(Entry::Main), Ok(20));
}

// ==================== Contexts ====================

const COUNTER: &str = "[ data ]\ncounter: CELLS 10\n[ code ]\nmain:\nINC counter\nLOAD_PRI counter\nHALT 0\n";

#[test]
fn clone_copies_globals_and_stays_isolated() {
    let mut m = load(COUNTER);
    assert_eq!(m.exec(Entry::Main), Ok(11));
    let mut copy = m.clone_context().unwrap();
    assert_eq!(copy.state(), ExecState::Ready);
    assert_eq!(copy.exec(Entry::Main), Ok(12));
    assert_eq!(copy.exec(Entry::Main), Ok(13));
    assert_eq!(m.exec(Entry::Main), Ok(12));
}

#[test]
fn clone_shares_natives_but_not_user_data() {
    let mut m = load(PATCHABLE);
    m.register_natives(&[double()]).unwrap();
    m.set_user_data(user_tag(b'T', b'E', b'S', b'T'), 5u32).unwrap();
    let mut copy = m.clone_context().unwrap();
    assert_eq!(copy.exec(Entry::Main), Ok(4));
    assert_eq!(
        copy.user_data::<u32>(user_tag(b'T', b'E', b'S', b'T')).unwrap_err(),
        AmxError::UserData
    );
}

#[test]
fn user_data_slots() {
    let mut m = load("main:\nHALT 0\n");
    let tag = user_tag(b'H', b'O', b'S', b'T');
    assert_eq!(m.user_data::<String>(tag).unwrap_err(), AmxError::UserData);
    m.set_user_data(tag, String::from("state")).unwrap();
    assert_eq!(*m.user_data::<String>(tag).unwrap(), "state");
    assert_eq!(m.user_data::<u64>(tag).unwrap_err(), AmxError::UserData);

    for i in 1..4u8 {
        m.set_user_data(user_tag(i, 0, 0, 0), i).unwrap();
    }
    assert_eq!(m.set_user_data(user_tag(9, 0, 0, 0), 0u8), Err(AmxError::Index));
    // replacing an existing tag needs no free slot
    m.set_user_data(tag, String::from("again")).unwrap();
    assert_eq!(*m.user_data::<String>(tag).unwrap(), "again");
}

#[test]
fn public_variables_are_addressable() {
    let source = "[ data ]\npad: CELLS 0\npub score: CELLS 0\n[ code ]\nmain:\nLOAD_PRI score\nADD_C 1\nHALT 0\n";
    let mut m = load(source);
    let addr = m.find_pubvar("score").unwrap();
    assert_eq!(addr, CELL);
    m.write_cell(addr, 41).unwrap();
    assert_eq!(m.exec(Entry::Main), Ok(42));
    assert_eq!(m.find_pubvar("nope"), Err(AmxError::NotFound));
}

proptest! {
    #[test]
    fn sdiv_matches_floored_division(dividend in any::<Cell>(), divisor in any::<Cell>()) {
        prop_assume!(divisor != 0);
        let source = format!("main:\nCONST_ALT {dividend}\nCONST_PRI {divisor}\nSDIV\nHALT 0\n");
        let quotient = run_main(&source).unwrap();
        let remainder = run_main(&source.replace("HALT 0", "XCHG\nHALT 0")).unwrap();
        prop_assert_eq!(quotient.wrapping_mul(divisor).wrapping_add(remainder), dividend);
        prop_assert!(remainder == 0 || (remainder < 0) == (divisor < 0));
        prop_assert!(remainder.unsigned_abs() < divisor.unsigned_abs());
    }

    #[test]
    fn clones_never_see_each_others_writes(writes in proptest::collection::vec((0usize..4, any::<Cell>()), 1..16)) {
        let source = "[ data ]\nslots: CELLS 1 2 3 4\n[ code ]\nmain:\nHALT 0\n";
        let original = load(source);
        let mut copy = original.clone_context().unwrap();
        for (slot, value) in writes {
            copy.write_cell(slot as Cell * CELL, value).unwrap();
        }
        prop_assert_eq!(original.read_cells(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn clones_run_independently(calls in proptest::collection::vec((any::<bool>(), -1000i16..1000), 1..12)) {
        // bump(x): last = x; total += x; return total
        let source = format!(
            "[ data ]\nlast: CELLS 1\ntotal: CELLS 2\n[ code ]\n\
             pub bump:\nPROC\nLOAD_S_PRI {}\nSTOR last\nLOAD_ALT total\nADD\nSTOR total\nRETN\n",
            a(0)
        );
        let original = load(&source);
        let copy = original.clone_context().unwrap();
        let mut contexts = [original, copy];
        let mut expected: [[Cell; 2]; 2] = [[1, 2], [1, 2]];
        for (second, x) in calls {
            let which = usize::from(second);
            let x = Cell::from(x);
            let model = &mut expected[which];
            model[0] = x;
            model[1] += x;
            let m = &mut contexts[which];
            prop_assert_eq!(run_public(m, "bump", &[x]), Ok(model[1]));
            prop_assert_eq!(m.registers().pri, model[1]);
            for (m, model) in contexts.iter().zip(&expected) {
                prop_assert_eq!(m.read_cells(0, 2).unwrap(), model.to_vec());
            }
        }
    }
}
