//! Program image runner CLI.
//!
//! Loads a compiled image, registers the built-in natives and runs `main` or
//! a named public function.
//!
//! # Usage
//! ```text
//! cellrun <image.amx> [OPTIONS]
//! ```

use cellvm::machine::cell::Cell;
use cellvm::machine::errors::AmxError;
use cellvm::machine::natives::{Native, arg, native};
use cellvm::machine::{
    Entry, ExecutorKind, Image, ImageOverlays, Machine, MachineConfig, OverlayLoader, SharedState,
    core_natives,
};
use cellvm::utils::log::{Level, init_from_env, set_min_level};
use cellvm::{error, info, warn};
use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

/// Upper bound on sleep/continue rounds before the runner gives up.
const MAX_RESUMES: usize = 1 << 20;

struct Options {
    image: String,
    public: Option<String>,
    args: Vec<Cell>,
    executor: ExecutorKind,
    direct_patch: bool,
    quiet: bool,
}

fn main() {
    init_from_env();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let options = parse_args(&args);
    if options.quiet {
        set_min_level(Level::Error);
    }

    match run(&options) {
        Ok(value) => {
            if options.quiet {
                println!("{value}");
            } else {
                info!("Returned {}", value);
            }
        }
        Err(e) => {
            error!("Execution failed: {} (code {})", e, e.code());
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Options {
    let mut options = Options {
        image: args[1].clone(),
        public: None,
        args: Vec::new(),
        executor: ExecutorKind::default(),
        direct_patch: false,
        quiet: false,
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--public" | "-p" | "--arg" | "-a" | "--executor" | "-e") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                let value = &args[i];
                match k {
                    "--public" | "-p" => options.public = Some(value.clone()),
                    "--arg" | "-a" => match value.parse::<Cell>() {
                        Ok(n) => options.args.push(n),
                        Err(_) => {
                            error!("Invalid argument value: {}", value);
                            process::exit(1);
                        }
                    },
                    _ => match value.parse::<ExecutorKind>() {
                        Ok(kind) => options.executor = kind,
                        Err(e) => {
                            error!("{}", e);
                            process::exit(1);
                        }
                    },
                }
                i += 1;
            }
            "--direct-patch" => {
                options.direct_patch = true;
                i += 1;
            }
            "--quiet" | "-q" => {
                options.quiet = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }
    options
}

fn run(options: &Options) -> Result<Cell, AmxError> {
    let image = Image::from_file(&options.image)?;
    let config = MachineConfig {
        executor: options.executor.clone(),
        direct_patch: options.direct_patch,
        overlay_loader: image
            .has_overlays()
            .then(|| Arc::new(ImageOverlays) as Arc<dyn OverlayLoader>),
        ..MachineConfig::default()
    };
    let mut machine = Machine::load_with(image, config)?;

    let shared = Arc::new(SharedState::with_entropy());
    if let Err(e) = machine.register_natives(&runner_natives(&shared)) {
        for name in machine.unresolved_natives() {
            warn!("Missing native: {}", name);
        }
        return Err(e);
    }

    let entry = match &options.public {
        Some(name) => Entry::Public(machine.find_public(name)?),
        None => Entry::Main,
    };
    // arguments are pushed last to first
    for &value in options.args.iter().rev() {
        machine.push(value)?;
    }

    let mut result = machine.exec(entry);
    let mut resumes = 0;
    while result == Err(AmxError::Sleep) {
        resumes += 1;
        if resumes > MAX_RESUMES {
            return Err(AmxError::Sleep);
        }
        info!("Script slept with value {}, resuming", machine.registers().pri);
        result = machine.exec(Entry::Continue);
    }
    result
}

/// Core natives, the shared-state natives and the console output natives.
fn runner_natives(shared: &Arc<SharedState>) -> Vec<(&'static str, Native)> {
    let mut list = core_natives();
    list.extend(shared.natives());
    list.push(("print", native(print)));
    list.push(("printnum", native(printnum)));
    list
}

fn print(machine: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    let text = machine.get_string(arg(params, 1)?)?;
    write_out(&text)
}

fn printnum(_: &mut Machine, params: &[Cell]) -> Result<Cell, AmxError> {
    write_out(&arg(params, 1)?.to_string())
}

fn write_out(text: &str) -> Result<Cell, AmxError> {
    let mut out = io::stdout().lock();
    out.write_all(text.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|_| AmxError::General)?;
    Ok(0)
}

const USAGE: &str = "\
Cell VM Runner

USAGE:
    {program} <image.amx> [OPTIONS]

ARGS:
    <image.amx>    Compiled program image to run

OPTIONS:
    -p, --public <name>       Run the named public function instead of main
    -a, --arg <n>             Pass an integer argument (repeatable, in order)
    -e, --executor <kind>     Interpreter body: switch (default) or threaded
        --direct-patch        Rewrite native call sites after their first call
    -q, --quiet               Print only the return value
    -h, --help                Print this help message

NATIVES:
    core      numargs getarg setarg heapspace funcidx swapchars
              tolower toupper min max clamp
    shared    random getproperty setproperty deleteproperty existproperty
    console   print printnum

EXAMPLES:
    # Run main
    {program} program.amx

    # Call a public with two arguments on the threaded interpreter
    {program} program.amx --public add --arg 2 --arg 3 --executor threaded
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
