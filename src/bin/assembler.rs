//! Assembly to program image compiler CLI.
//!
//! Reads an assembly source file and writes a loadable program image.
//!
//! # Usage
//! ```text
//! cellasm <input.asm> [OPTIONS]
//! ```
//!
//! # Examples
//! ```text
//! cellasm program.asm
//! cellasm program.asm -o build/program.amx
//! ```

use cellvm::machine::assembler::assemble_file;
use cellvm::machine::errors::AsmError;
use cellvm::machine::image::Image;
use cellvm::utils::log::{Level, init_from_env, set_min_level};
use cellvm::{error, info};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

struct Options {
    input: PathBuf,
    output: PathBuf,
}

fn main() {
    init_from_env();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let options = parse_args(&args);
    if !options.input.exists() {
        error!("Input file does not exist: {}", options.input.display());
        process::exit(1);
    }
    if let Some(dir) = options.output.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        error!("Output directory does not exist: {}", dir.display());
        process::exit(1);
    }

    let bytes = match assemble_file(&options.input) {
        Ok(bytes) => bytes,
        Err(AsmError::Io { path, message }) => {
            error!("Failed to read {}: {}", path, message);
            process::exit(1);
        }
        // the diagnostic has already been printed
        Err(_) => process::exit(1),
    };
    if let Err(e) = fs::write(&options.output, &bytes) {
        error!("Failed to write {}: {}", options.output.display(), e);
        process::exit(1);
    }
    info!(
        "Wrote {} ({} bytes)",
        options.output.display(),
        bytes.len()
    );
    summarize(bytes);
}

fn parse_args(args: &[String]) -> Options {
    let input = PathBuf::from(&args[1]);
    let mut output = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                let Some(path) = args.get(i + 1) else {
                    error!("{k} requires an argument");
                    process::exit(1);
                };
                output = Some(PathBuf::from(path));
                i += 2;
            }
            "--quiet" | "-q" => {
                set_min_level(Level::Error);
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let output = output.unwrap_or_else(|| default_output(&input));
    Options { input, output }
}

/// `dir/name.asm` becomes `dir/name.amx`.
fn default_output(input: &Path) -> PathBuf {
    input.with_extension("amx")
}

/// Logs the segment sizes and table counts of the written image.
fn summarize(bytes: Vec<u8>) {
    match Image::from_bytes(bytes) {
        Ok(image) => {
            info!(
                "  code {} bytes, data {} bytes, stack/heap {} bytes",
                image.code_size(),
                image.data_size(),
                image.stack_heap_size()
            );
            info!(
                "  {} publics, {} natives, {} public variables, {} overlays",
                image.num_publics(),
                image.num_natives(),
                image.num_pubvars(),
                image.num_overlays()
            );
        }
        Err(e) => {
            error!("Written image does not load back: {}", e);
            process::exit(1);
        }
    }
}

const USAGE: &str = "\
Cell VM Assembler

USAGE:
    {program} <input.asm> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>     Output file path (defaults to <input>.amx)
    -q, --quiet             Only report errors
    -h, --help              Print this help message

SOURCE FORMAT:
    [ data ]                Globals: CELLS, STRING, PACKED, ZERO
    [ code ]                Instructions; `name:` labels, `pub name:` publics
    [ overlay NAME ]        One overlay per section (overlay images)
    [ stack N ]             Stack/heap size in cells
    main:                   Entry point
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
