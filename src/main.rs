// File: src/main.rs
//
// Entry point: dispatches to either `run <file>` or the interactive
// REPL. Exit codes follow the sysexits-flavored convention the compiler
// and VM's two error taxonomies map onto: 65 for a compile error, 70 for
// a runtime error, 74 if the script file can't even be read.

use clap::{Parser as ClapParser, Subcommand};
use loxi::{compiler, repl, vm};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "loxi",
    about = "loxi: a single-pass bytecode compiler and stack VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a script file
    Run {
        /// Path to the source file
        file: PathBuf,
    },
    /// Launch the interactive REPL
    Repl,
}

const EX_OK: u8 = 0;
const EX_DATAERR: u8 = 65; // compile error
const EX_SOFTWARE: u8 = 70; // runtime error
const EX_IOERR: u8 = 74;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run { file }) => run_file(&file),
        Some(Commands::Repl) | None => run_repl(),
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{}': {}", path.display(), err);
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = vm::Vm::new();
    let function = match compiler::compile(&source, vm.heap_mut()) {
        Ok(function) => function,
        Err(errors) => {
            for err in errors {
                eprintln!("{}", err);
            }
            return ExitCode::from(EX_DATAERR);
        }
    };

    match vm.interpret(function) {
        Ok(()) => ExitCode::from(EX_OK),
        Err(err) => {
            eprint!("{}", err);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn run_repl() -> ExitCode {
    match repl::Repl::new() {
        Ok(mut repl) => match repl.run() {
            Ok(()) => ExitCode::from(EX_OK),
            Err(err) => {
                eprintln!("REPL error: {}", err);
                ExitCode::from(EX_SOFTWARE)
            }
        },
        Err(err) => {
            eprintln!("Could not start REPL: {}", err);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}
