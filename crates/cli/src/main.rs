//! Fidel CLI
//!
//! Command-line driver for the Fidel interpreter:
//!
//! ```text
//! fidel                # interactive REPL, one statement per line
//! fidel program.fdl    # run a UTF-8 source file
//! ```
//!
//! Exit codes: 0 on success, 64 for usage errors, 65 for compile errors,
//! 60 for runtime errors, 74 when the source file cannot be read.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser as ClapParser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use fidel_runtime::{InterpretResult, Vm, VmOptions};

const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_RUNTIME: i32 = 60;
const EX_IOERR: i32 = 74;

#[derive(ClapParser)]
#[command(name = "fidel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fidel interpreter - run a script or start a REPL", long_about = None)]
struct Cli {
    /// Source file to run; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Disassemble each function to stderr as it compiles
    #[arg(long)]
    print_code: bool,

    /// Trace the stack and every instruction to stderr
    #[arg(long)]
    trace: bool,

    /// Collect garbage before every allocation (for debugging the GC)
    #[arg(long)]
    stress_gc: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // Help and --version are not usage errors.
            if error.use_stderr() {
                let _ = error.print();
                process::exit(EX_USAGE);
            }
            let _ = error.print();
            process::exit(0);
        }
    };

    let options = VmOptions {
        print_code: cli.print_code,
        trace_execution: cli.trace,
        stress_gc: cli.stress_gc,
    };
    let mut vm = Vm::with_options(options);

    match cli.script {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

/// Interpret a source file and exit with the matching code.
fn run_file(vm: &mut Vm, path: &Path) -> ! {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read file \"{}\": {}.", path.display(), error);
            process::exit(EX_IOERR);
        }
    };

    match vm.interpret(&source) {
        InterpretResult::Ok => process::exit(0),
        InterpretResult::CompileError => process::exit(EX_DATAERR),
        InterpretResult::RuntimeError => process::exit(EX_RUNTIME),
    }
}

/// Line-at-a-time prompt sharing one VM, so globals accumulate across
/// lines. EOF (ctrl-d) exits; ctrl-c clears the current line.
fn repl(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not start the REPL: {error}.");
            process::exit(EX_IOERR);
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                // Errors were already reported; the next line starts fresh.
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("{error}");
                break;
            }
        }
    }
}
