//! vitte-cli/src/lib.rs — the `vitte` command-line driver.
//!
//! Subcommands:
//!   - `run <file>`    : compile and execute a source file.
//!   - `repl`          : read-eval-print loop against a persistent VM.
//!   - `disasm <file>` : compile only, print the bytecode disassembly.
//!
//! This crate owns everything `vitte-core` deliberately stays out of:
//! argument parsing, source loading, terminal I/O for `print`/`clock`/
//! `input`, and the process exit code convention (0 success, 65 compile
//! error, 70 runtime error).

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use vitte_core::object::Heap;
use vitte_core::{Config, InterpretError, Value, Vm};

const EXIT_OK: i32 = 0;
const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

#[derive(Parser, Debug)]
#[command(name = "vitte", version, about = "Vitte language tool")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,

    /// Disassemble every chunk right after it's compiled.
    #[arg(long, global = true)]
    debug_print_code: bool,

    /// Trace each instruction and the stack contents before executing it.
    #[arg(long, global = true)]
    debug_trace_execution: bool,

    /// Run a collection before every allocation.
    #[arg(long, global = true)]
    debug_stress_gc: bool,

    /// Log each collection's before/after heap size.
    #[arg(long, global = true)]
    debug_log_gc: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compile and run a source file.
    Run {
        /// Path to a Vitte source file.
        file: PathBuf,
    },
    /// Start an interactive read-eval-print loop.
    Repl,
    /// Compile a source file and print its bytecode disassembly.
    Disasm {
        /// Path to a Vitte source file.
        file: PathBuf,
    },
}

/// Entry point called from `main`. Returns the process exit code; `main`
/// is responsible for actually exiting with it.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.debug_print_code {
        config.debug_print_code = true;
    }
    if cli.debug_trace_execution {
        config.debug_trace_execution = true;
    }
    if cli.debug_stress_gc {
        config.debug_stress_gc = true;
    }
    if cli.debug_log_gc {
        config.debug_log_gc = true;
    }

    match cli.cmd {
        Cmd::Run { file } => cmd_run(file, config),
        Cmd::Repl => cmd_repl(config),
        Cmd::Disasm { file } => cmd_disasm(file, config),
    }
}

fn register_natives(vm: &mut Vm) {
    let start = Instant::now();
    vm.define_native(
        "clock",
        Some(0),
        std::rc::Rc::new(move |_heap, _args| Ok(Value::Number(start.elapsed().as_secs_f64()))),
    );
    vm.define_native("input", Some(0), std::rc::Rc::new(read_input_line));
}

/// `input()` reads one line from stdin, strips the trailing newline, and
/// interns it; on EOF it returns `nil` per the native's contract.
fn read_input_line(heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line).map_err(|e| e.to_string())?;
    if n == 0 {
        return Ok(Value::Nil);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Value::Obj(heap.intern_str(&line)))
}

fn read_source(path: &PathBuf) -> Result<String> {
    let utf8 = Utf8PathBuf::from_path_buf(path.clone()).map_err(|p| anyhow::anyhow!("non-UTF-8 path: {p:?}"))?;
    std::fs::read_to_string(&utf8).with_context(|| format!("reading {utf8}"))
}

fn cmd_run(file: PathBuf, config: Config) -> Result<i32> {
    let source = read_source(&file)?;
    let mut vm = Vm::new(config);
    register_natives(&mut vm);
    match vm.interpret(&source) {
        Ok(()) => Ok(EXIT_OK),
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            Ok(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(err)) => {
            eprintln!("{}", err.render());
            Ok(EXIT_RUNTIME_ERROR)
        }
    }
}

fn cmd_disasm(file: PathBuf, config: Config) -> Result<i32> {
    let source = read_source(&file)?;
    let mut heap = Heap::new();
    match vitte_core::compile(&source, &mut heap, &config) {
        Ok(function_ref) => {
            let title = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "script".into());
            print_function_disasm(&heap, function_ref, &title);
            Ok(EXIT_OK)
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            Ok(EXIT_COMPILE_ERROR)
        }
    }
}

/// Disassembles `function_ref` and recurses into every nested function
/// reachable through its constant pool, matching clox's
/// `DEBUG_PRINT_CODE` behavior of printing a script's whole call graph.
fn print_function_disasm(heap: &Heap, function_ref: vitte_core::GcRef, title: &str) {
    use vitte_core::object::Obj;

    let Obj::Function(f) = heap.get(function_ref) else {
        return;
    };
    println!("{}", vitte_core::disasm::disassemble_chunk(&f.chunk, title, heap));

    for constant in &f.chunk.constants {
        if let Value::Obj(r) = constant {
            if let Obj::Function(nested) = heap.get(*r) {
                let name = nested.name.map(|n| heap.as_str(n).to_string()).unwrap_or_else(|| "<fn>".into());
                print_function_disasm(heap, *r, &name);
            }
        }
    }
}

fn cmd_repl(config: Config) -> Result<i32> {
    let mut vm = Vm::new(config);
    register_natives(&mut vm);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush().ok();

        let mut line = String::new();
        let n = stdin.lock().read_line(&mut line).context("reading from stdin")?;
        if n == 0 {
            println!();
            break;
        }

        match vm.interpret(&line) {
            Ok(()) => {}
            Err(InterpretError::Compile(errors)) => {
                for e in &errors {
                    eprintln!("{e}");
                }
            }
            Err(InterpretError::Runtime(err)) => {
                eprintln!("{}", err.render());
            }
        }
    }
    Ok(EXIT_OK)
}
