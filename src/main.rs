use std::path::{Path, PathBuf};

use clap::Parser;

use dragon::compiler;
use dragon::debug;
use dragon::repl;
use dragon::vm::heap::Heap;
use dragon::vm::{InterpretResult, Vm};

#[derive(Parser)]
#[command(name = "dragon")]
#[command(about = "The Dragon programming language")]
#[command(version)]
struct Cli {
    /// Script to run; starts a REPL when omitted.
    file: Option<PathBuf>,

    /// Disassemble the compiled script instead of running it.
    #[arg(long)]
    dump: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match cli.file {
        None => repl::run(),
        Some(path) => run_file(&path, cli.dump),
    };
    std::process::exit(code);
}

fn run_file(path: &Path, dump: bool) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            return 120;
        }
    };
    let directory = directory_of(path);

    if dump {
        let mut heap = Heap::new();
        return match compiler::compile(&mut heap, &source) {
            Some(function) => {
                debug::disassemble_function(&heap, function);
                0
            }
            None => 121,
        };
    }

    let mut vm = Vm::new();
    match vm.interpret(&directory, &source) {
        InterpretResult::Ok => 0,
        InterpretResult::CompileErr => 121,
        InterpretResult::RuntimeErr => 122,
    }
}

/// Directory containing `path`, used as the import root. Backslashes are
/// normalized so Windows-style paths resolve the same way.
fn directory_of(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    match normalized.rfind('/') {
        Some(index) if index > 0 => normalized[..index].to_string(),
        Some(_) => "/".to_string(),
        None => ".".to_string(),
    }
}
