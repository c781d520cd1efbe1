use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

// ---------------------------------------------------------------------------
// REPL
// ---------------------------------------------------------------------------

/// Read one line, interpret it against a persistent VM, loop. Exits on EOF
/// or interrupt. Returns the process exit code.
pub fn run() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not start line editor: {}", error);
            return 120;
        }
    };

    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(".", &line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Input error: {}", error);
                break;
            }
        }
    }
    0
}
