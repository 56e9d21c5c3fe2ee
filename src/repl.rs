// File: src/repl.rs
//
// Interactive REPL for loxi. Each line (or braces-balanced multi-line
// block) is compiled and run against a single persistent `Vm`, so
// globals and classes defined in one entry stay visible in the next —
// the VM and its heap are not recreated between evaluations.

use crate::compiler;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "loxi — a bytecode-compiled scripting language".bright_cyan());
        println!("  {} for commands, {} to exit", ":help".bright_yellow(), ":quit".bright_yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt =
                if buffer.is_empty() { "> ".bright_green().to_string() } else { ".. ".bright_blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if balanced(&buffer) {
                        self.eval(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{}: {}", "readline error".red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":quit" | ":q" => false,
            ":help" => {
                println!("  :help   show this message");
                println!("  :quit   exit the REPL");
                true
            }
            other => {
                println!("Unknown command '{}'. Try :help.", other);
                true
            }
        }
    }

    fn eval(&mut self, source: &str) {
        match compiler::compile(source, self.vm.heap_mut()) {
            Ok(function) => {
                if let Err(err) = self.vm.interpret(function) {
                    eprint!("{}", err);
                }
            }
            Err(errors) => {
                for err in errors {
                    eprintln!("{}", err);
                }
            }
        }
    }
}

/// A crude multi-line continuation heuristic: keep reading lines while
/// braces are unbalanced. Good enough for a REPL; the compiler itself
/// performs real parsing once the buffer is submitted.
fn balanced(source: &str) -> bool {
    let mut depth: i32 = 0;
    for c in source.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0
}
