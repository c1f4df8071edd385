//! Interactive REPL.
//!
//! Reads a line (continuing while delimiters are unbalanced), compiles it
//! with the front-end, evaluates, and echoes the result. Errors print a
//! diagnostic and leave the context usable; the root stack is restored
//! around every iteration.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::compiler;
use crate::context::Context;

const HISTORY_FILE: &str = ".cinder-history";

pub struct Repl;

impl Repl {
    pub fn new() -> Self {
        Repl
    }

    /// Checks whether input still has open delimiters or an open string,
    /// in which case the REPL keeps reading lines.
    fn is_incomplete(&self, input: &str) -> bool {
        let mut paren_depth = 0i32;
        let mut brace_depth = 0i32;
        let mut bracket_depth = 0i32;
        let mut in_string = false;
        let mut escape_next = false;
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if escape_next {
                escape_next = false;
                continue;
            }
            match c {
                '\\' if in_string => escape_next = true,
                '"' => in_string = !in_string,
                '/' if !in_string && chars.peek() == Some(&'/') => {
                    // line comment: skip to end of line
                    for rest in chars.by_ref() {
                        if rest == '\n' {
                            break;
                        }
                    }
                }
                '(' if !in_string => paren_depth += 1,
                ')' if !in_string => paren_depth -= 1,
                '{' if !in_string => brace_depth += 1,
                '}' if !in_string => brace_depth -= 1,
                '[' if !in_string => bracket_depth += 1,
                ']' if !in_string => bracket_depth -= 1,
                _ => {}
            }
        }
        paren_depth > 0 || brace_depth > 0 || bracket_depth > 0 || in_string
    }

    fn colorize(&self, output: &str) -> String {
        if output == "nil" {
            return output.dimmed().to_string();
        }
        if output == "true" {
            return output.green().to_string();
        }
        if output == "false" {
            return output.red().to_string();
        }
        if output.starts_with('[') {
            return output.magenta().to_string();
        }
        if output.parse::<f64>().is_ok() {
            return output.blue().to_string();
        }
        output.to_string()
    }

    pub fn run(&self, ctx: &mut Context) {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(err) => {
                eprintln!("could not start line editor: {}", err);
                return;
            }
        };
        let _ = editor.load_history(HISTORY_FILE);

        println!("cinder v{}", env!("CARGO_PKG_VERSION"));

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() { "> " } else { ".. " };
            match editor.readline(prompt) {
                Ok(line) => {
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(&line);

                    if self.is_incomplete(&buffer) {
                        continue;
                    }
                    if buffer.trim().is_empty() {
                        buffer.clear();
                        continue;
                    }

                    let _ = editor.add_history_entry(buffer.as_str());
                    let _ = editor.save_history(HISTORY_FILE);

                    let save = ctx.save_gc();
                    match compiler::do_string(ctx, &buffer) {
                        Ok(value) => {
                            let text = ctx.to_display_string(value);
                            println!("{}", self.colorize(&text));
                        }
                        Err(diagnostic) => {
                            eprintln!("{}", diagnostic.format().red());
                        }
                    }
                    ctx.restore_gc(save);
                    buffer.clear();
                }
                Err(ReadlineError::Interrupted) => {
                    if !buffer.is_empty() {
                        println!("{}", "input cancelled".dimmed());
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{}: {:?}", "error".red(), err);
                    break;
                }
            }
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_input_detection() {
        let repl = Repl::new();
        assert!(repl.is_incomplete("fn f() {"));
        assert!(repl.is_incomplete("let x = \"abc"));
        assert!(repl.is_incomplete("[1, 2"));
        assert!(repl.is_incomplete("f(1,"));
        assert!(!repl.is_incomplete("let x = 1;"));
        assert!(!repl.is_incomplete("fn f() { 1; }"));
        assert!(!repl.is_incomplete("\"closed\""));
        // an open brace inside a comment does not count
        assert!(!repl.is_incomplete("1; // {"));
    }
}
