//! REPL (Read-Eval-Print Loop) implementation

use crate::error::{CliError, CliResult};
use crate::runtime::Runtime;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Run the interactive REPL against a persistent runtime.
///
/// Expression statements echo their value (the VM prints before
/// discarding in REPL mode). Input continues across lines until the
/// delimiters balance.
pub fn run_repl(runtime: &mut Runtime) -> CliResult<()> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| CliError::Repl(format!("Failed to initialize editor: {}", e)))?;

    runtime.set_repl(true);

    println!("Dictu (REPL)");
    println!("Type code or 'exit' to quit.");
    println!();

    let mut buffer = String::new();
    let mut continuing = false;

    loop {
        let prompt = if continuing { "... " } else { ">>> " };

        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();

                if !continuing && (trimmed == "exit" || trimmed == "quit") {
                    break;
                }
                if !continuing && trimmed.is_empty() {
                    continue;
                }

                if continuing {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                if !is_input_complete(&buffer) {
                    continuing = true;
                    continue;
                }
                continuing = false;

                let _ = editor.add_history_entry(&buffer);

                // Errors print and the loop continues; the VM has already
                // reset its stacks.
                if let Err(err) = runtime.execute_source(&buffer) {
                    eprintln!("{}", err);
                }

                buffer.clear();
            }
            Err(ReadlineError::Interrupted) => {
                if continuing {
                    println!("^C");
                    buffer.clear();
                    continuing = false;
                } else {
                    println!("Press Ctrl-D or type 'exit' to quit");
                }
            }
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => {
                return Err(CliError::Repl(format!("Readline error: {}", err)));
            }
        }
    }

    Ok(())
}

/// Whether the buffered input looks complete: balanced delimiters and no
/// open string.
fn is_input_complete(input: &str) -> bool {
    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut in_string = false;
    let mut string_char = ' ';
    let mut escape_next = false;
    let mut in_comment = false;
    let mut previous = ' ';

    for c in input.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            previous = c;
            continue;
        }

        if escape_next {
            escape_next = false;
            previous = c;
            continue;
        }

        if c == '\\' && in_string {
            escape_next = true;
            previous = c;
            continue;
        }

        if in_string {
            if c == string_char {
                in_string = false;
            }
        } else {
            match c {
                '"' | '\'' => {
                    in_string = true;
                    string_char = c;
                }
                '/' if previous == '/' => in_comment = true,
                '{' => brace += 1,
                '}' => brace -= 1,
                '[' => bracket += 1,
                ']' => bracket -= 1,
                '(' => paren += 1,
                ')' => paren -= 1,
                _ => {}
            }
        }
        previous = c;
    }

    brace <= 0 && bracket <= 0 && paren <= 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_input_complete_simple() {
        assert!(is_input_complete("var x = 42;"));
        assert!(is_input_complete("print(\"hello\");"));
    }

    #[test]
    fn test_is_input_complete_open_block() {
        assert!(!is_input_complete("def test() {"));
        assert!(!is_input_complete("if (true) {"));
        assert!(!is_input_complete("var l = [1, 2,"));
    }

    #[test]
    fn test_is_input_complete_closed_block() {
        assert!(is_input_complete("def test() { return 42; }"));
        assert!(is_input_complete("if (true) { print(1); }"));
    }

    #[test]
    fn test_is_input_complete_strings() {
        assert!(is_input_complete("var s = \"brace { inside\";"));
        assert!(!is_input_complete("var s = \"unclosed"));
        assert!(is_input_complete("var s = 'single';"));
    }

    #[test]
    fn test_is_input_complete_comments() {
        assert!(is_input_complete("var x = 1; // open { comment"));
    }
}
