//! Dictu CLI
//!
//! Entry point for the interpreter. `dictu <script.du>` executes a file;
//! no arguments enters the REPL. Exit codes: 0 success, 65 compile
//! error, 70 runtime error, 74 I/O error.

use clap::Parser;
use dictu_cli::{repl, Cli, Runtime};

fn main() {
    let cli = Cli::parse();

    let mut runtime = Runtime::new().with_print_bytecode(cli.print_bytecode);

    match cli.file {
        Some(file) => {
            if let Err(err) = runtime.execute_file(&file) {
                eprintln!("{}", err);
                std::process::exit(err.exit_code());
            }
        }
        None => {
            if let Err(err) = repl::run_repl(&mut runtime) {
                eprintln!("{}", err);
                std::process::exit(err.exit_code());
            }
        }
    }
}
