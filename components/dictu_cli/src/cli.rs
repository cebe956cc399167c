//! Command-line argument definitions

use clap::Parser;

/// The Dictu scripting language.
#[derive(Parser, Debug)]
#[command(name = "dictu", version, about = "The Dictu scripting language")]
pub struct Cli {
    /// Script to execute; omit to start the REPL
    pub file: Option<String>,

    /// Print the compiled bytecode before executing
    #[arg(long)]
    pub print_bytecode: bool,
}
