//! `mdreader-sync`: inspect and drive the MDReader sync engine from a terminal.

/// CLI module - argument parsing and command handlers
mod cli;

fn main() {
    cli::run_cli();
}
