//! Conversar CLI - interactive REPL over the streaming inference engine.

use std::process::ExitCode;

use clap::Parser;

use conversar::cli::{run, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
