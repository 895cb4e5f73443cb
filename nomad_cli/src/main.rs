//! Main entry point for the nomad cli tool

mod cli;

use clap::Parser;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

fn main() {
    human_panic::setup_panic!();

    let mut builder = Builder::new();
    builder
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter_level(LevelFilter::Info)
        .target(Target::Stdout)
        .init();

    let args = cli::Cli::parse();
    if let Err(err) = cli::run(args) {
        // engine errors carry stable exit codes and, for SQL failures, a
        // path:line:column prefix in their Display form
        match err.downcast_ref::<nomad_core::Error>() {
            Some(core_err) => {
                eprintln!("{}", core_err);
                std::process::exit(core_err.exit_code());
            }
            None => {
                eprintln!("{:#}", err);
                std::process::exit(10);
            }
        }
    }
}
