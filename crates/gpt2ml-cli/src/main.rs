#![warn(clippy::all, rust_2018_idioms)]

use clap::Parser;

mod cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = cli::Cli::parse();
    cli::run(&cli)
}
