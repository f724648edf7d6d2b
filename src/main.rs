use anyhow::Result;
use clap::Parser;

use gru::cli::Cli;

fn main() -> Result<()> {
    Cli::parse().run()
}
