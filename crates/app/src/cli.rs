use std::ffi::OsString;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::{
    counting::{self, CountingConfig, RunCliArgs},
    zones::{self, ZonesArgs},
};

#[derive(Debug, Parser)]
#[command(name = "zone-counter", version, about = "Zone entry/exit counter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count crossings from a tracker sidecar or a replay file.
    Run(RunCliArgs),
    /// Manage regions in the polygon store.
    Zones(ZonesArgs),
}

pub fn handle_commands<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    match cli.command {
        Command::Run(args) => counting::run(CountingConfig::try_from(args)?),
        Command::Zones(args) => zones::run(args),
    }
}
