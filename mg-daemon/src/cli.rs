//! Command line interface

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "metalguardd")]
#[command(version)]
#[command(about = "MetalGuard - hardware supervision daemon")]
#[command(long_about = "MetalGuard - hardware supervision daemon

Runs the thermal, power, power-stability and tamper monitors for one device
until SIGINT/SIGTERM, or runs the diagnostics battery once and exits.")]
pub struct Cli {
    /// Device settings file (JSON)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Use in-memory pins instead of sysfs GPIO
    #[arg(long)]
    pub simulate: bool,

    /// Run the diagnostics battery once and exit
    #[arg(long)]
    pub diagnostics: bool,
}
