use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "netmand")]
#[command(version)]
#[command(about = "Network device management daemon", long_about = None)]
pub(crate) struct Cli {
    /// Stay in the foreground instead of detaching from the terminal
    #[arg(long)]
    pub no_daemon: bool,

    /// Write the process id to this file (default while detached: from config)
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Allow clients to create and remove synthetic test devices
    #[arg(long)]
    pub enable_test_devices: bool,

    /// Print usage information and exit
    #[arg(long)]
    pub info: bool,

    /// Configuration file. Can also be set via NETMAND_CONFIG env var.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g., info, netmand=debug)
    #[arg(long)]
    pub log_level: Option<String>,
}
