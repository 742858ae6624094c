#[cfg(not(unix))]
compile_error!("netmand only supports Unix-like systems");

pub mod bus;
pub mod clienv;
pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod logging;
pub mod names;

pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonOptions, ExitStatus};
pub use error::{DaemonError, Result};
