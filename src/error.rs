use crate::bus::BusError;
use crate::hotplug::DiscoveryError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop the daemon from starting
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("netmand must run as root")]
    NotRoot,

    #[error("could not create the termination pipe: {0}")]
    SelfPipe(#[source] io::Error),

    #[error("could not install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("system bus: {0}")]
    Bus(#[from] BusError),

    #[error("discovery service: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("could not write PID file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("could not detach from the terminal: {0}")]
    Daemonize(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
