mod args;

use anyhow::Context;
use args::Cli;
use clap::{CommandFactory, Parser};
use netmand::bus::SystemBusConnector;
use netmand::collaborators::Collaborators;
use netmand::daemon::PidFile;
use netmand::{logging, Daemon, DaemonConfig, DaemonError, DaemonOptions};
use std::io;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // SAFETY: getuid has no preconditions.
    let uid = unsafe { libc::getuid() };
    match preflight(&cli, uid) {
        Err(e) => {
            eprintln!("netmand: {}", e);
            return ExitCode::FAILURE;
        }
        Ok(Preflight::PrintUsage) => {
            let _ = Cli::command().print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Preflight::Continue) => {}
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("netmand: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Preflight {
    Continue,
    PrintUsage,
}

/// Root is required before anything else, usage output included.
fn preflight(cli: &Cli, uid: libc::uid_t) -> Result<Preflight, DaemonError> {
    if uid != 0 {
        return Err(DaemonError::NotRoot);
    }
    Ok(if cli.info {
        Preflight::PrintUsage
    } else {
        Preflight::Continue
    })
}

fn daemonize() -> Result<(), DaemonError> {
    // SAFETY: called before the runtime or any other thread exists.
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(DaemonError::Daemonize(io::Error::last_os_error()));
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if cli.enable_test_devices {
        config.enable_test_devices = true;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // SAFETY: umask only changes this process's file creation mask.
    unsafe {
        libc::umask(0o022);
    }

    let detach = !cli.no_daemon;
    let pid_path = match (&cli.pid_file, detach) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(config.pid_file.clone()),
        (None, false) => None,
    };
    if let Some(pid) = pid_path.as_deref().and_then(PidFile::running_pid) {
        return Err(DaemonError::AlreadyRunning(pid).into());
    }

    if detach {
        daemonize()?;
    }

    let log_file = detach.then_some(config.log_file.as_path());
    logging::init(&config.log_level, log_file)?;

    let _pid_file = pid_path
        .map(|path| {
            PidFile::create(&path).map_err(|source| DaemonError::PidFile { path, source })
        })
        .transpose()?;

    info!(version = env!("CARGO_PKG_VERSION"), "netmand starting");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the async runtime")?;

    let options = DaemonOptions::from(&config);
    let connector = SystemBusConnector::new(config.bus.service_name.clone());

    let status = runtime.block_on(async move {
        let mut daemon = Daemon::new(connector, Collaborators::detached(), options)?;
        daemon.install_signal_handlers()?;
        Ok::<_, DaemonError>(daemon.run().await)
    })?;

    Ok(ExitCode::from(status.code()))
}
