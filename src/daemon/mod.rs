//! netmand daemon - process lifecycle around the device registry
//!
//! Handles:
//! - Startup: bus acquisition, discovery-service presence, initial enumeration
//! - The event loop: termination pipe, hotplug queue, bus traffic, reconnects
//! - Orderly teardown of devices, the discovery watch and the bus link
//!
//! # Architecture
//!
//! Everything runs on one thread. OS signals only write a byte into the
//! self-pipe; the loop does the actual work.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Daemon                     │
//! ├──────────────────────────────────────────────┤
//! │ SelfPipe   │ hotplug queue │ bus events      │
//! │ (SIGTERM)  │ (HAL watch)   │ (signals/calls) │
//! ├──────────────────────────────────────────────┤
//! │ DaemonState: registry │ dispatcher │ bridge  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod lifecycle;
pub mod methods;
pub mod pid_file;
pub mod self_pipe;
pub mod state;

pub use lifecycle::{Daemon, DaemonOptions, ExitStatus, LifecyclePhase};
pub use methods::MethodTables;
pub use pid_file::PidFile;
pub use self_pipe::{Notifier, SelfPipe};
pub use state::{DaemonState, NetworkState};
