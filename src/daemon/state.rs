use crate::bus::SignalDispatcher;
use crate::collaborators::Collaborators;
use crate::device::DeviceRegistry;
use crate::hotplug::{HalWatch, HotplugBridge};
use std::rc::Rc;
use tracing::debug;

/// Overall connectivity as reported over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unknown,
    Asleep,
    Connecting,
    Connected,
    Disconnected,
}

impl NetworkState {
    pub fn code(self) -> u32 {
        match self {
            NetworkState::Unknown => 0,
            NetworkState::Asleep => 1,
            NetworkState::Connecting => 2,
            NetworkState::Connected => 3,
            NetworkState::Disconnected => 4,
        }
    }
}

/// Everything the daemon loop owns. Built once at startup and passed
/// explicitly.
pub struct DaemonState {
    pub registry: DeviceRegistry,
    pub dispatcher: Rc<SignalDispatcher>,
    pub bridge: HotplugBridge,
    pub hal_watch: Option<HalWatch>,
    pub collaborators: Collaborators,
    shutdown_requested: bool,
}

impl DaemonState {
    pub fn new(collaborators: Collaborators, enable_test_devices: bool) -> Self {
        let dispatcher = Rc::new(SignalDispatcher::new());
        let registry = DeviceRegistry::new(
            dispatcher.clone(),
            collaborators.control.clone(),
            collaborators.policy.clone(),
            enable_test_devices,
        );
        let bridge = HotplugBridge::new(collaborators.policy.clone());

        Self {
            registry,
            dispatcher,
            bridge,
            hal_watch: None,
            collaborators,
            shutdown_requested: false,
        }
    }

    /// Returns true only for the first request.
    pub fn request_shutdown(&mut self) -> bool {
        if self.shutdown_requested {
            debug!("Shutdown already requested");
            return false;
        }
        self.shutdown_requested = true;
        true
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn network_state(&self) -> NetworkState {
        if self.registry.active_device().is_some() {
            NetworkState::Connected
        } else {
            NetworkState::Disconnected
        }
    }
}
