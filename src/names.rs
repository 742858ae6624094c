//! Well-known bus names, object paths and interfaces

/// Service name claimed by the daemon
pub const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
pub const NM_PATH: &str = "/org/freedesktop/NetworkManager";
pub const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";

pub const NM_DEVICES_PATH: &str = "/org/freedesktop/NetworkManager/Devices";
pub const NM_DEVICES_INTERFACE: &str = "org.freedesktop.NetworkManager.Devices";

/// User-session notification aggregator
pub const NMI_SERVICE: &str = "org.freedesktop.NetworkManagerInfo";

pub const HAL_SERVICE: &str = "org.freedesktop.Hal";
pub const HAL_MANAGER_PATH: &str = "/org/freedesktop/Hal/Manager";
pub const HAL_MANAGER_INTERFACE: &str = "org.freedesktop.Hal.Manager";
pub const HAL_DEVICE_INTERFACE: &str = "org.freedesktop.Hal.Device";

pub mod signals {
    pub const DEVICE_ADDED: &str = "DeviceAdded";
    pub const DEVICE_REMOVED: &str = "DeviceRemoved";
    pub const STATE_CHANGE: &str = "StateChange";
    pub const NEW_CAPABILITY: &str = "NewCapability";
}
