//! Managed network devices
//!
//! A [`Device`] is one network interface the daemon manages. Devices are owned
//! by the [`DeviceRegistry`]; everything else refers to them by
//! [`DeviceHandle`] or looks them up by interface name, hardware id or object
//! path.
//!
//! Medium-specific behaviour (bring-up order, description) is selected from
//! the closed [`MediumKind`] set through [`MediumOps`].

mod registry;

pub use registry::{DeviceRegistry, RegistryError};

use crate::collaborators::DeviceControl;
use crate::names::NM_DEVICES_PATH;
use std::fmt;

/// Stable identifier of a device for the lifetime of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub(crate) u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque reference to a connection activation, owned by the activation
/// subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediumKind {
    Ethernet,
    WirelessLan,
    Unknown,
}

impl MediumKind {
    /// Map a discovery `info.category` value
    pub fn from_category(category: &str) -> Self {
        match category {
            "net.80203" => MediumKind::Ethernet,
            "net.80211" => MediumKind::WirelessLan,
            _ => MediumKind::Unknown,
        }
    }

    pub fn is_supported_category(category: &str) -> bool {
        Self::from_category(category) != MediumKind::Unknown
    }

    /// Numeric type exposed over the bus
    pub fn type_code(self) -> u32 {
        match self {
            MediumKind::Unknown => 0,
            MediumKind::Ethernet => 1,
            MediumKind::WirelessLan => 2,
        }
    }

    pub fn from_type_code(code: u32) -> Self {
        match code {
            1 => MediumKind::Ethernet,
            2 => MediumKind::WirelessLan,
            _ => MediumKind::Unknown,
        }
    }

    pub fn ops(self) -> &'static dyn MediumOps {
        match self {
            MediumKind::Ethernet => &Ethernet,
            MediumKind::WirelessLan => &Wireless,
            MediumKind::Unknown => &Unsupported,
        }
    }
}

/// Per-medium device behaviour
pub trait MediumOps {
    fn describe(&self) -> &'static str;
    fn start(&self, device: &Device, control: &dyn DeviceControl);
    fn deactivate(&self, device: &Device, control: &dyn DeviceControl);
}

struct Ethernet;
struct Wireless;
struct Unsupported;

impl MediumOps for Ethernet {
    fn describe(&self) -> &'static str {
        "wired Ethernet (802.3)"
    }

    fn start(&self, device: &Device, control: &dyn DeviceControl) {
        control.start(device);
    }

    fn deactivate(&self, device: &Device, control: &dyn DeviceControl) {
        control.deactivate(device);
    }
}

impl MediumOps for Wireless {
    fn describe(&self) -> &'static str {
        "wireless (802.11)"
    }

    fn start(&self, device: &Device, control: &dyn DeviceControl) {
        // Radio must be on before the link can come up.
        control.set_wireless_radio(device, true);
        control.start(device);
    }

    fn deactivate(&self, device: &Device, control: &dyn DeviceControl) {
        control.deactivate(device);
    }
}

impl MediumOps for Unsupported {
    fn describe(&self) -> &'static str {
        "unknown"
    }

    fn start(&self, _device: &Device, _control: &dyn DeviceControl) {}

    fn deactivate(&self, _device: &Device, _control: &dyn DeviceControl) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub handle: DeviceHandle,
    pub interface: String,
    /// Discovery-service identifier (HAL UDI)
    pub hardware_id: String,
    pub medium: MediumKind,
    pub driver: Option<String>,
    pub removed: bool,
    pub activation: Option<ActivationRef>,
    pub test_device: bool,
}

impl Device {
    pub fn object_path(&self) -> String {
        object_path_for(&self.interface)
    }

    pub fn is_active(&self) -> bool {
        self.activation.is_some()
    }
}

pub fn object_path_for(interface: &str) -> String {
    format!("{NM_DEVICES_PATH}/{interface}")
}
