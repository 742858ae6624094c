//! Interfaces to the subsystems the core drives but does not implement:
//! per-device control (link bring-up, DHCP, supplicant), connection policy,
//! and VPN.

use crate::device::Device;
use std::rc::Rc;
use tracing::debug;

pub trait DeviceControl {
    fn start(&self, device: &Device);
    fn deactivate(&self, device: &Device);
    fn stop(&self, device: &Device);
    fn set_wireless_radio(&self, device: &Device, enabled: bool);
}

pub trait PolicyEngine {
    fn schedule_device_change_check(&self);
    fn schedule_allowed_ap_list_update(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnActivation {
    pub name: String,
}

pub trait VpnManager {
    fn active_vpn(&self) -> Option<VpnActivation>;
    fn deactivate_vpn(&self, vpn: &VpnActivation);
    fn schedule_connections_update(&self);
}

#[derive(Clone)]
pub struct Collaborators {
    pub control: Rc<dyn DeviceControl>,
    pub policy: Rc<dyn PolicyEngine>,
    pub vpn: Rc<dyn VpnManager>,
}

impl Collaborators {
    /// Collaborators that only log the requests they receive
    pub fn detached() -> Self {
        let detached = Rc::new(Detached);
        Self {
            control: detached.clone(),
            policy: detached.clone(),
            vpn: detached,
        }
    }
}

struct Detached;

impl DeviceControl for Detached {
    fn start(&self, device: &Device) {
        debug!(interface = %device.interface, "Device start requested");
    }

    fn deactivate(&self, device: &Device) {
        debug!(interface = %device.interface, "Device deactivation requested");
    }

    fn stop(&self, device: &Device) {
        debug!(interface = %device.interface, "Device stop requested");
    }

    fn set_wireless_radio(&self, device: &Device, enabled: bool) {
        debug!(interface = %device.interface, enabled, "Wireless radio change requested");
    }
}

impl PolicyEngine for Detached {
    fn schedule_device_change_check(&self) {
        debug!("Device change check scheduled");
    }

    fn schedule_allowed_ap_list_update(&self) {
        debug!("Allowed access point list update scheduled");
    }
}

impl VpnManager for Detached {
    fn active_vpn(&self) -> Option<VpnActivation> {
        None
    }

    fn deactivate_vpn(&self, vpn: &VpnActivation) {
        debug!(vpn = %vpn.name, "VPN deactivation requested");
    }

    fn schedule_connections_update(&self) {
        debug!("VPN connections update scheduled");
    }
}
