use super::{ActivationRef, Device, DeviceHandle, MediumKind};
use crate::bus::{Endpoint, SignalDispatcher, Value};
use crate::collaborators::{DeviceControl, PolicyEngine};
use crate::hotplug::{properties, DiscoveryService};
use crate::names::{signals, NM_INTERFACE, NM_PATH};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a device with interface '{0}' is already managed")]
    DuplicateInterface(String),

    #[error("interface name is empty")]
    EmptyInterface,

    #[error("device '{interface}' has no supported medium")]
    UnsupportedMedium { interface: String },

    #[error("test devices are not enabled")]
    TestDevicesDisabled,
}

/// Owns every managed device.
///
/// Interface names are unique among devices that are not removed. Additions
/// and removals are announced through the dispatcher before the mutating call
/// returns.
pub struct DeviceRegistry {
    devices: Vec<Device>,
    next_handle: u64,
    dispatcher: Rc<SignalDispatcher>,
    control: Rc<dyn DeviceControl>,
    policy: Rc<dyn PolicyEngine>,
    enable_test_devices: bool,
}

impl DeviceRegistry {
    pub fn new(
        dispatcher: Rc<SignalDispatcher>,
        control: Rc<dyn DeviceControl>,
        policy: Rc<dyn PolicyEngine>,
        enable_test_devices: bool,
    ) -> Self {
        Self {
            devices: Vec::new(),
            next_handle: 0,
            dispatcher,
            control,
            policy,
            enable_test_devices,
        }
    }

    pub fn test_devices_enabled(&self) -> bool {
        self.enable_test_devices
    }

    /// Start managing the interface `interface` backed by `hardware_id`.
    ///
    /// The medium comes from `medium_hint` when it names a known medium,
    /// otherwise from the discovery service's category for `hardware_id`.
    pub async fn create_device(
        &mut self,
        hardware_id: &str,
        interface: &str,
        medium_hint: Option<MediumKind>,
        discovery: Option<&dyn DiscoveryService>,
    ) -> Result<DeviceHandle, RegistryError> {
        if interface.is_empty() {
            return Err(RegistryError::EmptyInterface);
        }
        if self.find_by_interface(interface).is_some() {
            return Err(RegistryError::DuplicateInterface(interface.to_string()));
        }

        let medium = match (medium_hint, discovery) {
            (Some(kind), _) if kind != MediumKind::Unknown => kind,
            (_, Some(discovery)) => resolve_medium(discovery, hardware_id).await,
            _ => MediumKind::Unknown,
        };
        if medium == MediumKind::Unknown {
            return Err(RegistryError::UnsupportedMedium {
                interface: interface.to_string(),
            });
        }

        let driver = match discovery {
            Some(discovery) => resolve_driver(discovery, hardware_id).await,
            None => None,
        };

        Ok(self.insert(hardware_id, interface, medium, driver, false))
    }

    /// Create a synthetic device for testing clients against the daemon.
    pub fn create_test_device(
        &mut self,
        interface: &str,
        medium: MediumKind,
    ) -> Result<DeviceHandle, RegistryError> {
        if !self.enable_test_devices {
            return Err(RegistryError::TestDevicesDisabled);
        }
        if interface.is_empty() {
            return Err(RegistryError::EmptyInterface);
        }
        if self.find_by_interface(interface).is_some() {
            return Err(RegistryError::DuplicateInterface(interface.to_string()));
        }
        if medium == MediumKind::Unknown {
            return Err(RegistryError::UnsupportedMedium {
                interface: interface.to_string(),
            });
        }

        let hardware_id = format!("/test-devices/{interface}");
        Ok(self.insert(&hardware_id, interface, medium, None, true))
    }

    fn insert(
        &mut self,
        hardware_id: &str,
        interface: &str,
        medium: MediumKind,
        driver: Option<String>,
        test_device: bool,
    ) -> DeviceHandle {
        self.next_handle += 1;
        let handle = DeviceHandle(self.next_handle);
        let device = Device {
            handle,
            interface: interface.to_string(),
            hardware_id: hardware_id.to_string(),
            medium,
            driver,
            removed: false,
            activation: None,
            test_device,
        };

        // Fresh devices start idle.
        let ops = medium.ops();
        ops.start(&device, self.control.as_ref());
        ops.deactivate(&device, self.control.as_ref());

        info!(
            interface,
            hardware_id,
            driver = device.driver.as_deref().unwrap_or("unknown"),
            test_device,
            "Now managing {} device '{}'",
            ops.describe(),
            interface
        );

        let path = device.object_path();
        self.devices.push(device);

        self.policy.schedule_device_change_check();
        self.broadcast(signals::DEVICE_ADDED, path, interface);
        handle
    }

    /// Stop managing a device. Returns false for unknown or already removed
    /// handles.
    pub fn remove_device(&mut self, handle: DeviceHandle) -> bool {
        let Some(index) = self
            .devices
            .iter()
            .position(|d| d.handle == handle && !d.removed)
        else {
            debug!(%handle, "Ignoring removal of unknown device");
            return false;
        };

        let device = &mut self.devices[index];
        device.removed = true;
        device.medium.ops().deactivate(device, self.control.as_ref());
        self.control.stop(device);

        let path = device.object_path();
        let interface = device.interface.clone();
        info!(interface = %interface, "Stopped managing device");

        self.broadcast(signals::DEVICE_REMOVED, path, &interface);
        self.devices.remove(index);
        true
    }

    fn broadcast(&self, signal: &str, path: String, interface: &str) {
        self.dispatcher.emit(
            &Endpoint::new(NM_PATH, NM_INTERFACE),
            signal,
            vec![Value::ObjectPath(path), Value::str(interface)],
        );
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&Device> {
        self.live().find(|d| d.handle == handle)
    }

    pub fn find_by_interface(&self, interface: &str) -> Option<&Device> {
        self.live().find(|d| d.interface == interface)
    }

    pub fn find_by_hardware_id(&self, hardware_id: &str) -> Option<&Device> {
        self.live().find(|d| d.hardware_id == hardware_id)
    }

    pub fn find_by_object_path(&self, path: &str) -> Option<&Device> {
        self.live().find(|d| d.object_path() == path)
    }

    /// First device, in insertion order, holding an activation.
    pub fn active_device(&self) -> Option<&Device> {
        self.live().find(|d| d.activation.is_some())
    }

    /// Returns false when the handle is unknown.
    pub fn set_activation(&mut self, handle: DeviceHandle, activation: Option<ActivationRef>) -> bool {
        match self
            .devices
            .iter_mut()
            .find(|d| d.handle == handle && !d.removed)
        {
            Some(device) => {
                device.activation = activation;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.live()
    }

    fn live(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| !d.removed)
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every device without announcing anything. Returns how many
    /// devices were released.
    pub fn shutdown_all(&mut self) -> usize {
        let count = self.devices.len();
        for device in &mut self.devices {
            device.removed = true;
            device.medium.ops().deactivate(device, self.control.as_ref());
            self.control.stop(device);
        }
        self.devices.clear();
        if count > 0 {
            info!(count, "Released all devices");
        }
        count
    }
}

async fn resolve_medium(discovery: &dyn DiscoveryService, hardware_id: &str) -> MediumKind {
    match discovery.property(hardware_id, properties::CATEGORY).await {
        Ok(Some(category)) => MediumKind::from_category(&category),
        Ok(None) => MediumKind::Unknown,
        Err(e) => {
            warn!(hardware_id, error = %e, "Could not read device category");
            MediumKind::Unknown
        }
    }
}

async fn resolve_driver(discovery: &dyn DiscoveryService, hardware_id: &str) -> Option<String> {
    let physical = match discovery.property(hardware_id, properties::PHYSICAL_DEVICE).await {
        Ok(physical) => physical?,
        Err(e) => {
            debug!(hardware_id, error = %e, "Could not read physical device");
            return None;
        }
    };

    match discovery.property(&physical, properties::DRIVER).await {
        Ok(driver) => driver,
        Err(e) => {
            debug!(hardware_id, physical = %physical, error = %e, "Could not read driver");
            None
        }
    }
}
