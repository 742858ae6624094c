//! Hardware discovery and hotplug
//!
//! The discovery service (HAL) reports hardware appearing and disappearing.
//! [`HalClient`] talks to it over the bus and turns its signals into
//! [`HotplugEvent`]s on the daemon loop; [`HotplugBridge`] turns those events
//! into registry mutations.
//!
//! ```text
//!   HAL signal ──► HalClient subscription ──► HotplugEvent queue
//!                                                   │
//!                                   daemon loop ◄───┘
//!                                        │
//!                          HotplugBridge::handle ──► DeviceRegistry
//! ```

mod bridge;
pub(crate) mod hal;

pub use bridge::HotplugBridge;
pub use hal::{HalClient, HalWatch};

use crate::bus::{BusError, CallError};
use async_trait::async_trait;
use thiserror::Error;

/// Hardware capability that marks a network device
pub const NET_CAPABILITY: &str = "net";

pub mod properties {
    pub const INTERFACE: &str = "net.interface";
    pub const CATEGORY: &str = "info.category";
    pub const PHYSICAL_DEVICE: &str = "net.physical_device";
    pub const DRIVER: &str = "info.linux.driver";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugKind {
    Added,
    Removed,
    CapabilityAdded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub hardware_id: String,
    pub capability: Option<String>,
}

impl HotplugEvent {
    pub fn added(hardware_id: impl Into<String>) -> Self {
        Self {
            kind: HotplugKind::Added,
            hardware_id: hardware_id.into(),
            capability: None,
        }
    }

    pub fn removed(hardware_id: impl Into<String>) -> Self {
        Self {
            kind: HotplugKind::Removed,
            hardware_id: hardware_id.into(),
            capability: None,
        }
    }

    pub fn capability_added(hardware_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            kind: HotplugKind::CapabilityAdded,
            hardware_id: hardware_id.into(),
            capability: Some(capability.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery query failed: {0}")]
    Call(#[from] CallError),

    #[error("cannot watch discovery service: {0}")]
    Watch(BusError),

    #[error("not connected to the bus")]
    NotConnected,
}

/// Read access to the hardware discovery service
#[async_trait(?Send)]
pub trait DiscoveryService {
    /// String property of a hardware object, `None` when it is not set.
    async fn property(&self, hardware_id: &str, key: &str) -> Result<Option<String>, DiscoveryError>;

    async fn find_by_capability(&self, capability: &str) -> Result<Vec<String>, DiscoveryError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Discovery service backed by a property table
    #[derive(Default)]
    pub struct FakeDiscovery {
        properties: RefCell<HashMap<(String, String), String>>,
        net_devices: RefCell<Vec<String>>,
        fail_enumeration: RefCell<bool>,
    }

    impl FakeDiscovery {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, hardware_id: &str, key: &str, value: &str) {
            self.properties
                .borrow_mut()
                .insert((hardware_id.to_string(), key.to_string()), value.to_string());
        }

        /// A network device with interface and category, listed under the
        /// `net` capability.
        pub fn add_net_device(&self, hardware_id: &str, interface: &str, category: &str) {
            self.set(hardware_id, properties::INTERFACE, interface);
            self.set(hardware_id, properties::CATEGORY, category);
            self.net_devices.borrow_mut().push(hardware_id.to_string());
        }

        pub fn fail_enumeration(&self, fail: bool) {
            *self.fail_enumeration.borrow_mut() = fail;
        }
    }

    #[async_trait(?Send)]
    impl DiscoveryService for FakeDiscovery {
        async fn property(
            &self,
            hardware_id: &str,
            key: &str,
        ) -> Result<Option<String>, DiscoveryError> {
            Ok(self
                .properties
                .borrow()
                .get(&(hardware_id.to_string(), key.to_string()))
                .cloned())
        }

        async fn find_by_capability(&self, capability: &str) -> Result<Vec<String>, DiscoveryError> {
            if *self.fail_enumeration.borrow() {
                return Err(DiscoveryError::NotConnected);
            }
            if capability == NET_CAPABILITY {
                Ok(self.net_devices.borrow().clone())
            } else {
                Ok(Vec::new())
            }
        }
    }
}
