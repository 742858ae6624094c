use super::{properties, DiscoveryService, HotplugEvent, HotplugKind, NET_CAPABILITY};
use crate::collaborators::PolicyEngine;
use crate::device::{DeviceHandle, DeviceRegistry, MediumKind, RegistryError};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Translates discovery-service events into registry changes.
///
/// While detached every entry point is a no-op; devices already in the
/// registry are kept.
pub struct HotplugBridge {
    discovery: Option<Rc<dyn DiscoveryService>>,
    policy: Rc<dyn PolicyEngine>,
}

impl HotplugBridge {
    pub fn new(policy: Rc<dyn PolicyEngine>) -> Self {
        Self {
            discovery: None,
            policy,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.discovery.is_some()
    }

    /// Attach a discovery service and adopt the devices it already reports.
    /// Returns how many devices were added.
    pub async fn attach(
        &mut self,
        discovery: Rc<dyn DiscoveryService>,
        registry: &mut DeviceRegistry,
    ) -> usize {
        self.discovery = Some(discovery);
        self.enumerate_existing(registry).await
    }

    /// Returns false when nothing was attached.
    pub fn detach(&mut self) -> bool {
        self.discovery.take().is_some()
    }

    pub async fn handle(&self, registry: &mut DeviceRegistry, event: HotplugEvent) {
        debug!(kind = ?event.kind, hardware_id = %event.hardware_id, "Hotplug event");
        match event.kind {
            HotplugKind::Added => {
                self.on_device_added(registry, &event.hardware_id).await;
            }
            HotplugKind::Removed => {
                self.on_device_removed(registry, &event.hardware_id);
            }
            HotplugKind::CapabilityAdded => {
                let capability = event.capability.as_deref().unwrap_or_default();
                self.on_capability_added(registry, &event.hardware_id, capability)
                    .await;
            }
        }
    }

    /// Manage the hardware if it is a supported network interface. Hardware
    /// that cannot be resolved yet is dropped; a later capability
    /// announcement retries it.
    pub async fn on_device_added(
        &self,
        registry: &mut DeviceRegistry,
        hardware_id: &str,
    ) -> Option<DeviceHandle> {
        let discovery = self.discovery.clone()?;

        let interface = query(discovery.as_ref(), hardware_id, properties::INTERFACE).await?;
        let category = query(discovery.as_ref(), hardware_id, properties::CATEGORY).await?;
        let medium = MediumKind::from_category(&category);
        if medium == MediumKind::Unknown {
            debug!(hardware_id, category = %category, "Not a supported network device");
            return None;
        }

        match registry
            .create_device(hardware_id, &interface, Some(medium), Some(discovery.as_ref()))
            .await
        {
            Ok(handle) => Some(handle),
            Err(RegistryError::DuplicateInterface(interface)) => {
                debug!(hardware_id, interface = %interface, "Interface already managed");
                None
            }
            Err(e) => {
                warn!(hardware_id, error = %e, "Could not manage device");
                None
            }
        }
    }

    pub fn on_device_removed(&self, registry: &mut DeviceRegistry, hardware_id: &str) -> bool {
        if !self.is_attached() {
            return false;
        }
        let Some(handle) = registry.find_by_hardware_id(hardware_id).map(|d| d.handle) else {
            return false;
        };

        let removed = registry.remove_device(handle);
        if removed {
            self.policy.schedule_device_change_check();
        }
        removed
    }

    pub async fn on_capability_added(
        &self,
        registry: &mut DeviceRegistry,
        hardware_id: &str,
        capability: &str,
    ) -> Option<DeviceHandle> {
        if !MediumKind::is_supported_category(capability) {
            return None;
        }
        self.on_device_added(registry, hardware_id).await
    }

    /// Add every network device the discovery service currently reports, in
    /// the order it reports them.
    pub async fn enumerate_existing(&self, registry: &mut DeviceRegistry) -> usize {
        let Some(discovery) = self.discovery.clone() else {
            return 0;
        };

        let hardware_ids = match discovery.find_by_capability(NET_CAPABILITY).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Could not enumerate network devices");
                return 0;
            }
        };

        let mut added = 0;
        for hardware_id in &hardware_ids {
            if self.on_device_added(registry, hardware_id).await.is_some() {
                added += 1;
            }
        }
        info!(found = hardware_ids.len(), added, "Enumerated existing network devices");
        added
    }
}

async fn query(discovery: &dyn DiscoveryService, hardware_id: &str, key: &str) -> Option<String> {
    match discovery.property(hardware_id, key).await {
        Ok(Some(value)) if !value.is_empty() => Some(value),
        Ok(_) => {
            debug!(hardware_id, key, "Property not available yet");
            None
        }
        Err(e) => {
            warn!(hardware_id, key, error = %e, "Discovery property query failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Endpoint, SignalDispatcher};
    use crate::collaborators::testing::Recorder;
    use crate::hotplug::testing::FakeDiscovery;
    use crate::names::{NM_INTERFACE, NM_PATH};
    use std::cell::RefCell;

    struct Fixture {
        bridge: HotplugBridge,
        registry: DeviceRegistry,
        discovery: Rc<FakeDiscovery>,
        recorder: Rc<Recorder>,
        added: Rc<RefCell<Vec<String>>>,
        removed: Rc<RefCell<Vec<String>>>,
    }

    fn record(dispatcher: &SignalDispatcher, signal: &str) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        dispatcher.subscribe_typed::<(crate::bus::ObjectPath, String), _>(
            Endpoint::new(NM_PATH, NM_INTERFACE),
            signal,
            move |_, (_, interface)| sink.borrow_mut().push(interface),
        );
        log
    }

    async fn attached(discovery: FakeDiscovery) -> Fixture {
        let dispatcher = Rc::new(SignalDispatcher::new());
        let added = record(&dispatcher, "DeviceAdded");
        let removed = record(&dispatcher, "DeviceRemoved");

        let recorder = Recorder::new();
        let collaborators = recorder.collaborators();
        let mut registry = DeviceRegistry::new(
            dispatcher,
            collaborators.control,
            collaborators.policy.clone(),
            false,
        );
        let mut bridge = HotplugBridge::new(collaborators.policy);
        let discovery = Rc::new(discovery);
        bridge.attach(discovery.clone(), &mut registry).await;

        Fixture {
            bridge,
            registry,
            discovery,
            recorder,
            added,
            removed,
        }
    }

    #[tokio::test]
    async fn test_added_ethernet_device() {
        let mut fx = attached(FakeDiscovery::new()).await;
        fx.discovery.set("udi-1", properties::INTERFACE, "eth0");
        fx.discovery.set("udi-1", properties::CATEGORY, "net.80203");

        fx.bridge
            .handle(&mut fx.registry, HotplugEvent::added("udi-1"))
            .await;

        assert_eq!(fx.registry.len(), 1);
        assert_eq!(
            fx.registry.find_by_interface("eth0").unwrap().medium,
            MediumKind::Ethernet
        );
        assert_eq!(*fx.added.borrow(), vec!["eth0"]);
    }

    #[tokio::test]
    async fn test_add_then_remove() {
        let mut fx = attached(FakeDiscovery::new()).await;
        fx.discovery.set("udi-1", properties::INTERFACE, "eth0");
        fx.discovery.set("udi-1", properties::CATEGORY, "net.80203");

        fx.bridge
            .handle(&mut fx.registry, HotplugEvent::added("udi-1"))
            .await;
        fx.bridge
            .handle(&mut fx.registry, HotplugEvent::removed("udi-1"))
            .await;

        assert!(fx.registry.is_empty());
        assert_eq!(*fx.added.borrow(), vec!["eth0"]);
        assert_eq!(*fx.removed.borrow(), vec!["eth0"]);
        // one check for the add, one for the removal
        assert_eq!(fx.recorder.count("device-change-check"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_interface_ignored() {
        let mut fx = attached(FakeDiscovery::new()).await;
        for udi in ["udi-1", "udi-2"] {
            fx.discovery.set(udi, properties::INTERFACE, "eth0");
            fx.discovery.set(udi, properties::CATEGORY, "net.80203");
        }

        let first = fx.bridge.on_device_added(&mut fx.registry, "udi-1").await;
        let second = fx.bridge.on_device_added(&mut fx.registry, "udi-2").await;

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(fx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_device_retried_on_capability() {
        let mut fx = attached(FakeDiscovery::new()).await;
        fx.discovery.set("udi-1", properties::INTERFACE, "wlan0");

        assert!(fx
            .bridge
            .on_device_added(&mut fx.registry, "udi-1")
            .await
            .is_none());

        fx.discovery.set("udi-1", properties::CATEGORY, "net.80211");
        fx.bridge
            .handle(&mut fx.registry, HotplugEvent::capability_added("udi-1", "net"))
            .await;
        assert!(fx.registry.is_empty());

        fx.bridge
            .handle(
                &mut fx.registry,
                HotplugEvent::capability_added("udi-1", "net.80211"),
            )
            .await;
        assert_eq!(
            fx.registry.find_by_interface("wlan0").unwrap().medium,
            MediumKind::WirelessLan
        );
    }

    #[tokio::test]
    async fn test_attach_enumerates_in_order() {
        let discovery = FakeDiscovery::new();
        discovery.add_net_device("udi-b", "eth1", "net.80203");
        discovery.add_net_device("udi-a", "eth0", "net.80203");
        discovery.add_net_device("udi-x", "irda0", "net.irda");

        let fx = attached(discovery).await;
        assert_eq!(*fx.added.borrow(), vec!["eth1", "eth0"]);
    }

    #[tokio::test]
    async fn test_enumeration_failure_counts_as_empty() {
        let discovery = FakeDiscovery::new();
        discovery.add_net_device("udi-1", "eth0", "net.80203");
        discovery.fail_enumeration(true);

        let fx = attached(discovery).await;
        assert!(fx.registry.is_empty());
        assert!(fx.bridge.is_attached());
    }

    #[tokio::test]
    async fn test_detached_bridge_is_inert() {
        let mut fx = attached(FakeDiscovery::new()).await;
        fx.discovery.set("udi-1", properties::INTERFACE, "eth0");
        fx.discovery.set("udi-1", properties::CATEGORY, "net.80203");
        fx.bridge.on_device_added(&mut fx.registry, "udi-1").await;

        assert!(fx.bridge.detach());
        assert!(!fx.bridge.detach());

        fx.bridge
            .handle(&mut fx.registry, HotplugEvent::removed("udi-1"))
            .await;
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.bridge.enumerate_existing(&mut fx.registry).await, 0);
    }
}
