use super::{DiscoveryError, DiscoveryService, HotplugEvent};
use crate::bus::{BusConnection, Endpoint, SignalDispatcher, SubscriptionId, Value};
use crate::names::{
    signals, HAL_DEVICE_INTERFACE, HAL_MANAGER_INTERFACE, HAL_MANAGER_PATH, HAL_SERVICE,
};
use async_trait::async_trait;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

fn manager() -> Endpoint {
    Endpoint::new(HAL_MANAGER_PATH, HAL_MANAGER_INTERFACE)
}

/// Client for the HAL discovery service
#[derive(Clone)]
pub struct HalClient {
    dispatcher: Rc<SignalDispatcher>,
}

impl HalClient {
    pub fn new(dispatcher: Rc<SignalDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Start receiving HAL hotplug signals. Each signal is queued on `events`
    /// for the daemon loop; the watch lasts until the returned guard is
    /// dropped.
    pub async fn watch(
        &self,
        events: mpsc::UnboundedSender<HotplugEvent>,
    ) -> Result<HalWatch, DiscoveryError> {
        let connection = self
            .dispatcher
            .connection()
            .ok_or(DiscoveryError::NotConnected)?;
        connection
            .watch_service(HAL_SERVICE)
            .await
            .map_err(DiscoveryError::Watch)?;

        let tx = events.clone();
        let added = self.dispatcher.subscribe_typed::<(String,), _>(
            manager(),
            signals::DEVICE_ADDED,
            move |_, (udi,)| {
                let _ = tx.send(HotplugEvent::added(udi));
            },
        );

        let tx = events.clone();
        let removed = self.dispatcher.subscribe_typed::<(String,), _>(
            manager(),
            signals::DEVICE_REMOVED,
            move |_, (udi,)| {
                let _ = tx.send(HotplugEvent::removed(udi));
            },
        );

        let tx = events;
        let capability = self.dispatcher.subscribe_typed::<(String, String), _>(
            manager(),
            signals::NEW_CAPABILITY,
            move |_, (udi, capability)| {
                let _ = tx.send(HotplugEvent::capability_added(udi, capability));
            },
        );

        debug!("Watching HAL for hotplug events");
        Ok(HalWatch {
            dispatcher: self.dispatcher.clone(),
            connection,
            subscriptions: vec![added, removed, capability],
        })
    }
}

#[async_trait(?Send)]
impl DiscoveryService for HalClient {
    async fn property(&self, hardware_id: &str, key: &str) -> Result<Option<String>, DiscoveryError> {
        let device = Endpoint::new(hardware_id, HAL_DEVICE_INTERFACE);

        let (exists,): (bool,) = self
            .dispatcher
            .call_typed(HAL_SERVICE, &device, "PropertyExists", vec![Value::str(key)])
            .await?;
        if !exists {
            trace!(hardware_id, key, "HAL property not set");
            return Ok(None);
        }

        let (value,): (String,) = self
            .dispatcher
            .call_typed(HAL_SERVICE, &device, "GetPropertyString", vec![Value::str(key)])
            .await?;
        Ok(Some(value))
    }

    async fn find_by_capability(&self, capability: &str) -> Result<Vec<String>, DiscoveryError> {
        let (devices,): (Vec<String>,) = self
            .dispatcher
            .call_typed(
                HAL_SERVICE,
                &manager(),
                "FindDeviceByCapability",
                vec![Value::str(capability)],
            )
            .await?;
        Ok(devices)
    }
}

/// Live HAL signal subscriptions; dropping it stops the watch.
pub struct HalWatch {
    dispatcher: Rc<SignalDispatcher>,
    connection: Arc<dyn BusConnection>,
    subscriptions: Vec<SubscriptionId>,
}

impl Drop for HalWatch {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.dispatcher.unsubscribe(id);
        }
        self.connection.unwatch_service(HAL_SERVICE);
        debug!("Stopped watching HAL");
    }
}

#[cfg(test)]
pub mod testing {
    use crate::bus::memory::{MemoryBus, MemoryCall};
    use crate::bus::{BusError, Value};
    use crate::hotplug::{properties, NET_CAPABILITY};
    use crate::names::HAL_SERVICE;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Table = Arc<Mutex<HashMap<(String, String), String>>>;

    /// HAL method handlers served from a property table on a [`MemoryBus`]
    #[derive(Clone, Default)]
    pub struct FakeHal {
        properties: Table,
        net_devices: Arc<Mutex<Vec<String>>>,
    }

    fn key_arg(call: &MemoryCall) -> String {
        call.args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    impl FakeHal {
        pub fn install(bus: &MemoryBus) -> Self {
            let hal = Self::default();

            let table = hal.properties.clone();
            bus.on_call(HAL_SERVICE, "PropertyExists", move |call| {
                let key = (call.path.clone(), key_arg(call));
                Ok(vec![Value::Bool(table.lock().unwrap().contains_key(&key))])
            });

            let table = hal.properties.clone();
            bus.on_call(HAL_SERVICE, "GetPropertyString", move |call| {
                let key = (call.path.clone(), key_arg(call));
                match table.lock().unwrap().get(&key) {
                    Some(value) => Ok(vec![Value::str(value.clone())]),
                    None => Err(BusError::Remote {
                        name: "org.freedesktop.Hal.NoSuchProperty".to_string(),
                        message: key.1,
                    }),
                }
            });

            let devices = hal.net_devices.clone();
            bus.on_call(HAL_SERVICE, "FindDeviceByCapability", move |call| {
                let found = if key_arg(call) == NET_CAPABILITY {
                    devices.lock().unwrap().clone()
                } else {
                    Vec::new()
                };
                Ok(vec![Value::strings(found)])
            });

            hal
        }

        pub fn set(&self, hardware_id: &str, key: &str, value: &str) {
            self.properties
                .lock()
                .unwrap()
                .insert((hardware_id.to_string(), key.to_string()), value.to_string());
        }

        pub fn add_net_device(&self, hardware_id: &str, interface: &str, category: &str) {
            self.set(hardware_id, properties::INTERFACE, interface);
            self.set(hardware_id, properties::CATEGORY, category);
            self.net_devices.lock().unwrap().push(hardware_id.to_string());
        }
    }
}
