use super::methods::MethodTables;
use super::self_pipe::{Notifier, SelfPipe};
use super::state::DaemonState;
use crate::bus::{BusConnector, BusEvent, BusLink, Endpoint, Value};
use crate::collaborators::Collaborators;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::hotplug::{DiscoveryError, HalClient, HotplugEvent};
use crate::names::{signals, HAL_SERVICE, NMI_SERVICE, NM_INTERFACE, NM_PATH};
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    AcquiringBus,
    WaitingForDiscoveryService,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    FatalStartup,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::FatalStartup => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub enable_test_devices: bool,
    /// Delay between attempts to get the bus back after losing it
    pub reconnect_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            enable_test_devices: false,
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

impl From<&DaemonConfig> for DaemonOptions {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            enable_test_devices: config.enable_test_devices,
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

async fn next_bus_event(events: &mut Option<mpsc::UnboundedReceiver<BusEvent>>) -> BusEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(BusEvent::Disconnected),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The daemon: owns the state and drives it from startup to termination.
pub struct Daemon<C: BusConnector> {
    connector: C,
    options: DaemonOptions,
    state: DaemonState,
    self_pipe: SelfPipe,
    methods: MethodTables,
    phase: LifecyclePhase,
    bus_events: Option<mpsc::UnboundedReceiver<BusEvent>>,
    reconnect_at: Option<Instant>,
    hotplug_tx: mpsc::UnboundedSender<HotplugEvent>,
    hotplug_rx: mpsc::UnboundedReceiver<HotplugEvent>,
}

impl<C: BusConnector> Daemon<C> {
    /// Build the daemon state. Must be called from within the runtime.
    pub fn new(connector: C, collaborators: Collaborators, options: DaemonOptions) -> Result<Self> {
        let self_pipe = SelfPipe::new().map_err(DaemonError::SelfPipe)?;
        let state = DaemonState::new(collaborators, options.enable_test_devices);
        let (hotplug_tx, hotplug_rx) = mpsc::unbounded_channel();

        Ok(Self {
            connector,
            options,
            state,
            self_pipe,
            methods: MethodTables::new(),
            phase: LifecyclePhase::Init,
            bus_events: None,
            reconnect_at: None,
            hotplug_tx,
            hotplug_rx,
        })
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// True while no discovery service is attached. The loop keeps running.
    pub fn waiting_for_discovery(&self) -> bool {
        !self.state.bridge.is_attached()
    }

    pub fn install_signal_handlers(&mut self) -> Result<()> {
        self.self_pipe
            .install_termination_handlers()
            .map_err(DaemonError::Signals)
    }

    /// Wakes the loop for shutdown exactly like SIGTERM does.
    pub fn notifier(&self) -> io::Result<Notifier> {
        self.self_pipe.notifier()
    }

    /// Start up, serve until asked to stop, then tear down.
    pub async fn run(&mut self) -> ExitStatus {
        let status = match self.start().await {
            Ok(()) => {
                self.serve().await;
                ExitStatus::Success
            }
            Err(e) => {
                error!("Startup failed: {}", e);
                ExitStatus::FatalStartup
            }
        };
        self.shutdown();
        status
    }

    async fn start(&mut self) -> Result<()> {
        info!("netmand starting...");
        self.phase = LifecyclePhase::AcquiringBus;

        let link = self.connector.connect().await?;
        self.adopt(link);
        self.on_bus_acquired().await?;

        self.broadcast_state();
        self.state.collaborators.policy.schedule_device_change_check();

        self.phase = LifecyclePhase::Running;
        info!("netmand ready");
        Ok(())
    }

    fn adopt(&mut self, link: BusLink) {
        self.state.dispatcher.set_connection(Some(link.connection));
        self.bus_events = Some(link.events);
        self.reconnect_at = None;
    }

    /// Presence checks run on every fresh bus connection. Only a failed
    /// discovery attach is reported; the caller decides whether it is fatal.
    async fn on_bus_acquired(&mut self) -> std::result::Result<(), DiscoveryError> {
        let Some(connection) = self.state.dispatcher.connection() else {
            return Ok(());
        };

        match connection.name_has_owner(NMI_SERVICE).await {
            Ok(true) => self.info_service_appeared(),
            Ok(false) => debug!("NetworkManagerInfo is not running"),
            Err(e) => warn!("Could not check for NetworkManagerInfo: {}", e),
        }

        let discovery_present = match connection.name_has_owner(HAL_SERVICE).await {
            Ok(present) => present,
            Err(e) => {
                warn!("Could not check for HAL: {}", e);
                false
            }
        };

        if discovery_present {
            self.attach_discovery().await?;
        } else {
            warn!("HAL is not running, waiting for it to appear");
            if self.phase == LifecyclePhase::AcquiringBus {
                self.phase = LifecyclePhase::WaitingForDiscoveryService;
            }
        }
        Ok(())
    }

    async fn attach_discovery(&mut self) -> std::result::Result<(), DiscoveryError> {
        let hal = HalClient::new(self.state.dispatcher.clone());
        let watch = hal.watch(self.hotplug_tx.clone()).await?;
        self.state.hal_watch = Some(watch);

        let added = self
            .state
            .bridge
            .attach(Rc::new(hal), &mut self.state.registry)
            .await;
        info!(devices = added, "Attached to HAL");
        Ok(())
    }

    fn detach_discovery(&mut self) {
        self.state.hal_watch = None;
        self.state.bridge.detach();
    }

    fn info_service_appeared(&self) {
        info!("NetworkManagerInfo is available");
        self.state.collaborators.policy.schedule_allowed_ap_list_update();
        self.state.collaborators.vpn.schedule_connections_update();
    }

    fn broadcast_state(&self) {
        let state = self.state.network_state();
        debug!(state = ?state, "Broadcasting network state");
        self.state.dispatcher.emit(
            &Endpoint::new(NM_PATH, NM_INTERFACE),
            signals::STATE_CHANGE,
            vec![Value::UInt32(state.code())],
        );
    }

    async fn serve(&mut self) {
        while !self.state.shutdown_requested() {
            tokio::select! {
                biased;

                drained = self.self_pipe.wait() => {
                    match drained {
                        Ok(count) => info!(count, "Caught termination signal"),
                        Err(e) => error!("Termination pipe failed: {}", e),
                    }
                    self.state.request_shutdown();
                }
                Some(event) = self.hotplug_rx.recv() => {
                    self.state.bridge.handle(&mut self.state.registry, event).await;
                }
                event = next_bus_event(&mut self.bus_events) => {
                    self.on_bus_event(event).await;
                }
                _ = sleep_until(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect().await;
                }
            }
        }
    }

    async fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Signal(signal) => {
                self.state.dispatcher.dispatch(&signal);
            }
            BusEvent::NameOwnerChanged {
                name,
                old_owner,
                new_owner,
            } => {
                self.on_name_owner_changed(&name, old_owner.is_some(), new_owner.is_some())
                    .await;
            }
            BusEvent::MethodCall(call) => {
                let reply = self.methods.invoke(&mut self.state, &call);
                call.respond(reply);
            }
            BusEvent::Disconnected => self.on_bus_lost(),
        }
    }

    async fn on_name_owner_changed(&mut self, name: &str, had_owner: bool, has_owner: bool) {
        let appeared = !had_owner && has_owner;
        let vanished = had_owner && !has_owner;

        if name == HAL_SERVICE {
            if appeared && !self.state.bridge.is_attached() {
                info!("HAL appeared");
                if let Err(e) = self.attach_discovery().await {
                    warn!("Could not attach to HAL: {}", e);
                    self.state.hal_watch = None;
                }
            } else if vanished && self.state.bridge.is_attached() {
                warn!("HAL went away; keeping known devices until it returns");
                self.detach_discovery();
            }
        } else if name == NMI_SERVICE && appeared {
            self.info_service_appeared();
        }
    }

    fn on_bus_lost(&mut self) {
        warn!("Lost connection to the system bus, will retry");
        self.detach_discovery();
        self.state.dispatcher.cancel_pending();
        self.state.dispatcher.set_connection(None);
        self.bus_events = None;
        self.reconnect_at = Some(Instant::now() + self.options.reconnect_interval);
    }

    async fn reconnect(&mut self) {
        match self.connector.connect().await {
            Ok(link) => {
                info!("Reconnected to the system bus");
                self.adopt(link);
                if let Err(e) = self.on_bus_acquired().await {
                    warn!("Could not attach to HAL after reconnect: {}", e);
                    self.state.hal_watch = None;
                }
                self.broadcast_state();
            }
            Err(e) => {
                debug!("Bus reconnect failed: {}", e);
                self.reconnect_at = Some(Instant::now() + self.options.reconnect_interval);
            }
        }
    }

    fn shutdown(&mut self) {
        self.phase = LifecyclePhase::ShuttingDown;
        info!("netmand shutting down...");

        let vpn = &self.state.collaborators.vpn;
        if let Some(active) = vpn.active_vpn() {
            info!(vpn = %active.name, "Deactivating VPN");
            vpn.deactivate_vpn(&active);
        }

        self.state.registry.shutdown_all();
        self.detach_discovery();

        self.state.dispatcher.cancel_pending();
        self.state.dispatcher.set_connection(None);
        self.bus_events = None;
        self.reconnect_at = None;

        self.phase = LifecyclePhase::Terminated;
        info!("netmand stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::bus::SignalMessage;
    use crate::collaborators::testing::Recorder;
    use crate::hotplug::hal::testing::FakeHal;
    use crate::names::{HAL_MANAGER_INTERFACE, HAL_MANAGER_PATH, NM_DEVICES_INTERFACE};
    use std::future::Future;

    fn options() -> DaemonOptions {
        DaemonOptions {
            enable_test_devices: false,
            reconnect_interval: Duration::from_millis(10),
        }
    }

    async fn until(what: &str, mut condition: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    /// Run the daemon while `driver` interacts with it; the driver ends by
    /// requesting shutdown.
    async fn drive<F, Fut>(daemon: &mut Daemon<MemoryBus>, driver: F) -> ExitStatus
    where
        F: FnOnce(MemoryBus, Notifier) -> Fut,
        Fut: Future<Output = ()>,
    {
        let bus = daemon.connector.clone();
        let notifier = daemon.notifier().unwrap();
        let (status, ()) = tokio::join!(daemon.run(), driver(bus, notifier));
        status
    }

    fn hal_signal(member: &str, body: Vec<Value>) -> SignalMessage {
        SignalMessage::new(
            &Endpoint::new(HAL_MANAGER_PATH, HAL_MANAGER_INTERFACE),
            member,
            body,
        )
        .with_sender(":1.50")
    }

    fn added_interfaces(bus: &MemoryBus) -> Vec<String> {
        bus.emitted()
            .into_iter()
            .filter(|s| s.member == "DeviceAdded")
            .filter_map(|s| s.body.get(1).and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_startup_with_hal_present() {
        let bus = MemoryBus::new();
        let hal = FakeHal::install(&bus);
        hal.add_net_device("/hal/net_eth0", "eth0", "net.80203");
        hal.add_net_device("/hal/net_wlan0", "wlan0", "net.80211");
        bus.set_owner(HAL_SERVICE, true);

        let recorder = Recorder::new();
        let mut daemon = Daemon::new(bus.clone(), recorder.collaborators(), options()).unwrap();

        let status = drive(&mut daemon, |bus, notifier| async move {
            until("startup broadcast", || bus.emitted_members().contains(&"StateChange".to_string())).await;
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        assert_eq!(daemon.phase(), LifecyclePhase::Terminated);
        assert_eq!(added_interfaces(&bus), vec!["eth0", "wlan0"]);
        assert_eq!(
            bus.emitted_members(),
            vec!["DeviceAdded", "DeviceAdded", "StateChange"]
        );
        let state = &bus.emitted()[2];
        assert_eq!(state.body, vec![Value::UInt32(4)]);
        assert_eq!(state.sender, crate::bus::memory::UNIQUE_NAME);

        // teardown released devices without announcing removals
        assert!(daemon.state().registry.is_empty());
        assert_eq!(recorder.count("stop eth0"), 1);
        assert!(bus.watched().is_empty());
    }

    #[tokio::test]
    async fn test_serves_in_running_phase_while_hal_absent() {
        let bus = MemoryBus::new();
        let hal = FakeHal::install(&bus);
        hal.add_net_device("/hal/net_eth0", "eth0", "net.80203");
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        daemon.start().await.unwrap();
        assert_eq!(daemon.phase(), LifecyclePhase::Running);
        assert!(daemon.waiting_for_discovery());

        bus.appear(HAL_SERVICE);
        let event = next_bus_event(&mut daemon.bus_events).await;
        daemon.on_bus_event(event).await;
        assert_eq!(daemon.phase(), LifecyclePhase::Running);
        assert!(!daemon.waiting_for_discovery());
        assert_eq!(daemon.state().registry.len(), 1);

        bus.vanish(HAL_SERVICE);
        let event = next_bus_event(&mut daemon.bus_events).await;
        daemon.on_bus_event(event).await;
        assert_eq!(daemon.phase(), LifecyclePhase::Running);
        assert!(daemon.waiting_for_discovery());
        assert!(bus.watched().is_empty());

        // a second appearance re-adds exactly one watch
        bus.appear(HAL_SERVICE);
        let event = next_bus_event(&mut daemon.bus_events).await;
        daemon.on_bus_event(event).await;
        assert_eq!(bus.watched(), vec![HAL_SERVICE.to_string()]);
        assert_eq!(daemon.state().registry.len(), 1);

        daemon.shutdown();
        assert_eq!(daemon.phase(), LifecyclePhase::Terminated);
    }

    #[tokio::test]
    async fn test_no_bus_is_fatal() {
        let bus = MemoryBus::new();
        bus.fail_connect(true);
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        assert_eq!(daemon.run().await, ExitStatus::FatalStartup);
        assert_eq!(daemon.phase(), LifecyclePhase::Terminated);
        assert_eq!(ExitStatus::FatalStartup.code(), 1);
    }

    #[tokio::test]
    async fn test_discovery_watch_failure_at_startup_is_fatal() {
        let bus = MemoryBus::new();
        FakeHal::install(&bus);
        bus.set_owner(HAL_SERVICE, true);
        bus.fail_watch(true);
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        assert_eq!(daemon.run().await, ExitStatus::FatalStartup);
    }

    #[tokio::test]
    async fn test_hal_appearing_later_enumerates_devices() {
        let bus = MemoryBus::new();
        let hal = FakeHal::install(&bus);
        hal.add_net_device("/hal/net_a", "eth0", "net.80203");
        hal.add_net_device("/hal/net_b", "eth1", "net.80203");

        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        let status = drive(&mut daemon, |bus, notifier| async move {
            until("bus link", || bus.is_linked()).await;
            until("startup broadcast", || !bus.emitted().is_empty()).await;
            assert!(added_interfaces(&bus).is_empty());

            bus.appear(HAL_SERVICE);
            until("enumeration", || added_interfaces(&bus).len() == 2).await;
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        assert_eq!(added_interfaces(&bus), vec!["eth0", "eth1"]);
    }

    #[tokio::test]
    async fn test_hotplug_signals_reach_registry() {
        let bus = MemoryBus::new();
        let hal = FakeHal::install(&bus);
        bus.set_owner(HAL_SERVICE, true);
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        let status = drive(&mut daemon, |bus, notifier| async move {
            until("startup broadcast", || !bus.emitted().is_empty()).await;

            hal.add_net_device("/hal/net_eth0", "eth0", "net.80203");
            bus.send_signal(hal_signal("DeviceAdded", vec![Value::str("/hal/net_eth0")]));
            until("device added", || added_interfaces(&bus) == vec!["eth0"]).await;

            bus.send_signal(hal_signal("DeviceRemoved", vec![Value::str("/hal/net_eth0")]));
            until("device removed", || bus.emitted_members().contains(&"DeviceRemoved".to_string()))
                .await;
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        let removed: Vec<_> = bus
            .emitted()
            .into_iter()
            .filter(|s| s.member == "DeviceRemoved")
            .collect();
        assert_eq!(
            removed[0].body,
            vec![
                Value::object_path("/org/freedesktop/NetworkManager/Devices/eth0"),
                Value::str("eth0")
            ]
        );
    }

    #[tokio::test]
    async fn test_hal_vanishing_keeps_devices() {
        let bus = MemoryBus::new();
        let hal = FakeHal::install(&bus);
        hal.add_net_device("/hal/net_eth0", "eth0", "net.80203");
        bus.set_owner(HAL_SERVICE, true);
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        let status = drive(&mut daemon, |bus, notifier| async move {
            until("startup broadcast", || bus.emitted_members().contains(&"StateChange".to_string())).await;

            bus.vanish(HAL_SERVICE);
            // With the watch gone this removal must be ignored
            bus.send_signal(hal_signal("DeviceRemoved", vec![Value::str("/hal/net_eth0")]));

            let reply = bus.call_method(NM_PATH, NM_INTERFACE, "getDevices", vec![]);
            let devices = reply.await.unwrap().unwrap();
            assert_eq!(
                devices,
                vec![Value::object_paths(["/org/freedesktop/NetworkManager/Devices/eth0"])]
            );

            let reply = bus.call_method(
                "/org/freedesktop/NetworkManager/Devices/eth0",
                NM_DEVICES_INTERFACE,
                "getType",
                vec![],
            );
            assert_eq!(reply.await.unwrap(), Ok(vec![Value::UInt32(1)]));
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        assert!(!bus.emitted_members().contains(&"DeviceRemoved".to_string()));
    }

    #[tokio::test]
    async fn test_info_service_hooks() {
        let bus = MemoryBus::new();
        let recorder = Recorder::new();
        let mut daemon = Daemon::new(bus.clone(), recorder.collaborators(), options()).unwrap();

        let seen = recorder.clone();
        let status = drive(&mut daemon, |bus, notifier| async move {
            until("bus link", || bus.is_linked()).await;
            bus.appear(NMI_SERVICE);
            until("info hooks", || seen.count("vpn-connections-update") == 1).await;
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        assert_eq!(recorder.count("allowed-ap-update"), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_bus_loss() {
        let bus = MemoryBus::new();
        let mut daemon = Daemon::new(bus.clone(), Recorder::new().collaborators(), options()).unwrap();

        let status = drive(&mut daemon, |bus, notifier| async move {
            until("bus link", || bus.is_linked()).await;
            bus.fail_connect(true);
            bus.disconnect();
            until("failed retry", || bus.connect_count() >= 2).await;
            bus.fail_connect(false);
            until("reconnect", || bus.is_linked()).await;
            notifier.notify().unwrap();
        })
        .await;

        assert_eq!(status, ExitStatus::Success);
        assert!(bus.connect_count() >= 3);
        // one state broadcast per successful connection
        let states = bus
            .emitted_members()
            .into_iter()
            .filter(|m| m == "StateChange")
            .count();
        assert_eq!(states, 2);
    }

    #[tokio::test]
    async fn test_repeated_termination_exits_once() {
        let bus = MemoryBus::new();
        let recorder = Recorder::new();
        recorder.set_active_vpn("office");
        let mut daemon = Daemon::new(bus.clone(), recorder.collaborators(), options()).unwrap();

        let notifier = daemon.notifier().unwrap();
        for _ in 0..3 {
            notifier.notify().unwrap();
        }

        assert_eq!(daemon.run().await, ExitStatus::Success);
        assert!(daemon.state().shutdown_requested());
        assert_eq!(daemon.phase(), LifecyclePhase::Terminated);
        assert_eq!(recorder.count("vpn-deactivate office"), 1);
    }
}
