//! In-process bus used by tests in place of the system bus.

use super::connection::{BusConnection, BusConnector, BusLink};
use super::message::{error_names, BusError, BusEvent, IncomingCall, MethodReply, SignalMessage};
use super::value::Value;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

pub const UNIQUE_NAME: &str = ":1.1";

/// A method call as seen by a [`MemoryBus`] call handler
#[derive(Debug, Clone)]
pub struct MemoryCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
}

type CallHandler = Box<dyn Fn(&MemoryCall) -> Result<Vec<Value>, BusError> + Send>;

#[derive(Default)]
struct Inner {
    handlers: HashMap<(String, String), CallHandler>,
    owners: HashSet<String>,
    watched: Vec<String>,
    emitted: Vec<SignalMessage>,
    calls: Vec<MemoryCall>,
    events: Option<mpsc::UnboundedSender<BusEvent>>,
    connects: usize,
    fail_connect: bool,
    fail_watch: bool,
    hang_calls: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn connection(&self) -> Arc<dyn BusConnection> {
        Arc::new(self.clone())
    }

    pub fn on_call<F>(&self, destination: &str, method: &str, handler: F)
    where
        F: Fn(&MemoryCall) -> Result<Vec<Value>, BusError> + Send + 'static,
    {
        self.lock()
            .handlers
            .insert((destination.to_string(), method.to_string()), Box::new(handler));
    }

    pub fn hang_calls(&self, hang: bool) {
        self.lock().hang_calls = hang;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_watch(&self, fail: bool) {
        self.lock().fail_watch = fail;
    }

    pub fn set_owner(&self, name: &str, owned: bool) {
        let mut inner = self.lock();
        if owned {
            inner.owners.insert(name.to_string());
        } else {
            inner.owners.remove(name);
        }
    }

    pub fn emitted(&self) -> Vec<SignalMessage> {
        self.lock().emitted.clone()
    }

    pub fn emitted_members(&self) -> Vec<String> {
        self.lock().emitted.iter().map(|s| s.member.clone()).collect()
    }

    pub fn calls(&self) -> Vec<MemoryCall> {
        self.lock().calls.clone()
    }

    pub fn watched(&self) -> Vec<String> {
        self.lock().watched.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// True while a connected daemon holds the event stream.
    pub fn is_linked(&self) -> bool {
        self.lock().events.is_some()
    }

    pub fn send_event(&self, event: BusEvent) -> bool {
        match &self.lock().events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn send_signal(&self, signal: SignalMessage) -> bool {
        self.send_event(BusEvent::Signal(signal))
    }

    /// Mark `name` as owned and announce it.
    pub fn appear(&self, name: &str) -> bool {
        self.set_owner(name, true);
        self.send_event(BusEvent::NameOwnerChanged {
            name: name.to_string(),
            old_owner: None,
            new_owner: Some(":1.50".to_string()),
        })
    }

    /// Mark `name` as unowned and announce it.
    pub fn vanish(&self, name: &str) -> bool {
        self.set_owner(name, false);
        self.send_event(BusEvent::NameOwnerChanged {
            name: name.to_string(),
            old_owner: Some(":1.50".to_string()),
            new_owner: None,
        })
    }

    /// Drop the link as a bus daemon restart would.
    pub fn disconnect(&self) -> bool {
        let sent = self.send_event(BusEvent::Disconnected);
        self.lock().events = None;
        sent
    }

    pub fn call_method(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> oneshot::Receiver<MethodReply> {
        let (tx, rx) = oneshot::channel();
        self.send_event(BusEvent::MethodCall(IncomingCall {
            sender: ":1.99".to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            body,
            reply: tx,
        }));
        rx
    }
}

#[async_trait]
impl BusConnection for MemoryBus {
    async fn call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        let call = MemoryCall {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            args,
        };

        let result = {
            let mut inner = self.lock();
            inner.calls.push(call.clone());
            if inner.hang_calls {
                None
            } else {
                Some(
                    match inner
                        .handlers
                        .get(&(destination.to_string(), method.to_string()))
                    {
                        Some(handler) => handler(&call),
                        None => Err(BusError::Remote {
                            name: error_names::UNKNOWN_METHOD.to_string(),
                            message: format!("no handler for {destination} {method}"),
                        }),
                    },
                )
            }
        };

        match result {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn emit(&self, signal: &SignalMessage) -> Result<(), BusError> {
        self.lock().emitted.push(signal.clone());
        Ok(())
    }

    async fn name_has_owner(&self, name: &str) -> Result<bool, BusError> {
        Ok(self.lock().owners.contains(name))
    }

    async fn watch_service(&self, name: &str) -> Result<(), BusError> {
        let mut inner = self.lock();
        if inner.fail_watch {
            return Err(BusError::Transport(format!("cannot add match rule for {name}")));
        }
        if !inner.watched.iter().any(|w| w == name) {
            inner.watched.push(name.to_string());
        }
        Ok(())
    }

    fn unwatch_service(&self, name: &str) {
        self.lock().watched.retain(|w| w != name);
    }

    fn unique_name(&self) -> Option<String> {
        Some(UNIQUE_NAME.to_string())
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<BusLink, BusError> {
        let mut inner = self.lock();
        inner.connects += 1;
        if inner.fail_connect {
            return Err(BusError::Transport("no system bus".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);
        drop(inner);

        Ok(BusLink {
            connection: self.connection(),
            events: rx,
        })
    }
}
