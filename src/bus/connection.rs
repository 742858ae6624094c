use super::message::{BusError, BusEvent, SignalMessage};
use super::value::Value;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A live connection to the message bus.
///
/// Calls are async; emission is fire-and-forget and queued by the transport.
/// Inbound traffic (signals, owner changes, method calls) arrives on the
/// event receiver returned alongside the connection in [`BusLink`].
#[async_trait]
pub trait BusConnection: Send + Sync {
    async fn call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError>;

    fn emit(&self, signal: &SignalMessage) -> Result<(), BusError>;

    async fn name_has_owner(&self, name: &str) -> Result<bool, BusError>;

    /// Route signals emitted by `name` to this connection.
    async fn watch_service(&self, name: &str) -> Result<(), BusError>;

    /// Stop routing signals from `name`. Does nothing if it was not watched.
    fn unwatch_service(&self, name: &str);

    fn unique_name(&self) -> Option<String>;
}

pub struct BusLink {
    pub connection: Arc<dyn BusConnection>,
    pub events: mpsc::UnboundedReceiver<BusEvent>,
}

/// Establishes a connection and claims the daemon's well-known name.
#[async_trait]
pub trait BusConnector {
    async fn connect(&self) -> Result<BusLink, BusError>;
}
