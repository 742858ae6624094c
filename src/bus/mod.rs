//! Message bus layer
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ SignalDispatcher                            │
//! │  subscriptions ── schema check ── handlers  │
//! │  emit() ─────────► local + BusConnection    │
//! │  call_and_validate() ─► BusConnection::call │
//! └──────────────────────┬──────────────────────┘
//!                        │ Arc<dyn BusConnection>
//!            ┌───────────┴───────────┐
//!            │ SystemBus (zbus)      │  BusEvent stream ──► daemon loop
//!            └───────────────────────┘
//! ```
//!
//! The transport is hidden behind [`BusConnection`] and [`BusConnector`] so
//! the daemon core runs unchanged against the system bus or the in-process
//! bus used by tests.

pub mod connection;
pub mod dispatch;
#[cfg(test)]
pub mod memory;
pub mod message;
pub mod system;
pub mod value;

pub use connection::{BusConnection, BusConnector, BusLink};
pub use dispatch::{
    is_foreign_error, Arg, Blob, CallError, FromArg, FromArgs, ObjectPath, SignalDispatcher,
    SubscriptionId,
};
pub use message::{
    BusError, BusEvent, Endpoint, IncomingCall, MethodError, MethodReply, SignalMessage,
};
pub use system::SystemBusConnector;
pub use value::{Signature, SignatureError, Value, ValueKind};
