//! Messages exchanged with the bus transport

use super::value::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;

/// Well-known error names used in method replies
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NO_ACTIVE_DEVICE: &str = "org.freedesktop.NetworkManager.NoActiveDevice";
    pub const DEVICE_NOT_FOUND: &str = "org.freedesktop.NetworkManager.DeviceNotFound";
    pub const TEST_DEVICES_DISABLED: &str =
        "org.freedesktop.NetworkManager.TestDevicesNotEnabled";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

/// A path + interface pair that signals and methods are addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub path: String,
    pub interface: String,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.interface)
    }
}

/// A signal, either received from the bus or emitted locally
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    /// Unique bus name of the emitter, empty for local emissions
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Value>,
}

impl SignalMessage {
    pub fn new(endpoint: &Endpoint, member: impl Into<String>, body: Vec<Value>) -> Self {
        Self {
            sender: String::new(),
            path: endpoint.path.clone(),
            interface: endpoint.interface.clone(),
            member: member.into(),
            body,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }
}

/// Error reply to a method call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    pub name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unknown_method(interface: &str, member: &str) -> Self {
        Self::new(
            error_names::UNKNOWN_METHOD,
            format!("Method {member} on interface {interface} does not exist"),
        )
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(error_names::INVALID_ARGS, message)
    }

    pub fn no_active_device() -> Self {
        Self::new(error_names::NO_ACTIVE_DEVICE, "There is no active device.")
    }

    pub fn device_not_found(path: &str) -> Self {
        Self::new(
            error_names::DEVICE_NOT_FOUND,
            format!("The requested network device {path} does not exist."),
        )
    }

    pub fn test_devices_disabled() -> Self {
        Self::new(
            error_names::TEST_DEVICES_DISABLED,
            "Test devices were not enabled on the command line.",
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(error_names::FAILED, message)
    }
}

pub type MethodReply = Result<Vec<Value>, MethodError>;

/// A method call addressed to this daemon, with its reply channel
#[derive(Debug)]
pub struct IncomingCall {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Value>,
    pub reply: oneshot::Sender<MethodReply>,
}

impl IncomingCall {
    pub fn respond(self, reply: MethodReply) {
        // Caller may have gone away; nothing to do then.
        let _ = self.reply.send(reply);
    }
}

/// Everything the transport hands to the event loop
#[derive(Debug)]
pub enum BusEvent {
    Signal(SignalMessage),
    /// `None` owner means the name is not owned
    NameOwnerChanged {
        name: String,
        old_owner: Option<String>,
        new_owner: Option<String>,
    },
    MethodCall(IncomingCall),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("bus connection closed")]
    Closed,

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

impl BusError {
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            BusError::Remote { name, .. } => Some(name),
            _ => None,
        }
    }
}
