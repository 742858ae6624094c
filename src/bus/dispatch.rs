//! Signal dispatch
//!
//! Routes bus signals to subscribed handlers after checking the payload shape
//! against the subscription's schema, and owns the two outbound paths the core
//! uses: broadcast emission and validated request/reply calls.
//!
//! ```text
//!   SignalMessage ──► match (path, interface, member)
//!                        │
//!                        ├─ schema mismatch ──► warn + count, handler skipped
//!                        │
//!                        └─ decode body ──► handler(sender, &[Arg])
//! ```
//!
//! Handlers run synchronously on the loop thread. A handler may subscribe,
//! unsubscribe or emit from inside its own invocation; a signal that would
//! re-enter a handler which is already running is not delivered to it.

use super::connection::BusConnection;
use super::message::{BusError, Endpoint, SignalMessage};
use super::value::{Signature, Value, ValueKind};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub type SubscriptionId = u64;

/// Opaque byte payloads; never interpreted as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    /// `ay`
    Bytes(Vec<u8>),
    /// `aay`
    ByteArrays(Vec<Vec<u8>>),
}

/// A decoded signal argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Byte(u8),
    /// `n` and `i`
    Int(i32),
    /// `q` and `u`
    UInt(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// `s`, `o` and `g`
    Str(String),
    /// `as`
    StrList(Vec<String>),
    Blob(Blob),
    /// Containers without a dedicated form are passed through untouched
    Raw(Value),
}

impl Arg {
    pub fn decode(value: &Value) -> Arg {
        match value {
            Value::Bool(b) => Arg::Bool(*b),
            Value::Byte(b) => Arg::Byte(*b),
            Value::Int16(v) => Arg::Int(i32::from(*v)),
            Value::Int32(v) => Arg::Int(*v),
            Value::UInt16(v) => Arg::UInt(u32::from(*v)),
            Value::UInt32(v) => Arg::UInt(*v),
            Value::Int64(v) => Arg::Int64(*v),
            Value::UInt64(v) => Arg::UInt64(*v),
            Value::Double(v) => Arg::Double(*v),
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Arg::Str(s.clone()),
            Value::Array(ValueKind::Byte, _) => match value.as_byte_vec() {
                Some(bytes) => Arg::Blob(Blob::Bytes(bytes)),
                None => Arg::Raw(value.clone()),
            },
            Value::Array(kind, items) if kind.is_byte_array() => {
                let arrays: Option<Vec<Vec<u8>>> = items.iter().map(Value::as_byte_vec).collect();
                match arrays {
                    Some(arrays) => Arg::Blob(Blob::ByteArrays(arrays)),
                    None => Arg::Raw(value.clone()),
                }
            }
            Value::Array(ValueKind::String, _) => match value.as_string_vec() {
                Some(list) => Arg::StrList(list),
                None => Arg::Raw(value.clone()),
            },
            other => Arg::Raw(other.clone()),
        }
    }
}

/// A Rust type with a fixed bus kind that can be read back from an [`Arg`].
pub trait FromArg: Sized {
    fn kind() -> ValueKind;
    fn from_arg(arg: Arg) -> Option<Self>;
}

/// Object path argument, distinct from a plain string in the schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath(pub String);

macro_rules! impl_from_arg {
    ($ty:ty, $kind:expr, $variant:ident) => {
        impl FromArg for $ty {
            fn kind() -> ValueKind {
                $kind
            }

            fn from_arg(arg: Arg) -> Option<Self> {
                match arg {
                    Arg::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_from_arg!(bool, ValueKind::Boolean, Bool);
impl_from_arg!(u8, ValueKind::Byte, Byte);
impl_from_arg!(i32, ValueKind::Int32, Int);
impl_from_arg!(u32, ValueKind::UInt32, UInt);
impl_from_arg!(i64, ValueKind::Int64, Int64);
impl_from_arg!(u64, ValueKind::UInt64, UInt64);
impl_from_arg!(f64, ValueKind::Double, Double);
impl_from_arg!(String, ValueKind::String, Str);
impl_from_arg!(Vec<String>, ValueKind::array_of(ValueKind::String), StrList);

impl FromArg for ObjectPath {
    fn kind() -> ValueKind {
        ValueKind::ObjectPath
    }

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Str(s) => Some(ObjectPath(s)),
            _ => None,
        }
    }
}

impl FromArg for Vec<u8> {
    fn kind() -> ValueKind {
        ValueKind::array_of(ValueKind::Byte)
    }

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Blob(Blob::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

/// A tuple of [`FromArg`] types; supplies both the schema and the decoder for
/// typed subscriptions and calls.
pub trait FromArgs: Sized {
    fn signature() -> Signature;
    fn from_args(args: Vec<Arg>) -> Option<Self>;
}

macro_rules! impl_from_args {
    ($($name:ident),*) => {
        impl<$($name: FromArg),*> FromArgs for ($($name,)*) {
            fn signature() -> Signature {
                Signature::new(vec![$($name::kind()),*])
            }

            #[allow(unused_mut, unused_variables)]
            fn from_args(args: Vec<Arg>) -> Option<Self> {
                let expected = Self::signature().len();
                if args.len() != expected {
                    return None;
                }
                let mut args = args.into_iter();
                Some(($($name::from_arg(args.next()?)?,)*))
            }
        }
    };
}

impl_from_args!();
impl_from_args!(A);
impl_from_args!(A, B);
impl_from_args!(A, B, C);
impl_from_args!(A, B, C, D);

type Handler = Box<dyn FnMut(&str, &[Arg])>;

struct Subscription {
    id: SubscriptionId,
    endpoint: Endpoint,
    signal: String,
    schema: Option<Signature>,
    active: Cell<bool>,
    handler: RefCell<Handler>,
}

impl Subscription {
    fn matches(&self, msg: &SignalMessage) -> bool {
        self.active.get()
            && self.signal == msg.member
            && self.endpoint.path == msg.path
            && self.endpoint.interface == msg.interface
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("not connected to the bus")]
    NoConnection,

    #[error("call cancelled")]
    Cancelled,

    #[error("Method returned type '{actual}', but expected '{expected}'")]
    UnexpectedReplyShape {
        actual: Signature,
        expected: Signature,
    },
}

/// True only for a remote error reply carrying exactly `name`.
pub fn is_foreign_error(error: &CallError, name: &str) -> bool {
    match error {
        CallError::Bus(e) => e.remote_name() == Some(name),
        _ => false,
    }
}

#[derive(Default)]
pub struct SignalDispatcher {
    subscriptions: RefCell<Vec<Rc<Subscription>>>,
    next_id: Cell<SubscriptionId>,
    schema_mismatches: Cell<u64>,
    connection: RefCell<Option<Arc<dyn BusConnection>>>,
    cancel: RefCell<CancellationToken>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connection(&self, connection: Option<Arc<dyn BusConnection>>) {
        *self.connection.borrow_mut() = connection;
    }

    pub fn connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.connection.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_some()
    }

    /// Subscribe to `signal` on `endpoint`. Without a schema the handler is
    /// invoked with no arguments.
    pub fn subscribe<F>(
        &self,
        endpoint: Endpoint,
        signal: impl Into<String>,
        schema: Option<Signature>,
        handler: F,
    ) -> SubscriptionId
    where
        F: FnMut(&str, &[Arg]) + 'static,
    {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);

        let signal = signal.into();
        debug!(id, endpoint = %endpoint, signal = %signal, "Subscribed to signal");

        self.subscriptions.borrow_mut().push(Rc::new(Subscription {
            id,
            endpoint,
            signal,
            schema,
            active: Cell::new(true),
            handler: RefCell::new(Box::new(handler)),
        }));
        id
    }

    /// Subscribe with the schema and decoding taken from the tuple type `T`.
    pub fn subscribe_typed<T, F>(
        &self,
        endpoint: Endpoint,
        signal: impl Into<String>,
        mut handler: F,
    ) -> SubscriptionId
    where
        T: FromArgs + 'static,
        F: FnMut(&str, T) + 'static,
    {
        let signal = signal.into();
        let name = signal.clone();
        self.subscribe(endpoint, signal, Some(T::signature()), move |sender, args| {
            match T::from_args(args.to_vec()) {
                Some(decoded) => handler(sender, decoded),
                None => warn!(sender, signal = %name, "Could not decode signal arguments"),
            }
        })
    }

    /// Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        match subscriptions.iter().position(|s| s.id == id) {
            Some(index) => {
                let sub = subscriptions.remove(index);
                sub.active.set(false);
                debug!(id, signal = %sub.signal, "Unsubscribed from signal");
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    /// Number of signals dropped because their payload had the wrong shape
    pub fn schema_mismatches(&self) -> u64 {
        self.schema_mismatches.get()
    }

    /// Deliver a signal to every matching subscription. Returns how many
    /// handlers ran.
    pub fn dispatch(&self, msg: &SignalMessage) -> usize {
        let targets: Vec<Rc<Subscription>> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|s| s.matches(msg))
            .cloned()
            .collect();

        if targets.is_empty() {
            trace!(signal = %msg.member, path = %msg.path, "No subscribers for signal");
            return 0;
        }

        let mut delivered = 0;
        for sub in targets {
            // An earlier handler in this round may have unsubscribed it.
            if !sub.active.get() {
                continue;
            }

            let args = match &sub.schema {
                Some(expected) if !expected.matches(&msg.body) => {
                    let actual = Signature::of(&msg.body);
                    warn!(
                        sender = %msg.sender,
                        signal = %msg.member,
                        actual = %actual,
                        expected = %expected,
                        "Signal payload has unexpected shape, dropping"
                    );
                    self.schema_mismatches.set(self.schema_mismatches.get() + 1);
                    continue;
                }
                Some(_) => msg.body.iter().map(Arg::decode).collect(),
                None => Vec::new(),
            };

            let Ok(mut handler) = sub.handler.try_borrow_mut() else {
                debug!(id = sub.id, signal = %msg.member, "Handler already running, skipping");
                continue;
            };
            (*handler)(&msg.sender, &args);
            delivered += 1;
        }
        delivered
    }

    /// Broadcast a signal: local subscribers first, then the bus if connected.
    pub fn emit(&self, endpoint: &Endpoint, signal: &str, body: Vec<Value>) {
        let connection = self.connection();
        let sender = connection
            .as_ref()
            .and_then(|c| c.unique_name())
            .unwrap_or_default();
        let msg = SignalMessage::new(endpoint, signal, body).with_sender(sender);

        self.dispatch(&msg);

        if let Some(connection) = connection {
            if let Err(e) = connection.emit(&msg) {
                warn!(signal, error = %e, "Failed to emit signal on the bus");
            }
        }
    }

    /// Call a remote method and check the reply shape.
    pub async fn call_and_validate(
        &self,
        destination: &str,
        endpoint: &Endpoint,
        method: &str,
        args: Vec<Value>,
        expected: Option<&Signature>,
    ) -> Result<Vec<Value>, CallError> {
        let connection = self.connection().ok_or(CallError::NoConnection)?;
        let token = self.cancel.borrow().clone();

        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CallError::Cancelled),
            reply = connection.call(destination, &endpoint.path, &endpoint.interface, method, args) => reply?,
        };

        if let Some(expected) = expected {
            if !expected.matches(&reply) {
                let actual = Signature::of(&reply);
                warn!(
                    destination,
                    method,
                    actual = %actual,
                    expected = %expected,
                    "Method reply has unexpected shape"
                );
                return Err(CallError::UnexpectedReplyShape {
                    actual,
                    expected: expected.clone(),
                });
            }
        }
        Ok(reply)
    }

    /// [`call_and_validate`](Self::call_and_validate) with the reply decoded
    /// into the tuple type `T`.
    pub async fn call_typed<T: FromArgs>(
        &self,
        destination: &str,
        endpoint: &Endpoint,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, CallError> {
        let expected = T::signature();
        let reply = self
            .call_and_validate(destination, endpoint, method, args, Some(&expected))
            .await?;
        let actual = Signature::of(&reply);
        T::from_args(reply.iter().map(Arg::decode).collect())
            .ok_or(CallError::UnexpectedReplyShape { actual, expected })
    }

    /// Cancel every call currently awaiting a reply. Later calls are unaffected.
    pub fn cancel_pending(&self) {
        let previous = self.cancel.replace(CancellationToken::new());
        previous.cancel();
    }
}
