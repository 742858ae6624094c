//! System bus transport over zbus

use super::connection::{BusConnection, BusConnector, BusLink};
use super::message::{
    BusError, BusEvent, IncomingCall, MethodError, MethodReply, SignalMessage,
};
use super::value::{Value, ValueKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use zbus::fdo::{self, RequestNameFlags, RequestNameReply};
use zbus::message::Type as MessageType;
use zbus::names::{BusName, WellKnownName};
use zbus::zvariant::{self, Structure, StructureBuilder, Value as ZValue};
use zbus::{Connection, MatchRule, Message, MessageStream};

const BUS_DAEMON: &str = "org.freedesktop.DBus";

fn transport(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

fn from_zbus(e: zbus::Error) -> BusError {
    match e {
        zbus::Error::MethodError(name, detail, _) => BusError::Remote {
            name: name.to_string(),
            message: detail.unwrap_or_default(),
        },
        other => transport(other),
    }
}

fn zsignature(kind: &ValueKind) -> Result<zvariant::Signature<'static>, BusError> {
    zvariant::Signature::try_from(kind.to_string()).map_err(transport)
}

fn to_zvalue(value: &Value) -> Result<ZValue<'static>, BusError> {
    Ok(match value {
        Value::Byte(v) => ZValue::U8(*v),
        Value::Bool(v) => ZValue::Bool(*v),
        Value::Int16(v) => ZValue::I16(*v),
        Value::UInt16(v) => ZValue::U16(*v),
        Value::Int32(v) => ZValue::I32(*v),
        Value::UInt32(v) => ZValue::U32(*v),
        Value::Int64(v) => ZValue::I64(*v),
        Value::UInt64(v) => ZValue::U64(*v),
        Value::Double(v) => ZValue::F64(*v),
        Value::Str(s) => ZValue::from(s.clone()),
        Value::ObjectPath(p) => {
            ZValue::ObjectPath(zvariant::ObjectPath::try_from(p.clone()).map_err(transport)?)
        }
        Value::Signature(s) => {
            ZValue::Signature(zvariant::Signature::try_from(s.clone()).map_err(transport)?)
        }
        Value::Variant(inner) => ZValue::Value(Box::new(to_zvalue(inner)?)),
        Value::Array(element, items) => {
            let mut array = zvariant::Array::new(zsignature(element)?);
            for item in items {
                array.append(to_zvalue(item)?).map_err(transport)?;
            }
            ZValue::Array(array)
        }
        Value::Struct(fields) => ZValue::Structure(structure(fields)?),
        Value::Dict(key, val, entries) => {
            let mut dict = zvariant::Dict::new(zsignature(key)?, zsignature(val)?);
            for (k, v) in entries {
                dict.append(to_zvalue(k)?, to_zvalue(v)?).map_err(transport)?;
            }
            ZValue::Dict(dict)
        }
    })
}

fn structure(fields: &[Value]) -> Result<Structure<'static>, BusError> {
    let builder = fields.iter().try_fold(StructureBuilder::new(), |builder, field| {
        Ok::<_, BusError>(builder.append_field(to_zvalue(field)?))
    })?;
    Ok(builder.build())
}

fn from_zvalue(value: &ZValue<'_>) -> Result<Value, BusError> {
    Ok(match value {
        ZValue::U8(v) => Value::Byte(*v),
        ZValue::Bool(v) => Value::Bool(*v),
        ZValue::I16(v) => Value::Int16(*v),
        ZValue::U16(v) => Value::UInt16(*v),
        ZValue::I32(v) => Value::Int32(*v),
        ZValue::U32(v) => Value::UInt32(*v),
        ZValue::I64(v) => Value::Int64(*v),
        ZValue::U64(v) => Value::UInt64(*v),
        ZValue::F64(v) => Value::Double(*v),
        ZValue::Str(s) => Value::Str(s.to_string()),
        ZValue::ObjectPath(p) => Value::ObjectPath(p.to_string()),
        ZValue::Signature(s) => Value::Signature(s.to_string()),
        ZValue::Value(inner) => Value::Variant(Box::new(from_zvalue(inner)?)),
        ZValue::Array(array) => {
            let element: ValueKind = array
                .element_signature()
                .as_str()
                .parse()
                .map_err(transport)?;
            let items = array.iter().map(from_zvalue).collect::<Result<_, _>>()?;
            Value::Array(element, items)
        }
        ZValue::Structure(s) => {
            Value::Struct(s.fields().iter().map(from_zvalue).collect::<Result<_, _>>()?)
        }
        ZValue::Dict(dict) => {
            let (key, value) = match dict.full_signature().as_str().parse().map_err(transport)? {
                ValueKind::Dict(key, value) => (*key, *value),
                other => return Err(BusError::InvalidArgs(format!("'{other}' is not a dictionary"))),
            };
            let entries = dict
                .iter()
                .map(|(k, v)| Ok((from_zvalue(k)?, from_zvalue(v)?)))
                .collect::<Result<_, BusError>>()?;
            Value::Dict(key, value, entries)
        }
        other => {
            return Err(BusError::InvalidArgs(format!(
                "unsupported value of type '{}'",
                other.value_signature()
            )))
        }
    })
}

/// Message body as a list of values, one per complete type in the body
/// signature. Only a missing or empty signature decodes to no values.
fn decode_body(msg: &Message) -> Result<Vec<Value>, BusError> {
    let body = msg.body();
    let signature = match body.signature() {
        Some(signature) if !signature.is_empty() => signature,
        _ => return Ok(Vec::new()),
    };

    // Always wrap: a body holding a single struct argument must not be read
    // as the argument list itself.
    let wrapped = format!("({})", signature.as_str());
    let (args, _): (Structure<'_>, usize) = body
        .data()
        .deserialize_for_dynamic_signature(wrapped)
        .map_err(transport)?;
    args.fields().iter().map(from_zvalue).collect()
}

fn owner(name: String) -> Option<String> {
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Connects to the system bus and claims `service_name`.
pub struct SystemBusConnector {
    service_name: String,
}

impl SystemBusConnector {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl BusConnector for SystemBusConnector {
    async fn connect(&self) -> Result<BusLink, BusError> {
        let conn = Connection::system().await.map_err(from_zbus)?;
        let stream = MessageStream::from(&conn);
        let dbus = fdo::DBusProxy::new(&conn).await.map_err(from_zbus)?;

        let name = WellKnownName::try_from(self.service_name.as_str())
            .map_err(|e| BusError::InvalidArgs(e.to_string()))?;
        match dbus
            .request_name(name, RequestNameFlags::DoNotQueue.into())
            .await
            .map_err(transport)?
        {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {}
            _ => {
                return Err(BusError::Transport(format!(
                    "could not acquire service name '{}', another instance may be running",
                    self.service_name
                )))
            }
        }

        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(BUS_DAEMON)
            .and_then(|b| b.interface(BUS_DAEMON))
            .and_then(|b| b.member("NameOwnerChanged"))
            .map_err(from_zbus)?
            .build();
        dbus.add_match_rule(rule).await.map_err(transport)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(conn.clone(), stream, events_tx));
        let emitter = tokio::spawn(emitter(conn.clone(), signals_rx));

        info!(
            service = %self.service_name,
            unique_name = ?conn.unique_name().map(|n| n.to_string()),
            "Connected to system bus"
        );

        Ok(BusLink {
            connection: std::sync::Arc::new(SystemBus {
                conn,
                dbus,
                signals: signals_tx,
                watches: Mutex::new(HashMap::new()),
                tasks: vec![pump, emitter],
            }),
            events: events_rx,
        })
    }
}

async fn pump(conn: Connection, mut stream: MessageStream, events: mpsc::UnboundedSender<BusEvent>) {
    while let Some(item) = stream.next().await {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Error reading from bus");
                continue;
            }
        };

        let event = match msg.message_type() {
            MessageType::Signal => signal_event(&msg),
            MessageType::MethodCall => method_call_event(&conn, msg),
            _ => None,
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                return;
            }
        }
    }

    debug!("Bus message stream ended");
    let _ = events.send(BusEvent::Disconnected);
}

fn signal_event(msg: &Message) -> Option<BusEvent> {
    let header = msg.header();
    let path = header.path()?.to_string();
    let interface = header.interface()?.to_string();
    let member = header.member()?.to_string();
    let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();

    if interface == BUS_DAEMON && member == "NameOwnerChanged" {
        let (name, old_owner, new_owner) = match msg.body().deserialize::<(String, String, String)>() {
            Ok(args) => args,
            Err(e) => {
                warn!(error = %e, "Malformed NameOwnerChanged signal");
                return None;
            }
        };
        return Some(BusEvent::NameOwnerChanged {
            name,
            old_owner: owner(old_owner),
            new_owner: owner(new_owner),
        });
    }

    match decode_body(msg) {
        Ok(body) => Some(BusEvent::Signal(SignalMessage {
            sender,
            path,
            interface,
            member,
            body,
        })),
        Err(e) => {
            warn!(sender = %sender, signal = %member, error = %e, "Could not decode signal body");
            None
        }
    }
}

fn method_call_event(conn: &Connection, msg: Message) -> Option<BusEvent> {
    let header = msg.header();
    let path = header.path().map(|p| p.to_string()).unwrap_or_default();
    let interface = header.interface().map(|i| i.to_string()).unwrap_or_default();
    let member = header.member().map(|m| m.to_string()).unwrap_or_default();
    let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();

    let (tx, rx) = oneshot::channel();
    let conn = conn.clone();

    let body = match decode_body(&msg) {
        Ok(body) => body,
        Err(e) => {
            let _ = tx.send(Err(MethodError::invalid_args(e.to_string())));
            tokio::spawn(async move { send_reply(&conn, &msg, rx.await).await });
            return None;
        }
    };

    tokio::spawn(async move { send_reply(&conn, &msg, rx.await).await });

    Some(BusEvent::MethodCall(IncomingCall {
        sender,
        path,
        interface,
        member,
        body,
        reply: tx,
    }))
}

async fn send_reply(
    conn: &Connection,
    call: &Message,
    reply: Result<MethodReply, oneshot::error::RecvError>,
) {
    let result = match reply {
        Ok(Ok(values)) if values.is_empty() => conn.reply(call, &()).await.map(drop),
        Ok(Ok(values)) => match structure(&values) {
            Ok(body) => conn.reply(call, &body).await.map(drop),
            Err(e) => reply_error(conn, call, MethodError::failed(e.to_string())).await,
        },
        Ok(Err(err)) => reply_error(conn, call, err).await,
        Err(_) => reply_error(conn, call, MethodError::failed("request was dropped")).await,
    };

    if let Err(e) = result {
        warn!(error = %e, "Failed to send method reply");
    }
}

async fn reply_error(conn: &Connection, call: &Message, err: MethodError) -> zbus::Result<()> {
    conn.reply_error(call, err.name.as_str(), &err.message)
        .await
        .map(drop)
}

async fn emitter(conn: Connection, mut signals: mpsc::UnboundedReceiver<SignalMessage>) {
    while let Some(signal) = signals.recv().await {
        let sent = if signal.body.is_empty() {
            conn.emit_signal(
                None::<BusName<'_>>,
                signal.path.as_str(),
                signal.interface.as_str(),
                signal.member.as_str(),
                &(),
            )
            .await
        } else {
            match structure(&signal.body) {
                Ok(body) => {
                    conn.emit_signal(
                        None::<BusName<'_>>,
                        signal.path.as_str(),
                        signal.interface.as_str(),
                        signal.member.as_str(),
                        &body,
                    )
                    .await
                }
                Err(e) => {
                    warn!(signal = %signal.member, error = %e, "Could not encode signal body");
                    continue;
                }
            }
        };

        if let Err(e) = sent {
            warn!(signal = %signal.member, error = %e, "Failed to emit signal");
        }
    }
}

/// A claimed connection to the system bus
pub struct SystemBus {
    conn: Connection,
    dbus: fdo::DBusProxy<'static>,
    signals: mpsc::UnboundedSender<SignalMessage>,
    /// Match rules added by `watch_service`, keyed by service name
    watches: Mutex<HashMap<String, MatchRule<'static>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SystemBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl BusConnection for SystemBus {
    async fn call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        trace!(destination, path, interface, method, "Calling remote method");
        let reply = if args.is_empty() {
            self.conn
                .call_method(Some(destination), path, Some(interface), method, &())
                .await
        } else {
            let body = structure(&args)?;
            self.conn
                .call_method(Some(destination), path, Some(interface), method, &body)
                .await
        };
        let reply = reply.map_err(from_zbus)?;

        decode_body(&reply)
    }

    fn emit(&self, signal: &SignalMessage) -> Result<(), BusError> {
        self.signals.send(signal.clone()).map_err(|_| BusError::Closed)
    }

    async fn name_has_owner(&self, name: &str) -> Result<bool, BusError> {
        let name = BusName::try_from(name).map_err(|e| BusError::InvalidArgs(e.to_string()))?;
        self.dbus.name_has_owner(name).await.map_err(transport)
    }

    async fn watch_service(&self, name: &str) -> Result<(), BusError> {
        let watching = self.watches.lock().map_err(transport)?.contains_key(name);
        if watching {
            trace!(service = name, "Already watching service");
            return Ok(());
        }

        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(name)
            .map_err(from_zbus)?
            .build()
            .into_owned();
        self.dbus
            .add_match_rule(rule.clone())
            .await
            .map_err(transport)?;
        self.watches
            .lock()
            .map_err(transport)?
            .insert(name.to_string(), rule);
        Ok(())
    }

    fn unwatch_service(&self, name: &str) {
        let rule = match self.watches.lock() {
            Ok(mut watches) => watches.remove(name),
            Err(_) => None,
        };
        let Some(rule) = rule else {
            return;
        };

        let dbus = self.dbus.clone();
        let service = name.to_string();
        tokio::spawn(async move {
            match dbus.remove_match_rule(rule).await {
                Ok(()) => debug!(service = %service, "Removed service match rule"),
                Err(e) => debug!(service = %service, error = %e, "Could not remove match rule"),
            }
        });
    }

    fn unique_name(&self) -> Option<String> {
        self.conn.unique_name().map(|n| n.to_string())
    }
}
