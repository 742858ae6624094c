//! Method surface served on the daemon's object paths
//!
//! Two tables, built once at startup: global methods on
//! `/org/freedesktop/NetworkManager` and per-device methods on
//! `/org/freedesktop/NetworkManager/Devices/<iface>`.

use super::state::DaemonState;
use crate::bus::{Arg, FromArgs, IncomingCall, MethodError, MethodReply, ObjectPath, Signature, Value};
use crate::device::{Device, MediumKind, RegistryError};
use crate::names::{NM_DEVICES_INTERFACE, NM_DEVICES_PATH, NM_INTERFACE, NM_PATH};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
enum GlobalMethod {
    GetDevices,
    GetActiveDevice,
    State,
    CreateTestDevice,
    RemoveTestDevice,
}

#[derive(Debug, Clone, Copy)]
enum DeviceMethod {
    GetName,
    GetHalUdi,
    GetType,
    GetDriver,
    IsActive,
}

pub struct MethodTables {
    global: HashMap<&'static str, GlobalMethod>,
    device: HashMap<&'static str, DeviceMethod>,
}

impl Default for MethodTables {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_args<T: FromArgs>(body: &[Value]) -> Result<T, MethodError> {
    let expected = T::signature();
    let mismatch = || {
        MethodError::invalid_args(format!(
            "Expected arguments {expected}, got {}",
            Signature::of(body)
        ))
    };
    if !expected.matches(body) {
        return Err(mismatch());
    }
    T::from_args(body.iter().map(Arg::decode).collect()).ok_or_else(mismatch)
}

/// An interface-less call is matched by path alone.
fn interface_matches(call: &IncomingCall, interface: &str) -> bool {
    call.interface.is_empty() || call.interface == interface
}

impl MethodTables {
    pub fn new() -> Self {
        let global = HashMap::from([
            ("getDevices", GlobalMethod::GetDevices),
            ("getActiveDevice", GlobalMethod::GetActiveDevice),
            ("state", GlobalMethod::State),
            ("createTestDevice", GlobalMethod::CreateTestDevice),
            ("removeTestDevice", GlobalMethod::RemoveTestDevice),
        ]);
        let device = HashMap::from([
            ("getName", DeviceMethod::GetName),
            ("getHalUdi", DeviceMethod::GetHalUdi),
            ("getType", DeviceMethod::GetType),
            ("getDriver", DeviceMethod::GetDriver),
            ("isActive", DeviceMethod::IsActive),
        ]);
        Self { global, device }
    }

    pub fn invoke(&self, state: &mut DaemonState, call: &IncomingCall) -> MethodReply {
        debug!(sender = %call.sender, path = %call.path, member = %call.member, "Method call");

        if call.path == NM_PATH && interface_matches(call, NM_INTERFACE) {
            let method = self
                .global
                .get(call.member.as_str())
                .ok_or_else(|| MethodError::unknown_method(NM_INTERFACE, &call.member))?;
            return self.invoke_global(*method, state, &call.body);
        }

        let is_device_path = call
            .path
            .strip_prefix(NM_DEVICES_PATH)
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
        if is_device_path && interface_matches(call, NM_DEVICES_INTERFACE) {
            let method = self
                .device
                .get(call.member.as_str())
                .ok_or_else(|| MethodError::unknown_method(NM_DEVICES_INTERFACE, &call.member))?;
            let device = state
                .registry
                .find_by_object_path(&call.path)
                .ok_or_else(|| MethodError::device_not_found(&call.path))?;
            return Ok(Self::invoke_device(*method, device));
        }

        Err(MethodError::unknown_method(&call.interface, &call.member))
    }

    fn invoke_global(
        &self,
        method: GlobalMethod,
        state: &mut DaemonState,
        body: &[Value],
    ) -> MethodReply {
        match method {
            GlobalMethod::GetDevices => {
                let paths: Vec<String> = state.registry.iter().map(Device::object_path).collect();
                Ok(vec![Value::object_paths(paths)])
            }
            GlobalMethod::GetActiveDevice => state
                .registry
                .active_device()
                .map(|d| vec![Value::ObjectPath(d.object_path())])
                .ok_or_else(MethodError::no_active_device),
            GlobalMethod::State => Ok(vec![Value::UInt32(state.network_state().code())]),
            GlobalMethod::CreateTestDevice => {
                let (interface, type_code): (String, u32) = parse_args(body)?;
                let medium = MediumKind::from_type_code(type_code);
                match state.registry.create_test_device(&interface, medium) {
                    Ok(handle) => {
                        let path = state
                            .registry
                            .get(handle)
                            .map(Device::object_path)
                            .unwrap_or_default();
                        Ok(vec![Value::ObjectPath(path)])
                    }
                    Err(RegistryError::TestDevicesDisabled) => {
                        Err(MethodError::test_devices_disabled())
                    }
                    Err(e) => Err(MethodError::invalid_args(e.to_string())),
                }
            }
            GlobalMethod::RemoveTestDevice => {
                let (ObjectPath(path),): (ObjectPath,) = parse_args(body)?;
                if !state.registry.test_devices_enabled() {
                    return Err(MethodError::test_devices_disabled());
                }
                let device = state
                    .registry
                    .find_by_object_path(&path)
                    .ok_or_else(|| MethodError::device_not_found(&path))?;
                if !device.test_device {
                    return Err(MethodError::invalid_args(format!(
                        "{path} is not a test device"
                    )));
                }
                let handle = device.handle;
                state.registry.remove_device(handle);
                info!(path = %path, "Removed test device");
                Ok(Vec::new())
            }
        }
    }

    fn invoke_device(method: DeviceMethod, device: &Device) -> Vec<Value> {
        let value = match method {
            DeviceMethod::GetName => Value::str(device.interface.clone()),
            DeviceMethod::GetHalUdi => Value::str(device.hardware_id.clone()),
            DeviceMethod::GetType => Value::UInt32(device.medium.type_code()),
            DeviceMethod::GetDriver => Value::str(device.driver.clone().unwrap_or_default()),
            DeviceMethod::IsActive => Value::Bool(device.is_active()),
        };
        vec![value]
    }
}
