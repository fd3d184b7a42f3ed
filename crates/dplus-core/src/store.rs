//! Platform bus abstraction.
//!
//! The control core talks to the platform only through [`BusClient`]:
//! enumerate service names, read a property, write a property, call a
//! method. The real transport lives outside this crate; [`MemoryBus`] is an
//! in-process implementation used by the simulated platform and by tests.

use crate::model::{BusKind, BusValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Errors returned by bus calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("service {service} not found on {bus} bus")]
    ServiceUnknown { bus: BusKind, service: String },

    #[error("object path {path} not found on {service}")]
    PathUnknown { service: String, path: String },

    #[error("bus call to {service}{path} timed out")]
    Timeout { service: String, path: String },

    #[error("{0} bus unreachable")]
    Unreachable(BusKind),

    #[error("{service}{path} rejected the call: {reason}")]
    Rejected {
        service: String,
        path: String,
        reason: String,
    },
}

impl BusError {
    /// True for failures that may clear up by themselves on the next tick.
    ///
    /// Unknown services and paths usually mean the topology changed and only
    /// a rediscovery helps.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Timeout { .. } | BusError::Unreachable(_) | BusError::Rejected { .. }
        )
    }
}

/// Message bus client.
///
/// All calls are synchronous and may block up to the client's call timeout.
pub trait BusClient: Send + Sync {
    /// List the service names currently registered on a bus.
    fn list_names(&self, bus: BusKind) -> Result<Vec<String>, BusError>;

    /// Read the value of an object path (`GetValue`).
    fn get_value(&self, bus: BusKind, service: &str, path: &str) -> Result<BusValue, BusError>;

    /// Write the value of an object path (`SetValue`).
    fn set_value(
        &self,
        bus: BusKind,
        service: &str,
        path: &str,
        value: BusValue,
    ) -> Result<(), BusError>;

    /// Call an arbitrary method on an object path.
    fn call_method(
        &self,
        bus: BusKind,
        service: &str,
        path: &str,
        method: &str,
        args: &[BusValue],
    ) -> Result<BusValue, BusError>;
}

/// A property write observed by [`MemoryBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct BusWrite {
    pub bus: BusKind,
    pub service: String,
    pub path: String,
    pub value: BusValue,
}

type ServiceKey = (BusKind, String);

/// Oldest writes are dropped beyond this many records.
pub const WRITE_LOG_LIMIT: usize = 4096;

#[derive(Debug, Default)]
struct MemoryBusState {
    services: HashMap<ServiceKey, BTreeMap<String, BusValue>>,
    unreachable: HashSet<BusKind>,
    latency: HashMap<ServiceKey, Duration>,
    rejected: HashSet<(BusKind, String, String)>,
    writes: Vec<BusWrite>,
}

/// In-memory bus.
///
/// Services are maps of object path to value. Failures can be injected per
/// bus (unreachable), per service (latency above the call timeout) and per
/// path (write rejection). Successful `SetValue` calls are recorded, up to
/// [`WRITE_LOG_LIMIT`] of the most recent ones.
#[derive(Debug)]
pub struct MemoryBus {
    state: RwLock<MemoryBusState>,
    call_timeout: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty bus with a 1s call timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(1))
    }

    pub fn with_timeout(call_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(MemoryBusState::default()),
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryBusState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryBusState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Platform setup
    // ========================================================================

    /// Register a service with no properties. Existing properties are kept.
    pub fn add_service(&self, bus: BusKind, service: &str) {
        self.write()
            .services
            .entry((bus, service.to_string()))
            .or_default();
    }

    pub fn remove_service(&self, bus: BusKind, service: &str) {
        self.write().services.remove(&(bus, service.to_string()));
    }

    /// Set a property directly, registering the service if needed.
    /// Not recorded as a write.
    pub fn set_property(&self, bus: BusKind, service: &str, path: &str, value: impl Into<BusValue>) {
        self.write()
            .services
            .entry((bus, service.to_string()))
            .or_default()
            .insert(path.to_string(), value.into());
    }

    pub fn remove_property(&self, bus: BusKind, service: &str, path: &str) {
        if let Some(props) = self.write().services.get_mut(&(bus, service.to_string())) {
            props.remove(path);
        }
    }

    /// Current value of a property, bypassing failure injection.
    pub fn property(&self, bus: BusKind, service: &str, path: &str) -> Option<BusValue> {
        self.read()
            .services
            .get(&(bus, service.to_string()))
            .and_then(|props| props.get(path).cloned())
    }

    /// All properties of a service under a path prefix.
    pub fn properties_under(&self, bus: BusKind, service: &str, prefix: &str) -> Vec<(String, BusValue)> {
        self.read()
            .services
            .get(&(bus, service.to_string()))
            .map(|props| {
                props
                    .iter()
                    .filter(|(path, _)| path.starts_with(prefix))
                    .map(|(path, value)| (path.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Failure injection
    // ========================================================================

    pub fn set_unreachable(&self, bus: BusKind, unreachable: bool) {
        let mut state = self.write();
        if unreachable {
            state.unreachable.insert(bus);
        } else {
            state.unreachable.remove(&bus);
        }
    }

    /// Simulated response latency of a service. Calls whose latency exceeds
    /// the call timeout fail with [`BusError::Timeout`].
    pub fn set_latency(&self, bus: BusKind, service: &str, latency: Duration) {
        self.write().latency.insert((bus, service.to_string()), latency);
    }

    pub fn clear_latency(&self, bus: BusKind, service: &str) {
        self.write().latency.remove(&(bus, service.to_string()));
    }

    pub fn reject_writes(&self, bus: BusKind, service: &str, path: &str, reject: bool) {
        let key = (bus, service.to_string(), path.to_string());
        let mut state = self.write();
        if reject {
            state.rejected.insert(key);
        } else {
            state.rejected.remove(&key);
        }
    }

    // ========================================================================
    // Write log
    // ========================================================================

    pub fn writes(&self) -> Vec<BusWrite> {
        self.read().writes.clone()
    }

    /// Writes to one path, oldest first.
    pub fn writes_to(&self, service: &str, path: &str) -> Vec<BusValue> {
        self.read()
            .writes
            .iter()
            .filter(|w| w.service == service && w.path == path)
            .map(|w| w.value.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write().writes.clear();
    }

    fn check_reachable(&self, state: &MemoryBusState, bus: BusKind, service: &str, path: &str) -> Result<(), BusError> {
        if state.unreachable.contains(&bus) {
            return Err(BusError::Unreachable(bus));
        }
        if let Some(latency) = state.latency.get(&(bus, service.to_string())) {
            if *latency > self.call_timeout {
                return Err(BusError::Timeout {
                    service: service.to_string(),
                    path: path.to_string(),
                });
            }
        }
        if !state.services.contains_key(&(bus, service.to_string())) {
            return Err(BusError::ServiceUnknown {
                bus,
                service: service.to_string(),
            });
        }
        Ok(())
    }
}

impl BusClient for MemoryBus {
    fn list_names(&self, bus: BusKind) -> Result<Vec<String>, BusError> {
        let state = self.read();
        if state.unreachable.contains(&bus) {
            return Err(BusError::Unreachable(bus));
        }
        let mut names: Vec<String> = state
            .services
            .keys()
            .filter(|(b, _)| *b == bus)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn get_value(&self, bus: BusKind, service: &str, path: &str) -> Result<BusValue, BusError> {
        let state = self.read();
        self.check_reachable(&state, bus, service, path)?;
        state
            .services
            .get(&(bus, service.to_string()))
            .and_then(|props| props.get(path).cloned())
            .ok_or_else(|| BusError::PathUnknown {
                service: service.to_string(),
                path: path.to_string(),
            })
    }

    fn set_value(
        &self,
        bus: BusKind,
        service: &str,
        path: &str,
        value: BusValue,
    ) -> Result<(), BusError> {
        let mut state = self.write();
        self.check_reachable(&state, bus, service, path)?;
        if state
            .rejected
            .contains(&(bus, service.to_string(), path.to_string()))
        {
            return Err(BusError::Rejected {
                service: service.to_string(),
                path: path.to_string(),
                reason: "write refused".to_string(),
            });
        }
        if let Some(props) = state.services.get_mut(&(bus, service.to_string())) {
            props.insert(path.to_string(), value.clone());
        }
        state.writes.push(BusWrite {
            bus,
            service: service.to_string(),
            path: path.to_string(),
            value,
        });
        if state.writes.len() > WRITE_LOG_LIMIT {
            let excess = state.writes.len() - WRITE_LOG_LIMIT;
            state.writes.drain(..excess);
        }
        Ok(())
    }

    fn call_method(
        &self,
        bus: BusKind,
        service: &str,
        path: &str,
        method: &str,
        args: &[BusValue],
    ) -> Result<BusValue, BusError> {
        match method {
            "GetValue" => self.get_value(bus, service, path),
            "SetValue" => {
                let value = args.first().cloned().unwrap_or_default();
                self.set_value(bus, service, path, value)?;
                Ok(BusValue::Int(0))
            }
            // Settings service registration: group, name, default, type, min, max
            "AddSetting" => {
                let (group, name) = match (args.first(), args.get(1)) {
                    (Some(BusValue::Text(group)), Some(BusValue::Text(name))) => (group, name),
                    _ => {
                        return Err(BusError::Rejected {
                            service: service.to_string(),
                            path: path.to_string(),
                            reason: "AddSetting expects group and name".to_string(),
                        })
                    }
                };
                let default = args.get(2).cloned().unwrap_or_default();
                let mut state = self.write();
                self.check_reachable(&state, bus, service, path)?;
                let setting_path = crate::path::join_object_path(
                    &crate::path::join_object_path("/Settings", group),
                    name,
                );
                if let Some(props) = state.services.get_mut(&(bus, service.to_string())) {
                    props.entry(setting_path).or_insert(default);
                }
                Ok(BusValue::Int(0))
            }
            _ => Err(BusError::Rejected {
                service: service.to_string(),
                path: path.to_string(),
                reason: format!("unknown method {}", method),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_names_per_bus() {
        let bus = MemoryBus::new();
        bus.add_service(BusKind::System, "com.victronenergy.system");
        bus.add_service(BusKind::Session, "com.victronenergy.battery.ttyO1");

        assert_eq!(
            bus.list_names(BusKind::System).unwrap(),
            vec!["com.victronenergy.system".to_string()]
        );
        assert_eq!(
            bus.list_names(BusKind::Session).unwrap(),
            vec!["com.victronenergy.battery.ttyO1".to_string()]
        );
    }

    #[test]
    fn test_get_value_errors() {
        let bus = MemoryBus::new();
        bus.set_property(BusKind::System, "com.victronenergy.system", "/Dc/1/Voltage", BusValue::Absent);

        assert_eq!(
            bus.get_value(BusKind::System, "com.victronenergy.system", "/Dc/1/Voltage"),
            Ok(BusValue::Absent)
        );
        assert!(matches!(
            bus.get_value(BusKind::System, "com.victronenergy.system", "/Nope"),
            Err(BusError::PathUnknown { .. })
        ));
        assert!(matches!(
            bus.get_value(BusKind::Session, "com.victronenergy.system", "/Dc/1/Voltage"),
            Err(BusError::ServiceUnknown { .. })
        ));
    }

    #[test]
    fn test_injected_failures() {
        let bus = MemoryBus::with_timeout(Duration::from_millis(100));
        bus.set_property(BusKind::System, "svc", "/A", 1i64);

        bus.set_latency(BusKind::System, "svc", Duration::from_millis(500));
        let err = bus.get_value(BusKind::System, "svc", "/A").unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
        assert!(err.is_transient());
        bus.clear_latency(BusKind::System, "svc");

        bus.reject_writes(BusKind::System, "svc", "/A", true);
        assert!(bus.set_value(BusKind::System, "svc", "/A", 2i64.into()).is_err());
        assert_eq!(bus.property(BusKind::System, "svc", "/A"), Some(BusValue::Int(1)));

        bus.set_unreachable(BusKind::System, true);
        assert_eq!(bus.list_names(BusKind::System), Err(BusError::Unreachable(BusKind::System)));
    }

    #[test]
    fn test_writes_are_recorded() {
        let bus = MemoryBus::new();
        bus.add_service(BusKind::System, "svc");
        bus.set_value(BusKind::System, "svc", "/Out", true.into()).unwrap();
        bus.call_method(BusKind::System, "svc", "/Out", "SetValue", &[false.into()])
            .unwrap();

        assert_eq!(
            bus.writes_to("svc", "/Out"),
            vec![BusValue::Bool(true), BusValue::Bool(false)]
        );
        assert_eq!(bus.property(BusKind::System, "svc", "/Out"), Some(BusValue::Bool(false)));
    }

    #[test]
    fn test_add_setting_keeps_existing_value() {
        let bus = MemoryBus::new();
        let settings = "com.victronenergy.settings";
        bus.set_property(BusKind::System, settings, "/Settings/Devices/DPlusSim/GpioPin", 22i64);

        for (name, default) in [("GpioPin", 17i64), ("IgnitionGpio", 4i64)] {
            bus.call_method(
                BusKind::System,
                settings,
                "/Settings",
                "AddSetting",
                &["Devices/DPlusSim".into(), name.into(), default.into(), "i".into()],
            )
            .unwrap();
        }

        assert_eq!(
            bus.property(BusKind::System, settings, "/Settings/Devices/DPlusSim/GpioPin"),
            Some(BusValue::Int(22))
        );
        assert_eq!(
            bus.property(BusKind::System, settings, "/Settings/Devices/DPlusSim/IgnitionGpio"),
            Some(BusValue::Int(4))
        );
    }
}
