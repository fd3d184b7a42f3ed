//! Simulated platform bus.
//!
//! Seeds an in-memory bus with the services the simulator talks to: the
//! settings service, the system aggregator with a starter voltage and relay
//! catalog, and the simulator's own service.

use dplus_core::{BusKind, MemoryBus, PlatformConfig};
use std::time::Duration;

/// Starter voltage the simulated system service reports.
pub const SEED_STARTER_VOLTAGE: f64 = 12.7;

/// `(channel, name, function)` of the seeded relays.
const SEED_RELAYS: [(&str, &str, &str); 3] = [
    ("4brelays/0", "Relay 1", "none"),
    ("4brelays/1", "Relay 2", "alarm"),
    ("digitaloutput/0", "MOSFET", "none"),
];

pub fn simulated_platform(platform: &PlatformConfig, own_bus: BusKind) -> MemoryBus {
    let bus = MemoryBus::with_timeout(Duration::from_millis(platform.bus_timeout_ms));

    bus.add_service(platform.settings_bus, &platform.settings_service);
    bus.add_service(own_bus, &platform.own_service);

    let system = &platform.system_service;
    bus.set_property(BusKind::System, system, &platform.product_name_path, "System");
    bus.set_property(BusKind::System, system, &platform.starter_voltage_path, SEED_STARTER_VOLTAGE);

    let relay_root = platform.relay_root.trim_end_matches('/');
    let relay_service = &platform.relay_service;
    bus.set_property(
        platform.relay_bus,
        relay_service,
        &format!("{}/Count", relay_root),
        SEED_RELAYS.len() as i64,
    );
    for (i, (channel, name, function)) in SEED_RELAYS.iter().enumerate() {
        let base = format!("{}/{}", relay_root, i);
        bus.set_property(platform.relay_bus, relay_service, &format!("{}/Channel", base), *channel);
        bus.set_property(platform.relay_bus, relay_service, &format!("{}/Name", base), *name);
        bus.set_property(platform.relay_bus, relay_service, &format!("{}/Function", base), *function);
        bus.set_property(platform.relay_bus, relay_service, &format!("{}/State", base), 0i64);
    }

    bus
}
