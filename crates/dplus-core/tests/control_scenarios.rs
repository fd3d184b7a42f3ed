//! End-to-end control scenarios through [`ControlContext`] against the
//! in-memory bus and simulated GPIO.

use std::time::{Duration, Instant};

use dplus_core::{
    BusKind, BusValue, ControlContext, MemoryBus, MemoryConfigStorage, OutputTarget, PlatformConfig,
    SettingOutcome, SimulatedGpio, SimulatorConfig, SourceState,
};
use pretty_assertions::assert_eq;

const SYSTEM: &str = "com.victronenergy.system";

struct Rig {
    bus: MemoryBus,
    gpio: SimulatedGpio,
    storage: MemoryConfigStorage,
    ctx: ControlContext,
    start: Instant,
}

impl Rig {
    fn new(relays: &[(&str, &str, &str)], config: SimulatorConfig) -> Self {
        let bus = MemoryBus::new();
        bus.add_service(BusKind::System, "com.victronenergy.settings");
        bus.set_property(BusKind::System, SYSTEM, "/Relays/Count", relays.len() as i64);
        for (i, (channel, name, tag)) in relays.iter().enumerate() {
            bus.set_property(BusKind::System, SYSTEM, &format!("/Relays/{}/Channel", i), *channel);
            bus.set_property(BusKind::System, SYSTEM, &format!("/Relays/{}/Name", i), *name);
            bus.set_property(BusKind::System, SYSTEM, &format!("/Relays/{}/Function", i), *tag);
            bus.set_property(BusKind::System, SYSTEM, &format!("/Relays/{}/State", i), 0i64);
        }

        let ctx = ControlContext::new(PlatformConfig::default(), config).unwrap();
        Self {
            bus,
            gpio: SimulatedGpio::new(),
            storage: MemoryConfigStorage::new(),
            ctx,
            start: Instant::now(),
        }
    }

    fn with_starter(self, voltage: f64) -> Self {
        self.set_voltage(voltage);
        self
    }

    fn set_voltage(&self, voltage: f64) {
        self.bus.set_property(BusKind::System, SYSTEM, "/Dc/1/Voltage", voltage);
    }

    fn discover(&mut self) {
        let _ = self.ctx.refresh_relay_catalog(&self.bus);
        let _ = self.ctx.resolve_voltage_source(&self.bus, &self.storage);
    }

    fn tick_at(&mut self, seconds: f64) -> bool {
        let now = self.start + Duration::from_secs_f64(seconds);
        let report = self.ctx.tick(&self.bus, &self.gpio, now);
        self.assert_single_asserted_target();
        report.output
    }

    fn setting(&mut self, key: &str, value: impl Into<BusValue>) {
        let outcome = self.ctx.on_setting_changed(key, &value.into(), &self.storage);
        assert!(matches!(outcome, SettingOutcome::Staged { .. }), "{key}: {outcome:?}");
    }

    fn tag(&self, index: usize) -> BusValue {
        self.bus
            .property(BusKind::System, SYSTEM, &format!("/Relays/{}/Function", index))
            .unwrap()
    }

    fn relay_state(&self, index: usize) -> Option<i64> {
        self.bus
            .property(BusKind::System, SYSTEM, &format!("/Relays/{}/State", index))
            .and_then(|v| v.as_i64())
    }

    fn assert_single_asserted_target(&self) {
        let relay_count = self
            .bus
            .property(BusKind::System, SYSTEM, "/Relays/Count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as usize;
        let relays_on = (0..relay_count).filter(|i| self.relay_state(*i) == Some(1)).count();
        let gpio_on = self.gpio.asserted_outputs().len();
        assert!(relays_on + gpio_on <= 1, "{relays_on} relays and {gpio_on} pins asserted");
    }
}

fn example_thresholds() -> SimulatorConfig {
    SimulatorConfig {
        on_voltage: Some(12.6),
        off_voltage: Some(12.2),
        on_delay_seconds: 2.0,
        off_delay_seconds: 5.0,
        ..Default::default()
    }
}

#[test]
fn test_delay_example_timeline() {
    let mut rig = Rig::new(&[], example_thresholds()).with_starter(12.7);
    rig.discover();

    assert!(!rig.tick_at(0.0));
    assert!(!rig.tick_at(1.9));
    rig.set_voltage(12.0);
    assert!(!rig.tick_at(1.95));

    rig.set_voltage(12.7);
    assert!(!rig.tick_at(3.0));
    assert!(rig.tick_at(5.1));

    rig.set_voltage(12.1);
    assert!(rig.tick_at(6.0));
    assert!(rig.tick_at(10.9));
    assert!(!rig.tick_at(11.1));
    assert_eq!(rig.gpio.level(17), Some(false));
}

#[test]
fn test_force_off_wins_within_one_tick() {
    let mut config = example_thresholds();
    config.force_on = true;
    let mut rig = Rig::new(&[], config).with_starter(13.2);
    rig.discover();
    assert!(rig.tick_at(0.0));

    rig.setting("forceOff", true);
    assert!(!rig.tick_at(0.25));
    assert_eq!(rig.gpio.level(17), Some(false));
}

#[test]
fn test_force_on_requires_live_source() {
    let mut config = SimulatorConfig::default();
    config.force_on = true;
    let mut rig = Rig::new(&[], config);
    rig.discover();

    for step in 0..20 {
        assert!(!rig.tick_at(step as f64 * 0.25));
    }
    let status = rig.ctx.status();
    assert_eq!(status.voltage_source.state, SourceState::ScanFailed);
    assert!(!status.force_mode.active_on);

    // The source appearing later is picked up by the next discovery pass
    rig.set_voltage(11.0);
    rig.discover();
    assert!(rig.tick_at(5.0));
}

#[test]
fn test_relay_reassignment_restores_previous_channel() {
    let mut rig = Rig::new(
        &[("4brelays/0", "Pump", "alarm"), ("4brelays/1", "Light", "manual")],
        SimulatorConfig {
            force_on: true,
            ..Default::default()
        },
    )
    .with_starter(12.8);
    rig.discover();

    rig.setting("outputMode", "relay");
    rig.setting("relayChannel", "Relays/4brelays/0");
    assert!(rig.tick_at(0.0));
    assert_eq!(rig.ctx.arbiter().target(), &OutputTarget::Relay("4brelays/0".to_string()));
    assert_eq!(rig.tag(0), BusValue::from("dplus"));
    assert_eq!(rig.tag(1), BusValue::from("manual"));
    assert_eq!(rig.relay_state(0), Some(1));

    rig.setting("relayChannel", "4brelays/1");
    assert!(rig.tick_at(0.25));
    assert_eq!(rig.tag(0), BusValue::from("alarm"));
    assert_eq!(rig.tag(1), BusValue::from("dplus"));
    assert_eq!(rig.relay_state(0), Some(0));
    assert_eq!(rig.relay_state(1), Some(1));
}

#[test]
fn test_relay_gpio_relay_round_trip_restores_tags() {
    let mut rig = Rig::new(
        &[("4brelays/0", "Pump", "alarm"), ("mosfet/0", "MOSFET output", "genset")],
        SimulatorConfig {
            force_on: true,
            ..Default::default()
        },
    )
    .with_starter(12.8);
    rig.discover();

    rig.setting("outputMode", "relay");
    rig.setting("relayChannel", "4brelays/0");
    assert!(rig.tick_at(0.0));
    assert_eq!(rig.tag(0), BusValue::from("dplus"));
    assert_eq!(rig.tag(1), BusValue::from("genset"));

    rig.setting("outputMode", "gpio");
    assert!(rig.tick_at(0.25));
    assert_eq!(rig.ctx.arbiter().target(), &OutputTarget::Gpio);
    assert_eq!(rig.tag(0), BusValue::from("alarm"));
    assert_eq!(rig.tag(1), BusValue::from("dplus"));
    assert_eq!(rig.relay_state(0), Some(0));
    assert_eq!(rig.gpio.level(17), Some(true));

    rig.setting("outputMode", "relay");
    assert!(rig.tick_at(0.5));
    assert_eq!(rig.tag(0), BusValue::from("dplus"));
    assert_eq!(rig.tag(1), BusValue::from("genset"));
    assert_eq!(rig.gpio.level(17), None);

    rig.ctx.shutdown(&rig.bus, &rig.gpio);
    assert_eq!(rig.tag(0), BusValue::from("alarm"));
    assert_eq!(rig.tag(1), BusValue::from("genset"));
    assert_eq!(rig.relay_state(0), Some(0));
}

#[test]
fn test_missing_relay_channel_falls_back_to_gpio() {
    let mut rig = Rig::new(
        &[("4brelays/0", "Pump", "alarm")],
        SimulatorConfig {
            force_on: true,
            ..Default::default()
        },
    )
    .with_starter(12.8);
    rig.discover();

    rig.setting("outputMode", 1i64);
    rig.setting("relayChannel", "4brelays/7");
    assert!(rig.tick_at(0.0));
    assert_eq!(rig.ctx.arbiter().target(), &OutputTarget::Gpio);
    assert_eq!(rig.tag(0), BusValue::from("alarm"));
    assert_eq!(rig.gpio.level(17), Some(true));
}

#[test]
fn test_rejected_relay_write_is_retried() {
    let mut rig = Rig::new(
        &[("4brelays/0", "Pump", "alarm")],
        SimulatorConfig {
            force_on: true,
            ..Default::default()
        },
    )
    .with_starter(12.8);
    rig.discover();
    rig.bus.reject_writes(BusKind::System, SYSTEM, "/Relays/0/State", true);

    rig.setting("outputMode", "relay");
    rig.setting("relayChannel", "4brelays/0");
    rig.tick_at(0.0);
    assert_eq!(rig.ctx.arbiter().asserted(), None);
    assert_eq!(rig.relay_state(0), Some(0));

    rig.bus.reject_writes(BusKind::System, SYSTEM, "/Relays/0/State", false);
    rig.tick_at(0.25);
    assert_eq!(rig.ctx.arbiter().asserted(), Some(true));
    assert_eq!(rig.relay_state(0), Some(1));
}

#[test]
fn test_lost_source_turns_output_off_after_delay() {
    let mut rig = Rig::new(&[], example_thresholds()).with_starter(12.9);
    rig.discover();
    rig.tick_at(0.0);
    assert!(rig.tick_at(2.5));

    rig.bus.remove_property(BusKind::System, SYSTEM, "/Dc/1/Voltage");
    assert!(rig.tick_at(3.0));
    assert!(!rig.ctx.status().voltage_source.available);
    assert!(!rig.tick_at(8.5));
}
