//! Simulator service loop.
//!
//! This module provides the tokio task that drives the control core:
//! - Periodic control ticks (sample, decide, arbitrate, write)
//! - Relay topology polling and voltage source rediscovery
//! - Settings store polling with the resolved-field guard
//! - Status publication on the bus and to subscribers
//! - Service requests with replies

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use dplus_core::config::{clamp_interval, SETTING_DEFINITIONS};
use dplus_core::{
    BusClient, BusError, BusKind, BusValue, ConfigError, ConfigStorage, ControlContext, GpioDriver,
    PlatformConfig, SimulatorConfig,
};
use dplus_protocol::{
    settings_from_json, settings_to_json, Notification, ServiceCall, ServiceRequest, ServiceResponse,
};

use crate::debug::DebugGate;
use crate::error::ServiceError;

/// Configuration for the simulator service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Control tick period.
    pub tick_interval: Duration,
    /// How often the relay count is compared.
    pub topology_poll_interval: Duration,
    /// How often the settings store is compared with the active configuration.
    pub settings_poll_interval: Duration,
    /// Bus the own service lives on.
    pub own_bus: BusKind,
    /// Object path prefix for published status.
    pub status_root: String,
    pub debug: DebugGate,
}

impl ServiceConfig {
    pub fn from_platform(platform: &PlatformConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(platform.tick_interval_ms.max(10)),
            topology_poll_interval: Duration::from_millis(platform.topology_poll_interval_ms.max(50)),
            settings_poll_interval: Duration::from_secs(1),
            own_bus: BusKind::System,
            status_root: "/Status".to_string(),
            debug: DebugGate::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_platform(&PlatformConfig::default())
    }
}

/// Events that can be sent to the service.
#[derive(Debug)]
pub enum ServiceEvent {
    /// A request; the reply goes back on the oneshot if one is given.
    Call {
        call: ServiceCall,
        reply: Option<oneshot::Sender<ServiceResponse>>,
    },
    /// A sample from the debug waveform.
    VoltageSample(f64),
    /// A settings store change pushed by the store.
    SettingChanged { key: String, value: BusValue },
    /// The relay subsystem announced a topology change.
    RelayTopologyChanged,
    Shutdown,
}

/// Cloneable handle for talking to a running service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    events: mpsc::Sender<ServiceEvent>,
    notifications: broadcast::Sender<Notification>,
}

impl ServiceHandle {
    pub async fn call(&self, call: ServiceCall) -> Result<ServiceResponse, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ServiceEvent::Call {
            call,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    pub async fn request(&self, request: ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        self.call(ServiceCall::new(request)).await
    }

    pub async fn send(&self, event: ServiceEvent) -> Result<(), ServiceError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn event_sender(&self) -> mpsc::Sender<ServiceEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

/// The D+ simulator service.
pub struct SimulatorService {
    config: ServiceConfig,
    ctx: ControlContext,
    bus: Arc<dyn BusClient>,
    gpio: Arc<dyn GpioDriver>,
    storage: Arc<dyn ConfigStorage>,
    event_tx: mpsc::Sender<ServiceEvent>,
    event_rx: mpsc::Receiver<ServiceEvent>,
    notify_tx: broadcast::Sender<Notification>,
    /// Last value written per status path
    published: HashMap<String, BusValue>,
    publish_failing: bool,
}

impl SimulatorService {
    /// Create the service, registering settings defaults and loading the
    /// configuration from `storage`.
    pub fn new(
        config: ServiceConfig,
        platform: PlatformConfig,
        bus: Arc<dyn BusClient>,
        gpio: Arc<dyn GpioDriver>,
        storage: Arc<dyn ConfigStorage>,
    ) -> Result<Self, ServiceError> {
        match storage.register_defaults() {
            Ok(0) => {}
            Ok(created) => info!("Registered {} settings with defaults", created),
            Err(e) => warn!("Registering settings defaults failed: {}", e),
        }
        let settings = storage.load_config()?;
        let ctx = ControlContext::new(platform, settings)?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (notify_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            ctx,
            bus,
            gpio,
            storage,
            event_tx,
            event_rx,
            notify_tx,
            published: HashMap::new(),
            publish_failing: false,
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            events: self.event_tx.clone(),
            notifications: self.notify_tx.clone(),
        }
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    fn status_period(&self) -> Duration {
        Duration::from_secs_f64(clamp_interval(self.ctx.config().status_publish_interval_seconds))
    }

    /// Run until a shutdown request. Outputs are released before returning.
    pub async fn run(mut self) -> Result<(), ServiceError> {
        info!("D+ simulator service starting");
        self.discover();

        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut topology = interval_at(
            Instant::now() + self.config.topology_poll_interval,
            self.config.topology_poll_interval,
        );
        let mut settings = interval_at(
            Instant::now() + self.config.settings_poll_interval,
            self.config.settings_poll_interval,
        );
        let mut status_period = self.status_period();
        let mut status = interval(status_period);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.ctx.tick(self.bus.as_ref(), self.gpio.as_ref(), std::time::Instant::now());
                }

                _ = topology.tick() => self.poll_topology(),

                _ = settings.tick() => self.poll_settings(),

                _ = status.tick() => {
                    self.publish_status();
                    let period = self.status_period();
                    if period != status_period {
                        debug!("Status interval changed to {:?}", period);
                        status_period = period;
                        status = interval_at(Instant::now() + period, period);
                    }
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event) {
                        break;
                    }
                }
            }
        }

        self.finish();
        Ok(())
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    fn discover(&mut self) {
        if let Err(e) = self.ctx.refresh_relay_catalog(self.bus.as_ref()) {
            warn!("Relay catalog unavailable: {}", e);
        }
        self.resolve_source();
    }

    fn resolve_source(&mut self) {
        match self
            .ctx
            .resolve_voltage_source(self.bus.as_ref(), self.storage.as_ref())
        {
            Ok(source) => debug!("Voltage source {}", source.description()),
            Err(e) => warn!("Voltage source discovery failed: {}", e),
        }
    }

    fn poll_topology(&mut self) {
        if self.ctx.poll_relay_topology(self.bus.as_ref()) {
            self.resolve_source();
        } else if !self.ctx.resolver().is_live() && self.ctx.manual_voltage().is_none() {
            debug!("Voltage source not live, rediscovering");
            self.resolve_source();
        }
    }

    // ========================================================================
    // Settings
    // ========================================================================

    fn poll_settings(&mut self) {
        for definition in SETTING_DEFINITIONS {
            let stored = match self.storage.load_value(definition.key) {
                Ok(value) => value,
                Err(ConfigError::NotFound(_)) => continue,
                Err(e) => {
                    debug!("Settings poll aborted: {}", e);
                    return;
                }
            };
            let current = self.ctx.pending_config().setting_value(definition.key);
            if SimulatorConfig::is_resolved_key(definition.key) || current.as_ref() != Some(&stored) {
                self.ctx
                    .on_setting_changed(definition.key, &stored, self.storage.as_ref());
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Returns `false` when the loop should stop.
    fn handle_event(&mut self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::Call { call, reply } => {
                let stop = call.request == ServiceRequest::Shutdown;
                let response = self.handle_call(call);
                if let Some(reply) = reply {
                    let _ = reply.send(response);
                }
                !stop
            }
            ServiceEvent::VoltageSample(voltage) => {
                if self.config.debug.is_enabled() {
                    self.ctx.set_manual_voltage(Some(voltage));
                } else {
                    warn!("Ignoring voltage sample, debug features disabled");
                }
                true
            }
            ServiceEvent::SettingChanged { key, value } => {
                self.ctx.on_setting_changed(&key, &value, self.storage.as_ref());
                true
            }
            ServiceEvent::RelayTopologyChanged => {
                self.discover();
                true
            }
            ServiceEvent::Shutdown => false,
        }
    }

    fn handle_call(&mut self, call: ServiceCall) -> ServiceResponse {
        debug!("Request {}", call.request.name());
        let response = match call.request {
            ServiceRequest::Start => {
                self.ctx.start();
                ServiceResponse::completed().with_status(self.ctx.status())
            }
            ServiceRequest::Stop => {
                self.ctx.stop();
                ServiceResponse::completed().with_status(self.ctx.status())
            }
            ServiceRequest::Shutdown => {
                info!("Shutdown requested");
                ServiceResponse::completed()
            }
            ServiceRequest::UpdateSettings { settings } => {
                let errors = self
                    .ctx
                    .update_settings(&settings_from_json(&settings), self.storage.as_ref());
                ServiceResponse::completed()
                    .with_errors(errors.iter().map(ToString::to_string).collect())
                    .with_settings(self.settings_json())
                    .with_status(self.ctx.status())
            }
            ServiceRequest::InjectVoltageSample { voltage } => match self.config.debug.check() {
                Ok(()) => {
                    self.ctx.set_manual_voltage(voltage);
                    ServiceResponse::completed().with_status(self.ctx.status())
                }
                Err(e) => {
                    warn!("Rejected voltage injection: {}", e);
                    ServiceResponse::failed(403, e.to_string())
                }
            },
            ServiceRequest::GetSettings => ServiceResponse::completed().with_settings(self.settings_json()),
            ServiceRequest::GetStatus => ServiceResponse::completed().with_status(self.ctx.status()),
        };
        response.with_request_id(call.request_id)
    }

    fn settings_json(&self) -> dplus_protocol::SettingsMap {
        settings_to_json(&self.ctx.pending_config().to_settings_map())
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn publish_status(&mut self) {
        let status = self.ctx.status();
        let own_service = self.ctx.platform().own_service.clone();
        let entries = status.flatten(&self.config.status_root);
        let seen: HashSet<String> = entries.iter().map(|(path, _)| path.clone()).collect();
        let mut failed = false;

        for (path, value) in entries {
            if self.published.get(&path) == Some(&value) {
                continue;
            }
            match self
                .bus
                .set_value(self.config.own_bus, &own_service, &path, value.clone())
            {
                Ok(()) => {
                    self.published.insert(path, value);
                }
                Err(e) => {
                    if !self.publish_failing {
                        warn!("Publishing status on {} failed: {}", own_service, e);
                    }
                    failed = true;
                    // Forget the stale value so the path is retried next publish
                    self.published.remove(&path);
                    if matches!(e, BusError::Timeout { .. } | BusError::Unreachable(_)) {
                        break;
                    }
                }
            }
        }
        self.publish_failing = failed;

        let vanished: Vec<String> = self
            .published
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in vanished {
            self.published.remove(&path);
            if let Err(e) = self
                .bus
                .set_value(self.config.own_bus, &own_service, &path, BusValue::Absent)
            {
                debug!("Clearing status path {} failed: {}", path, e);
            }
        }

        let _ = self.notify_tx.send(Notification::StatusChanged { status });
    }

    fn finish(&mut self) {
        info!("D+ simulator service stopping");
        let failures = self.ctx.shutdown(self.bus.as_ref(), self.gpio.as_ref());
        for failure in &failures {
            error!("Release on shutdown failed: {}", failure);
        }
        self.publish_status();
        let _ = self.notify_tx.send(Notification::Stopped);
    }
}
