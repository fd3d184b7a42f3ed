//! Starter voltage source discovery and validation.
//!
//! Discovery walks the system and session bus, keeps the system aggregator
//! and battery services that answer the starter voltage probe with a number,
//! and picks one: the aggregator if present (system bus first), otherwise the
//! lexicographically first battery service.
//!
//! A source is live only while reads return a defined numeric value. No
//! address is ever guessed: when discovery finds nothing the resolved source
//! is cleared and every sample is "not live".

use crate::config::{ConfigStorage, PlatformConfig};
use crate::model::{BusKind, BusValue, ResolvedVoltageSource, SourceState, VoltageCandidate};
use crate::path::{PatternError, ServicePattern};
use crate::store::{BusClient, BusError};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Errors from discovery and validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("no service exposes a starter voltage")]
    NoCandidates,

    #[error("discovery exceeded {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("no voltage source resolved")]
    Unresolved,

    #[error("{0} did not return a numeric voltage")]
    NotNumeric(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("invalid service pattern: {0}")]
    Pattern(#[from] PatternError),
}

pub struct VoltageSourceResolver {
    system_service: String,
    battery_pattern: ServicePattern,
    starter_path: String,
    product_name_path: String,
    discovery_timeout: Duration,

    source: ResolvedVoltageSource,
    description: String,
    state: SourceState,
    message: String,
    failures: u32,
    last_error: Option<String>,
    last_update: Option<DateTime<Utc>>,
    ever_resolved: bool,
}

impl VoltageSourceResolver {
    pub fn new(platform: &PlatformConfig) -> Result<Self, ResolveError> {
        Ok(Self {
            system_service: platform.system_service.clone(),
            battery_pattern: ServicePattern::new(&platform.battery_service_pattern)?,
            starter_path: platform.starter_voltage_path.clone(),
            product_name_path: platform.product_name_path.clone(),
            discovery_timeout: Duration::from_millis(platform.discovery_timeout_ms),
            source: ResolvedVoltageSource::default(),
            description: String::new(),
            state: SourceState::Unresolved,
            message: "discovery pending".to_string(),
            failures: 0,
            last_error: None,
            last_update: None,
            ever_resolved: false,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn source(&self) -> &ResolvedVoltageSource {
        &self.source
    }

    pub fn is_live(&self) -> bool {
        self.source.is_live
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Consecutive failed validation reads.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    fn is_relevant(&self, service: &str) -> bool {
        service == self.system_service || self.battery_pattern.matches(service)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Probe every relevant service on both buses.
    ///
    /// Candidates come back in priority order. A bus that cannot be listed is
    /// skipped; if neither can, the last error is returned.
    pub fn discover(&self, bus: &dyn BusClient) -> Result<Vec<VoltageCandidate>, ResolveError> {
        let deadline = Instant::now() + self.discovery_timeout;
        let mut candidates = Vec::new();
        let mut listed_any = false;
        let mut last_error = None;

        for bus_kind in BusKind::ALL {
            let names = match bus.list_names(bus_kind) {
                Ok(names) => {
                    listed_any = true;
                    names
                }
                Err(e) => {
                    debug!("Listing {} bus failed: {}", bus_kind, e);
                    last_error = Some(e);
                    continue;
                }
            };

            for service in names.iter().filter(|s| self.is_relevant(s)) {
                if Instant::now() >= deadline {
                    warn!("Voltage source discovery exceeded {:?}", self.discovery_timeout);
                    return Err(ResolveError::DiscoveryTimeout(self.discovery_timeout));
                }

                let voltage = match bus.get_value(bus_kind, service, &self.starter_path) {
                    Ok(value) => value.as_f64(),
                    Err(e) => {
                        debug!("Probe of {} on {} failed: {}", service, bus_kind, e);
                        None
                    }
                };
                let Some(voltage) = voltage else {
                    continue;
                };

                let description = match bus.get_value(bus_kind, service, &self.product_name_path) {
                    Ok(BusValue::Text(name)) if !name.trim().is_empty() => {
                        format!("{} ({})", name.trim(), service)
                    }
                    _ => service.clone(),
                };

                debug!("Candidate {} on {}: {:.2} V", service, bus_kind, voltage);
                candidates.push(VoltageCandidate {
                    bus: bus_kind,
                    service: service.clone(),
                    object_path: self.starter_path.clone(),
                    voltage,
                    description,
                });
            }
        }

        if !listed_any {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }

        let system_service = self.system_service.clone();
        candidates.sort_by(|a, b| {
            let a_key = (a.service != system_service, a.service.as_str(), a.bus);
            let b_key = (b.service != system_service, b.service.as_str(), b.bus);
            a_key.cmp(&b_key)
        });
        Ok(candidates)
    }

    /// Run discovery and adopt the best candidate.
    pub fn resolve(&mut self, bus: &dyn BusClient) -> Result<ResolvedVoltageSource, ResolveError> {
        let candidates = match self.discover(bus) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.fail_discovery(&e);
                return Err(e);
            }
        };

        let Some(best) = candidates.into_iter().next() else {
            let e = ResolveError::NoCandidates;
            self.fail_discovery(&e);
            return Err(e);
        };

        let resolved = ResolvedVoltageSource::new(best.bus, &best.service, &best.object_path);
        if !resolved.same_address(&self.source) {
            info!("Starter voltage source resolved: {} ({})", resolved.description(), best.description);
        }
        self.source = resolved;
        self.description = best.description;
        self.state = SourceState::Resolved;
        self.message = String::new();
        self.ever_resolved = true;
        self.validate(bus);
        Ok(self.source.clone())
    }

    fn fail_discovery(&mut self, e: &ResolveError) {
        self.source = ResolvedVoltageSource::default();
        self.description = String::new();
        self.last_error = Some(e.to_string());
        self.message = e.to_string();
        self.state = if self.ever_resolved {
            SourceState::SourceLost
        } else {
            SourceState::ScanFailed
        };
        warn!("Voltage source {}: {}", self.state.as_str(), e);
    }

    /// Resolve and write the result to the resolved-source settings.
    ///
    /// Persist failures are logged; the in-memory resolution stands.
    pub fn resolve_and_persist(
        &mut self,
        bus: &dyn BusClient,
        storage: &dyn ConfigStorage,
    ) -> Result<ResolvedVoltageSource, ResolveError> {
        let source = self.resolve(bus)?;
        if let Some(bus_kind) = source.bus {
            let values = [
                ("busName", BusValue::from(bus_kind.as_str())),
                ("servicePath", BusValue::from(source.service.as_str())),
                ("voltagePath", BusValue::from(source.object_path.as_str())),
            ];
            for (key, value) in values {
                if let Err(e) = storage.save_value(key, &value) {
                    error!("Persisting resolved {} failed: {}", key, e);
                }
            }
        }
        Ok(source)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Read the resolved source once and update liveness.
    pub fn validate(&mut self, bus: &dyn BusClient) -> bool {
        let Some(bus_kind) = self.source.bus.filter(|_| !self.source.is_empty()) else {
            self.source.is_live = false;
            self.source.last_voltage = None;
            return false;
        };

        let result = bus
            .get_value(bus_kind, &self.source.service, &self.source.object_path)
            .map_err(ResolveError::from)
            .and_then(|value| {
                value
                    .as_f64()
                    .ok_or_else(|| ResolveError::NotNumeric(self.source.description()))
            });

        match result {
            Ok(voltage) => {
                if !self.source.is_live {
                    info!("Voltage source {} is live", self.source.description());
                }
                self.source.is_live = true;
                self.source.last_voltage = Some(voltage);
                self.failures = 0;
                self.last_error = None;
                self.message = String::new();
                self.state = SourceState::Resolved;
                self.last_update = Some(Utc::now());
                true
            }
            Err(e) => {
                if self.source.is_live {
                    warn!("Voltage source {} is no longer live: {}", self.source.description(), e);
                } else {
                    debug!("Voltage source {} not live: {}", self.source.description(), e);
                }
                self.source.is_live = false;
                self.source.last_voltage = None;
                self.failures = self.failures.saturating_add(1);
                self.message = e.to_string();
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Validate and return the sampled voltage if the source is live.
    pub fn sample(&mut self, bus: &dyn BusClient) -> Option<f64> {
        if self.validate(bus) {
            self.source.last_voltage
        } else {
            None
        }
    }
}
