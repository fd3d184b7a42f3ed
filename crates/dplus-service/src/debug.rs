//! Debug features: manual voltage injection and the test waveform.
//!
//! Both are only available when explicitly requested on the command line and
//! the host is flagged as a development machine.

use crate::error::ServiceError;
use crate::service::ServiceEvent;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Environment flag marking a development host.
pub const DEVELOPMENT_ENV: &str = "DPLUS_SIM_DEVELOPMENT";

/// Interval between waveform samples.
pub const WAVEFORM_PERIOD: Duration = Duration::from_millis(500);

/// Accepts `1`, `true`, `yes` and `on`, ignoring case and whitespace.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugGate {
    requested: bool,
    development: bool,
}

impl DebugGate {
    pub fn new(requested: bool, development: bool) -> Self {
        Self {
            requested,
            development,
        }
    }

    /// Read the development flag from [`DEVELOPMENT_ENV`].
    pub fn from_env(requested: bool) -> Self {
        let development = std::env::var(DEVELOPMENT_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Self::new(requested, development)
    }

    pub fn is_enabled(&self) -> bool {
        self.requested && self.development
    }

    pub fn check(&self) -> Result<(), ServiceError> {
        if !self.requested {
            return Err(ServiceError::DebugDisabled("--enable-debug not given".to_string()));
        }
        if !self.development {
            return Err(ServiceError::DebugDisabled(format!("{} not set", DEVELOPMENT_ENV)));
        }
        Ok(())
    }
}

/// `amp + amp * 0.5 * (1 + sin(t))`, oscillating between `amp` and `2 * amp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waveform {
    amplitude: f64,
}

impl Waveform {
    pub fn new(amplitude: f64) -> Self {
        Self { amplitude }
    }

    pub fn sample(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        self.amplitude + self.amplitude * 0.5 * (1.0 + t.sin())
    }
}

/// Feed waveform samples into the service until its channel closes.
pub fn spawn_waveform(waveform: Waveform, events: mpsc::Sender<ServiceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut interval = tokio::time::interval(WAVEFORM_PERIOD);
        loop {
            interval.tick().await;
            let voltage = waveform.sample(start.elapsed());
            debug!("Simulated voltage {:.3} V", voltage);
            if events.send(ServiceEvent::VoltageSample(voltage)).await.is_err() {
                break;
            }
        }
    })
}
