//! Linux sysfs GPIO driver.

use dplus_core::{GpioDriver, GpioError, IgnitionPull};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::collections::HashSet;
use tracing::{debug, warn};

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// GPIO through `/sys/class/gpio`.
///
/// Pull resistors cannot be set through sysfs; the configured pull is only
/// logged and has to be provided by the device tree or external wiring.
pub struct SysfsGpio {
    root: PathBuf,
    exported: Mutex<HashSet<u32>>,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: Mutex::new(HashSet::new()),
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write_file(path: &Path, pin: u32, contents: &str) -> Result<(), GpioError> {
        fs::write(path, contents).map_err(|e| GpioError::Io {
            pin,
            message: format!("{}: {}", path.display(), e),
        })
    }

    fn export(&self, pin: u32) -> Result<(), GpioError> {
        if !self.pin_dir(pin).exists() {
            debug!("Exporting GPIO {}", pin);
            Self::write_file(&self.root.join("export"), pin, &pin.to_string())?;
        }
        self.exported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin);
        Ok(())
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioDriver for SysfsGpio {
    fn configure_output(&self, pin: u32) -> Result<(), GpioError> {
        self.export(pin)?;
        // "low" sets the direction and drives the line low in one step
        Self::write_file(&self.pin_dir(pin).join("direction"), pin, "low")
    }

    fn configure_input(&self, pin: u32, pull: IgnitionPull) -> Result<(), GpioError> {
        self.export(pin)?;
        if pull != IgnitionPull::None {
            debug!("GPIO {} pull {} must be provided externally", pin, pull.as_str());
        }
        Self::write_file(&self.pin_dir(pin).join("direction"), pin, "in")
    }

    fn write(&self, pin: u32, level: bool) -> Result<(), GpioError> {
        if !self.exported.lock().unwrap_or_else(|e| e.into_inner()).contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        Self::write_file(&self.pin_dir(pin).join("value"), pin, if level { "1" } else { "0" })
    }

    fn read(&self, pin: u32) -> Result<bool, GpioError> {
        if !self.exported.lock().unwrap_or_else(|e| e.into_inner()).contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        let path = self.pin_dir(pin).join("value");
        let raw = fs::read_to_string(&path).map_err(|e| GpioError::Io {
            pin,
            message: format!("{}: {}", path.display(), e),
        })?;
        Ok(raw.trim() == "1")
    }

    fn release(&self, pin: u32) -> Result<(), GpioError> {
        let was_exported = self
            .exported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pin);
        if !was_exported {
            return Ok(());
        }
        if let Err(e) = Self::write_file(&self.root.join("unexport"), pin, &pin.to_string()) {
            warn!("Unexporting GPIO {} failed: {}", pin, e);
            return Err(e);
        }
        Ok(())
    }
}
