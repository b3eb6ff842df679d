use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{Result, SignerError};

// Ledger's USB vendor identifier
pub const DEFAULT_VENDOR_ID: u16 = 0x2C97;
pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_SCAN_DELAY_MS: u64 = 100;
pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Runtime settings for the signing device manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// USB vendor id a device must report to be considered
    pub vendor_id: u16,
    pub baud_rate: u32,
    /// How long a dispatched command may wait for its response
    pub response_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Settle time between a scan request and enumeration
    pub scan_delay_ms: u64,
    /// Queue depth for commands and status notifications
    pub event_capacity: usize,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            scan_delay_ms: DEFAULT_SCAN_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SignerConfig {
    /// Load settings from a JSON file. Absent fields keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SignerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SignerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HWSIGN_*` environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("HWSIGN_VENDOR_ID") {
            match parse_vendor_id(&raw) {
                Some(vid) => self.vendor_id = vid,
                None => log::warn!("Ignoring invalid HWSIGN_VENDOR_ID: {}", raw),
            }
        }
        if let Some(raw) = lookup("HWSIGN_BAUD_RATE") {
            match raw.trim().parse::<u32>() {
                Ok(baud) if baud > 0 => self.baud_rate = baud,
                _ => log::warn!("Ignoring invalid HWSIGN_BAUD_RATE: {}", raw),
            }
        }
        if let Some(raw) = lookup("HWSIGN_RESPONSE_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.response_timeout_ms = ms,
                _ => log::warn!("Ignoring invalid HWSIGN_RESPONSE_TIMEOUT_MS: {}", raw),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(SignerError::Config("baud_rate must be non-zero".to_string()));
        }
        if self.response_timeout_ms == 0 {
            return Err(SignerError::Config("response_timeout_ms must be non-zero".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(SignerError::Config("event_capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms)
    }
}

fn parse_vendor_id(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => raw.parse::<u16>().ok(),
    }
}
