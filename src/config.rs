//! Link configuration
//!
//! Every value has a default matching the band firmware, so an empty or
//! missing config file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::decoder::DEFAULT_BUFFER_CAP;
use crate::error::ConfigError;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::interpreter::DEFAULT_PENDING_CYCLE_MINUTES;
use crate::types::{ChannelId, WEAR_REMINDER_MESSAGE};

/// Service exposing the band's health characteristic
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);

/// Characteristic the band notifies health frames on
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xabcd1234_5678_90ab_cdef_123456789abc);

pub const DEFAULT_REQUESTED_UNIT_SIZE: u16 = 512;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 15;

/// ATT allows MTUs between 23 and 517 bytes
const UNIT_SIZE_RANGE: std::ops::RangeInclusive<u16> = 23..=517;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub link: LinkSection,
    pub decoder: DecoderSection,
    pub history: HistorySection,
    pub interpreter: InterpreterSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub requested_unit_size: u16,
    pub reconnect_delay_secs: u64,
    pub auto_reconnect: bool,
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            requested_unit_size: DEFAULT_REQUESTED_UNIT_SIZE,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSection {
    pub buffer_cap: usize,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub capacity: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSection {
    pub pending_cycle_minutes: i64,
    pub wear_reminder_message: String,
}

impl Default for InterpreterSection {
    fn default() -> Self {
        Self {
            pending_cycle_minutes: DEFAULT_PENDING_CYCLE_MINUTES,
            wear_reminder_message: WEAR_REMINDER_MESSAGE.to_string(),
        }
    }
}

impl LinkConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !UNIT_SIZE_RANGE.contains(&self.link.requested_unit_size) {
            return Err(ConfigError::InvalidValue {
                field: "link.requested_unit_size",
                reason: format!(
                    "{} is outside {}..={}",
                    self.link.requested_unit_size,
                    UNIT_SIZE_RANGE.start(),
                    UNIT_SIZE_RANGE.end()
                ),
            });
        }
        if self.link.reconnect_delay_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "link.reconnect_delay_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.decoder.buffer_cap == 0 {
            return Err(ConfigError::InvalidValue {
                field: "decoder.buffer_cap",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history.capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.interpreter.pending_cycle_minutes < 0 {
            return Err(ConfigError::InvalidValue {
                field: "interpreter.pending_cycle_minutes",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId {
            service: self.link.service_uuid,
            characteristic: self.link.characteristic_uuid,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.link.reconnect_delay_secs)
    }
}
