//! Error types for Synheart Link

use thiserror::Error;

/// Errors raised by the durable key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected value type for key {key}: expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors raised by a wireless transport backend
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Bluetooth is turned off")]
    Disabled,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Request could not be dispatched: {0}")]
    DispatchFailed(String),

    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors raised when saving a device identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Device address must not be empty")]
    Empty,
}

/// Errors raised by the health service host
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failure categories surfaced to the consuming application
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Service(String),

    #[error("{0}")]
    Save(String),

    #[error("{0}")]
    Get(String),
}

impl CommandError {
    /// Stable failure category code
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Service(_) => "SERVICE_ERROR",
            CommandError::Save(_) => "SAVE_ERROR",
            CommandError::Get(_) => "GET_ERROR",
        }
    }
}
