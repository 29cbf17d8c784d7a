//! Core types for Synheart Link
//!
//! This module defines the data structures that flow between the stages of the
//! link: decoded frames, interpreted samples and signals, link states and the
//! events handed to the application bridge.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::IdentityError;

/// Text the band sends when it is not being worn
pub const WEAR_REMINDER_MESSAGE: &str = "Please wear your band";

/// Lifecycle state of the link to the band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    NegotiatingTransport,
    Subscribing,
    Active,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::NegotiatingTransport => "negotiating_transport",
            LinkState::Subscribing => "subscribing",
            LinkState::Active => "active",
        }
    }

    /// Whether the radio link itself is up (any state past `Connecting`)
    pub fn is_link_up(&self) -> bool {
        matches!(
            self,
            LinkState::NegotiatingTransport | LinkState::Subscribing | LinkState::Active
        )
    }

    /// Apply a lifecycle event, returning the next state if the edge exists.
    pub fn next(self, event: LinkEvent) -> Option<LinkState> {
        use LinkEvent as E;
        use LinkState as S;

        match (self, event) {
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::LinkEstablished) => Some(S::NegotiatingTransport),
            (S::NegotiatingTransport, E::NegotiationFinished) => Some(S::Subscribing),
            (S::Subscribing, E::ChannelsDiscovered { success: true }) => Some(S::Active),
            (S::Subscribing, E::ChannelsDiscovered { success: false }) => Some(S::Subscribing),
            (S::Active, E::DataReceived) => Some(S::Active),
            (
                S::Connecting | S::NegotiatingTransport | S::Subscribing | S::Active,
                E::LinkLost,
            ) => Some(S::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connect,
    LinkEstablished,
    /// Unit-size negotiation finished, failed, or could not be dispatched
    NegotiationFinished,
    ChannelsDiscovered { success: bool },
    DataReceived,
    LinkLost,
}

/// Saved transport address of the paired band
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(address: impl Into<String>) -> Result<Self, IdentityError> {
        let address = address.into();
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service/characteristic pair carrying the band's notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Candidate message cut out of the byte stream, not yet validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub(crate) fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metrics the band does not measure yet.
///
/// These are fixed constants carried for the consuming application's
/// layout; they are never derived from sensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnimplementedMetrics {
    pub recovery: i64,
    #[serde(rename = "rhr")]
    pub resting_heart_rate: i64,
    #[serde(rename = "hrv")]
    pub heart_rate_variability: i64,
}

impl UnimplementedMetrics {
    pub const PLACEHOLDER: UnimplementedMetrics = UnimplementedMetrics {
        recovery: 0,
        resting_heart_rate: 60,
        heart_rate_variability: 45,
    };
}

impl Default for UnimplementedMetrics {
    fn default() -> Self {
        Self::PLACEHOLDER
    }
}

/// One interpreted measurement from the band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    /// Heart rate (bpm)
    pub heart_rate: i64,
    /// Step count reported by the band
    pub steps: i64,
    /// Blood oxygen saturation (percentage)
    pub spo2: i64,
    /// Calories burned
    pub calories: i64,
    /// Sleep duration (hours)
    #[serde(rename = "sleep")]
    pub sleep_hours: f64,
    /// Stress level
    pub stress: i64,
    /// Body temperature (celsius)
    pub body_temperature: f64,
    /// Breathing rate (breaths per minute)
    pub breathing_rate: i64,
    /// Observation time, milliseconds since the Unix epoch
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
    /// Whether the band queued this reading while disconnected
    #[serde(default)]
    pub pending: bool,
    #[serde(flatten)]
    pub unimplemented: UnimplementedMetrics,
}

/// Result of interpreting a single frame
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Sample(HealthSample),
    WearReminder,
}

/// Events delivered to the consuming application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    ConnectionStatus { connected: bool },
    HealthDataReceived(HealthSample),
    NotificationReceived { message: String },
    StepData { steps: i64 },
    Log { message: String },
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::ConnectionStatus { .. } => "connection_status",
            BridgeEvent::HealthDataReceived(_) => "health_data_received",
            BridgeEvent::NotificationReceived { .. } => "notification_received",
            BridgeEvent::StepData { .. } => "step_data",
            BridgeEvent::Log { .. } => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = LinkState::Disconnected;
        for event in [
            LinkEvent::Connect,
            LinkEvent::LinkEstablished,
            LinkEvent::NegotiationFinished,
            LinkEvent::ChannelsDiscovered { success: true },
            LinkEvent::DataReceived,
        ] {
            state = state.next(event).unwrap();
        }
        assert_eq!(state, LinkState::Active);
        assert_eq!(state.next(LinkEvent::LinkLost), Some(LinkState::Disconnected));
    }

    #[test]
    fn test_undefined_edges_are_rejected() {
        assert_eq!(LinkState::Disconnected.next(LinkEvent::LinkLost), None);
        assert_eq!(LinkState::Connecting.next(LinkEvent::Connect), None);
        assert_eq!(LinkState::Active.next(LinkEvent::Connect), None);
        assert_eq!(LinkState::Subscribing.next(LinkEvent::DataReceived), None);
        assert_eq!(
            LinkState::Subscribing.next(LinkEvent::ChannelsDiscovered { success: false }),
            Some(LinkState::Subscribing)
        );
    }

    #[test]
    fn test_device_identity_rejects_blank() {
        assert!(DeviceIdentity::new("   ").is_err());
        let id = DeviceIdentity::new(" AA:BB:CC:DD:EE:FF ").unwrap();
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_sample_wire_keys() {
        let sample = HealthSample {
            heart_rate: 80,
            steps: 120,
            spo2: 98,
            calories: 0,
            sleep_hours: 7.0,
            stress: 30,
            body_temperature: 36.5,
            breathing_rate: 16,
            timestamp_millis: 1_700_000_000_000,
            pending: false,
            unimplemented: UnimplementedMetrics::PLACEHOLDER,
        };
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["heartRate"], 80);
        assert_eq!(value["sleep"], 7.0);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["rhr"], 60);
        assert_eq!(value["hrv"], 45);
        assert_eq!(value["recovery"], 0);

        let back: HealthSample = serde_json::from_value(value).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_bridge_event_tagging() {
        let event = BridgeEvent::ConnectionStatus { connected: false };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"connection_status","data":{"connected":false}}"#);
        assert_eq!(event.kind(), "connection_status");
    }
}
