//! Frame interpretation
//!
//! Turns a decoded frame into a `HealthSample` or a wear reminder. The band's
//! firmware omits fields it has no reading for, so every metric except heart
//! rate falls back to a fixed default. Readings the band queued while the
//! link was down arrive flagged `pending` with the number of 5-minute cycles
//! they were held for, and are backdated accordingly.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::{Frame, HealthSample, Record, UnimplementedMetrics, WEAR_REMINDER_MESSAGE};

/// Default length of one band measurement cycle in minutes
pub const DEFAULT_PENDING_CYCLE_MINUTES: i64 = 5;

pub const DEFAULT_HEART_RATE: i64 = 72;
pub const DEFAULT_STEPS: i64 = 0;
pub const DEFAULT_SPO2: i64 = 98;
pub const DEFAULT_CALORIES: i64 = 0;
pub const DEFAULT_SLEEP_HOURS: f64 = 7.0;
pub const DEFAULT_STRESS: i64 = 30;
pub const DEFAULT_BODY_TEMPERATURE: f64 = 36.5;
pub const DEFAULT_BREATHING_RATE: i64 = 16;

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

/// Maps frames to domain records
pub struct RecordInterpreter {
    clock: Arc<dyn Clock>,
    cycle_millis: i64,
    reminder_message: String,
}

impl Default for RecordInterpreter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RecordInterpreter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cycle_millis: DEFAULT_PENDING_CYCLE_MINUTES * 60 * 1000,
            reminder_message: WEAR_REMINDER_MESSAGE.to_string(),
        }
    }

    /// Override the length of one pending cycle
    pub fn with_cycle_minutes(mut self, minutes: i64) -> Self {
        self.cycle_millis = minutes.saturating_mul(60 * 1000);
        self
    }

    /// Override the text that identifies a wear reminder
    pub fn with_reminder_message(mut self, message: impl Into<String>) -> Self {
        self.reminder_message = message.into();
        self
    }

    /// Interpret a frame; anything unusable yields `None`
    pub fn interpret(&self, frame: &Frame) -> Option<Record> {
        let object = match serde_json::from_str::<Value>(frame.as_str()) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                debug!(frame = %frame, "frame is not a JSON object, discarding");
                return None;
            }
            Err(e) => {
                debug!(frame = %frame, error = %e, "frame is not valid JSON, discarding");
                return None;
            }
        };

        if object.get("message").and_then(Value::as_str) == Some(self.reminder_message.as_str()) {
            info!("wear reminder received from band");
            return Some(Record::WearReminder);
        }

        if !object.contains_key("heartRate") {
            debug!(frame = %frame, "frame has no heartRate, discarding");
            return None;
        }

        let pending = opt_bool(&object, "pending", false);
        let cycle_count = opt_i64(&object, "cycleCount", 0);
        let now = self.clock.now_millis();
        let timestamp_millis = if pending {
            now.saturating_sub(cycle_count.saturating_mul(self.cycle_millis))
        } else {
            now
        };

        Some(Record::Sample(HealthSample {
            heart_rate: opt_i64(&object, "heartRate", DEFAULT_HEART_RATE),
            steps: opt_i64(&object, "steps", DEFAULT_STEPS),
            spo2: opt_i64(&object, "spo2", DEFAULT_SPO2),
            calories: opt_i64(&object, "calories", DEFAULT_CALORIES),
            sleep_hours: opt_f64(&object, "sleep", DEFAULT_SLEEP_HOURS),
            stress: opt_i64(&object, "stress", DEFAULT_STRESS),
            body_temperature: opt_f64(&object, "bodyTemperature", DEFAULT_BODY_TEMPERATURE),
            breathing_rate: opt_i64(&object, "breathingRate", DEFAULT_BREATHING_RATE),
            timestamp_millis,
            pending,
            unimplemented: UnimplementedMetrics::PLACEHOLDER,
        }))
    }
}

/// Read an integer leniently: floats truncate, numeric strings parse
fn opt_i64(object: &Map<String, Value>, key: &str, default: i64) -> i64 {
    match object.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
            .unwrap_or(default),
        _ => default,
    }
}

fn opt_f64(object: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match object.get(key) {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(default),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(default),
        _ => default,
    }
}

fn opt_bool(object: &Map<String, Value>, key: &str, default: bool) -> bool {
    match object.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_705_312_800_000;

    fn interpreter() -> RecordInterpreter {
        RecordInterpreter::new(Arc::new(FixedClock(NOW)))
    }

    fn frame(text: &str) -> Frame {
        Frame::new(text.to_string())
    }

    fn sample(record: Option<Record>) -> HealthSample {
        match record {
            Some(Record::Sample(sample)) => sample,
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_sample_uses_defaults() {
        let s = sample(interpreter().interpret(&frame(r#"{"heartRate":80,"steps":120}"#)));
        assert_eq!(
            s,
            HealthSample {
                heart_rate: 80,
                steps: 120,
                spo2: 98,
                calories: 0,
                sleep_hours: 7.0,
                stress: 30,
                body_temperature: 36.5,
                breathing_rate: 16,
                timestamp_millis: NOW,
                pending: false,
                unimplemented: UnimplementedMetrics::PLACEHOLDER,
            }
        );
    }

    #[test]
    fn test_wear_reminder() {
        let record = interpreter().interpret(&frame(r#"{"message":"Please wear your band"}"#));
        assert_eq!(record, Some(Record::WearReminder));
    }

    #[test]
    fn test_wear_reminder_wins_over_health_fields() {
        let record = interpreter()
            .interpret(&frame(r#"{"message":"Please wear your band","heartRate":70}"#));
        assert_eq!(record, Some(Record::WearReminder));
    }

    #[test]
    fn test_other_messages_are_not_reminders() {
        assert_eq!(interpreter().interpret(&frame(r#"{"message":"hello"}"#)), None);
    }

    #[test]
    fn test_missing_heart_rate_rejected() {
        assert_eq!(interpreter().interpret(&frame(r#"{"steps":5}"#)), None);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert_eq!(interpreter().interpret(&frame(r#"{"heartRate":}"#)), None);
        assert_eq!(interpreter().interpret(&frame(r#"{"a":{"b":1}"#)), None);
    }

    #[test]
    fn test_pending_sample_backdated() {
        let s = sample(
            interpreter().interpret(&frame(r#"{"heartRate":70,"pending":true,"cycleCount":3}"#)),
        );
        assert!(s.pending);
        assert_eq!(s.timestamp_millis, NOW - 15 * 60 * 1000);
    }

    #[test]
    fn test_pending_without_cycle_count_is_now() {
        let s = sample(interpreter().interpret(&frame(r#"{"heartRate":70,"pending":true}"#)));
        assert_eq!(s.timestamp_millis, NOW);
    }

    #[test]
    fn test_cycle_count_ignored_when_not_pending() {
        let s = sample(interpreter().interpret(&frame(r#"{"heartRate":70,"cycleCount":4}"#)));
        assert!(!s.pending);
        assert_eq!(s.timestamp_millis, NOW);
    }

    #[test]
    fn test_lenient_numbers() {
        let s = sample(interpreter().interpret(&frame(
            r#"{"heartRate":"75","steps":12.9,"sleep":"6.5","spo2":null,"pending":"true","cycleCount":"2"}"#,
        )));
        assert_eq!(s.heart_rate, 75);
        assert_eq!(s.steps, 12);
        assert_eq!(s.sleep_hours, 6.5);
        assert_eq!(s.spo2, DEFAULT_SPO2);
        assert!(s.pending);
        assert_eq!(s.timestamp_millis, NOW - 10 * 60 * 1000);
    }

    #[test]
    fn test_non_finite_floats_use_defaults() {
        for raw in ["NaN", "inf", "-inf", "1e999"] {
            let text = format!(
                r#"{{"heartRate":60,"sleep":"{}","bodyTemperature":"{}"}}"#,
                raw, raw
            );
            let s = sample(interpreter().interpret(&frame(&text)));
            assert_eq!(s.sleep_hours, DEFAULT_SLEEP_HOURS, "sleep {}", raw);
            assert_eq!(s.body_temperature, DEFAULT_BODY_TEMPERATURE, "temp {}", raw);
        }
    }

    #[test]
    fn test_null_heart_rate_is_admitted_with_default() {
        let s = sample(interpreter().interpret(&frame(r#"{"heartRate":null}"#)));
        assert_eq!(s.heart_rate, DEFAULT_HEART_RATE);
    }

    #[test]
    fn test_custom_cycle_length() {
        let interpreter = interpreter().with_cycle_minutes(1);
        let s = sample(
            interpreter.interpret(&frame(r#"{"heartRate":70,"pending":true,"cycleCount":3}"#)),
        );
        assert_eq!(s.timestamp_millis, NOW - 3 * 60 * 1000);
    }
}
