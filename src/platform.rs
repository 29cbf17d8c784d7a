//! Hooks into the host platform
//!
//! The process that hosts the link may be killed by the OS; restarting it and
//! showing user-facing alerts are the platform's job. The link only calls
//! into this trait.

use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Platform services the link depends on but does not implement
pub trait Platform: Send + Sync {
    /// Ask the platform to relaunch the host after `after`
    fn schedule_restart(&self, after: Duration);

    /// Raise a high-priority user alert
    fn show_alert(&self, title: &str, text: &str);
}

/// Platform that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPlatform;

impl Platform for LogPlatform {
    fn schedule_restart(&self, after: Duration) {
        info!(after_ms = after.as_millis() as u64, "restart requested");
    }

    fn show_alert(&self, title: &str, text: &str) {
        info!(title, text, "alert");
    }
}

/// Calls recorded by `RecordingPlatform`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    ScheduleRestart(Duration),
    ShowAlert { title: String, text: String },
}

/// Platform that records every call
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<PlatformCall>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: PlatformCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Platform for RecordingPlatform {
    fn schedule_restart(&self, after: Duration) {
        self.record(PlatformCall::ScheduleRestart(after));
    }

    fn show_alert(&self, title: &str, text: &str) {
        self.record(PlatformCall::ShowAlert {
            title: title.to_string(),
            text: text.to_string(),
        });
    }
}
