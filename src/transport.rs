//! Wireless transport seam
//!
//! The radio stack (scanning, pairing, GATT) belongs to the platform. The
//! connection manager drives it through `Transport` and is driven by it
//! through `TransportEvent`s, which a backend delivers in order and never
//! concurrently for the same link.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::TransportError;
use crate::types::{ChannelId, DeviceIdentity};

/// Outcome reported by the transport for an asynchronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(i32),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Callbacks from the transport into the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LinkEstablished,
    LinkLost,
    UnitSizeNegotiated { size: u16, outcome: Outcome },
    ChannelsDiscovered { outcome: Outcome },
    DataReceived(Vec<u8>),
}

/// Requests from the connection manager to the transport
pub trait Transport: Send + Sync {
    /// Whether the radio is administratively on
    fn is_enabled(&self) -> bool;

    /// Start connecting; completion arrives as `LinkEstablished`
    fn connect(&self, identity: &DeviceIdentity, auto_reconnect: bool)
        -> Result<(), TransportError>;

    /// Ask for a larger transport unit; `false` if the request was not dispatched
    fn request_larger_unit(&self, size: u16) -> bool;

    /// Start channel discovery; completion arrives as `ChannelsDiscovered`
    fn discover_channels(&self) -> Result<(), TransportError>;

    /// Subscribe to notifications on `channel`
    fn enable_notifications(&self, channel: &ChannelId) -> Result<(), TransportError>;

    /// Disconnect and release the link without further callbacks
    fn close(&self);
}

/// Requests recorded by `MockTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        address: String,
        auto_reconnect: bool,
    },
    RequestLargerUnit(u16),
    DiscoverChannels,
    EnableNotifications(ChannelId),
    Close,
}

/// Scriptable transport that records requests
#[derive(Debug)]
pub struct MockTransport {
    enabled: AtomicBool,
    fail_connect: AtomicBool,
    dispatch_unit_request: AtomicBool,
    fail_notifications: AtomicBool,
    calls: Mutex<VecDeque<TransportCall>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            dispatch_unit_request: AtomicBool::new(true),
            fail_notifications: AtomicBool::new(false),
            calls: Mutex::new(VecDeque::new()),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_dispatch_unit_request(&self, dispatch: bool) {
        self.dispatch_unit_request.store(dispatch, Ordering::SeqCst);
    }

    pub fn set_fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    /// Drain every request recorded so far
    pub fn take_calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .map(|mut c| c.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.calls
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|call| matches!(call, TransportCall::Connect { .. }))
                    .count()
            })
            .unwrap_or(0)
    }

    fn record(&self, call: TransportCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push_back(call);
        }
    }
}

impl Transport for MockTransport {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        identity: &DeviceIdentity,
        auto_reconnect: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            address: identity.as_str().to_string(),
            auto_reconnect,
        });
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::DeviceNotFound(identity.to_string()));
        }
        Ok(())
    }

    fn request_larger_unit(&self, size: u16) -> bool {
        self.record(TransportCall::RequestLargerUnit(size));
        self.dispatch_unit_request.load(Ordering::SeqCst)
    }

    fn discover_channels(&self) -> Result<(), TransportError> {
        self.record(TransportCall::DiscoverChannels);
        Ok(())
    }

    fn enable_notifications(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.record(TransportCall::EnableNotifications(*channel));
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(TransportError::Backend("characteristic not found".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.record(TransportCall::Close);
    }
}
