//! Connection manager
//!
//! Owns the link state machine, the frame decoder and the sample history.
//! Transport callbacks arrive as `TransportEvent`s through `handle_event`;
//! decoded samples are written through to history and published on the
//! bridge. After any disconnect a single reconnection attempt is scheduled on
//! the tokio runtime, repeating at a fixed delay for as long as the link stays
//! down.
//!
//! The transport and every event sink must not call back into the manager
//! synchronously; the manager holds its lock while it drives the transport.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::config::LinkConfig;
use crate::decoder::FrameDecoder;
use crate::history::HistoryStore;
use crate::interpreter::{Clock, RecordInterpreter, SystemClock};
use crate::platform::Platform;
use crate::storage::{keys, KeyValueStore};
use crate::transport::{Outcome, Transport, TransportEvent};
use crate::types::{
    BridgeEvent, ChannelId, DeviceIdentity, HealthSample, LinkEvent, LinkState, Record,
};

/// Title of the alert raised for wear reminders
pub const WEAR_REMINDER_TITLE: &str = "Band Reminder";

/// Collaborators the manager drives
#[derive(Clone)]
pub struct LinkDeps {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn KeyValueStore>,
    pub bridge: Arc<Bridge>,
    pub platform: Arc<dyn Platform>,
    pub clock: Arc<dyn Clock>,
}

impl LinkDeps {
    /// Dependencies using the system clock
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        bridge: Arc<Bridge>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            transport,
            store,
            bridge,
            platform,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Counters describing the current manager instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub frames_decoded: u64,
    pub frames_discarded: u64,
    pub samples_saved: u64,
    pub wear_reminders: u64,
}

struct Inner {
    state: LinkState,
    decoder: FrameDecoder,
    history: HistoryStore,
    reconnect: Option<JoinHandle<()>>,
    /// Set by `shutdown` until the next explicit `connect`
    shut_down: bool,
    stats: LinkStats,
}

/// Work queued under the lock and delivered after it is released
enum Outgoing {
    Sample(HealthSample),
    WearReminder,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    interpreter: RecordInterpreter,
    transport: Arc<dyn Transport>,
    store: Arc<dyn KeyValueStore>,
    bridge: Arc<Bridge>,
    platform: Arc<dyn Platform>,
    channel: ChannelId,
    requested_unit_size: u16,
    reconnect_delay: Duration,
    auto_reconnect: bool,
    reminder_message: String,
    runtime: Option<Handle>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected`, loading history from the store.
    ///
    /// Reconnection timers run on the tokio runtime current at construction;
    /// without one, reconnection is logged as unavailable.
    pub fn new(config: &LinkConfig, deps: LinkDeps) -> Arc<Self> {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("no tokio runtime available, automatic reconnection disabled");
        }

        let history = HistoryStore::open_with_clock(
            deps.store.clone(),
            config.history.capacity,
            deps.clock.clone(),
        );
        let interpreter = RecordInterpreter::new(deps.clock)
            .with_cycle_minutes(config.interpreter.pending_cycle_minutes)
            .with_reminder_message(config.interpreter.wear_reminder_message.clone());

        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                decoder: FrameDecoder::new(config.decoder.buffer_cap),
                history,
                reconnect: None,
                shut_down: false,
                stats: LinkStats::default(),
            }),
            interpreter,
            transport: deps.transport,
            store: deps.store,
            bridge: deps.bridge,
            platform: deps.platform,
            channel: config.channel(),
            requested_unit_size: config.link.requested_unit_size,
            reconnect_delay: config.reconnect_delay(),
            auto_reconnect: config.link.auto_reconnect,
            reminder_message: config.interpreter.wear_reminder_message.clone(),
            runtime,
            this: this.clone(),
        })
    }

    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// Whether the radio link is up
    pub fn is_connected(&self) -> bool {
        self.lock().state.is_link_up()
    }

    /// Whether the link is connected or a connection attempt is in flight
    pub fn is_connected_or_connecting(&self) -> bool {
        self.lock().state != LinkState::Disconnected
    }

    pub fn stats(&self) -> LinkStats {
        self.lock().stats
    }

    pub fn latest(&self) -> Option<HealthSample> {
        self.lock().history.latest().cloned()
    }

    /// Retained samples, oldest first
    pub fn history(&self) -> Vec<HealthSample> {
        self.lock().history.all()
    }

    /// Characters waiting in the frame buffer
    pub fn buffered_len(&self) -> usize {
        self.lock().decoder.buffered().len()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.lock()
            .reconnect
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Connect to the saved device.
    ///
    /// A no-op unless the link is `Disconnected`. A missing identity, a
    /// disabled radio or a transport error schedules another attempt.
    pub fn connect(&self) {
        let mut inner = self.lock();
        if inner.state != LinkState::Disconnected {
            debug!(state = %inner.state, "connect ignored, link already in progress");
            return;
        }
        inner.shut_down = false;

        let identity = match self.saved_identity() {
            Some(identity) => identity,
            None => {
                warn!("no paired device saved, cannot connect");
                self.schedule_reconnect(&mut inner);
                return;
            }
        };

        if !self.transport.is_enabled() {
            warn!("bluetooth is off, cannot connect");
            self.schedule_reconnect(&mut inner);
            return;
        }

        inner.stats.connect_attempts += 1;
        match self.transport.connect(&identity, self.auto_reconnect) {
            Ok(()) => {
                info!(address = %identity, "connecting to band");
                apply(&mut inner, LinkEvent::Connect);
            }
            Err(e) => {
                error!(address = %identity, error = %e, "connect attempt failed");
                self.schedule_reconnect(&mut inner);
            }
        }
    }

    /// Feed one transport callback through the state machine
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LinkEstablished => self.on_link_established(),
            TransportEvent::UnitSizeNegotiated { size, outcome } => {
                self.on_unit_size_negotiated(size, outcome)
            }
            TransportEvent::ChannelsDiscovered { outcome } => self.on_channels_discovered(outcome),
            TransportEvent::DataReceived(bytes) => self.on_data_received(&bytes),
            TransportEvent::LinkLost => self.on_link_lost(),
        }
    }

    /// Pump transport events until the sender side closes
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("transport event stream closed");
    }

    /// Tear the link down without emitting events.
    ///
    /// Aborts any pending reconnection, clears the frame buffer and closes the
    /// transport. History is kept. Links the transport reports afterwards are
    /// ignored until the next `connect`.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.reconnect.take() {
            handle.abort();
            debug!("pending reconnect cancelled");
        }
        inner.decoder.reset();
        inner.shut_down = true;
        if inner.state != LinkState::Disconnected {
            apply(&mut inner, LinkEvent::LinkLost);
        }
        self.transport.close();
        info!("link shut down");
    }

    fn on_link_established(&self) {
        let mut inner = self.lock();
        if inner.state == LinkState::Disconnected {
            if inner.shut_down {
                debug!("link established after shutdown, ignoring");
                return;
            }
            info!("link re-established by transport auto-connect");
            apply(&mut inner, LinkEvent::Connect);
        }
        if !apply(&mut inner, LinkEvent::LinkEstablished) {
            return;
        }
        inner.decoder.reset();

        if !self.transport.request_larger_unit(self.requested_unit_size) {
            warn!(
                size = self.requested_unit_size,
                "unit size request not dispatched, discovering channels"
            );
            apply(&mut inner, LinkEvent::NegotiationFinished);
            self.discover_channels();
        }
    }

    fn on_unit_size_negotiated(&self, size: u16, outcome: Outcome) {
        let mut inner = self.lock();
        if !apply(&mut inner, LinkEvent::NegotiationFinished) {
            return;
        }
        match outcome {
            Outcome::Success => info!(size, "unit size negotiated"),
            Outcome::Failure(status) => warn!(size, status, "unit size negotiation failed"),
        }
        self.discover_channels();
    }

    fn discover_channels(&self) {
        if let Err(e) = self.transport.discover_channels() {
            warn!(error = %e, "channel discovery could not start");
        }
    }

    fn on_channels_discovered(&self, outcome: Outcome) {
        let mut inner = self.lock();
        if inner.state != LinkState::Subscribing {
            debug!(state = %inner.state, "channel discovery result ignored");
            return;
        }

        if let Outcome::Failure(status) = outcome {
            // No retry: the link idles in Subscribing until it drops.
            warn!(status, "channel discovery failed");
            apply(&mut inner, LinkEvent::ChannelsDiscovered { success: false });
            return;
        }

        if let Err(e) = self.transport.enable_notifications(&self.channel) {
            warn!(
                service = %self.channel.service,
                characteristic = %self.channel.characteristic,
                error = %e,
                "cannot enable notifications"
            );
            return;
        }

        apply(&mut inner, LinkEvent::ChannelsDiscovered { success: true });
        drop(inner);

        info!("link active");
        self.bridge
            .publish_all(&BridgeEvent::ConnectionStatus { connected: true });
    }

    fn on_data_received(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        if inner.state.next(LinkEvent::DataReceived).is_none() {
            debug!(state = %inner.state, len = bytes.len(), "data outside active link dropped");
            return;
        }

        let frames = inner.decoder.feed(bytes);
        let mut outgoing = Vec::new();
        for frame in frames {
            inner.stats.frames_decoded += 1;
            match self.interpreter.interpret(&frame) {
                Some(Record::Sample(sample)) => {
                    inner.history.append(sample.clone());
                    inner.stats.samples_saved += 1;
                    outgoing.push(Outgoing::Sample(sample));
                }
                Some(Record::WearReminder) => {
                    inner.stats.wear_reminders += 1;
                    outgoing.push(Outgoing::WearReminder);
                }
                None => inner.stats.frames_discarded += 1,
            }
        }
        drop(inner);

        for item in outgoing {
            match item {
                Outgoing::Sample(sample) => {
                    self.bridge
                        .publish_all(&BridgeEvent::HealthDataReceived(sample));
                }
                Outgoing::WearReminder => {
                    self.platform
                        .show_alert(WEAR_REMINDER_TITLE, &self.reminder_message);
                    self.bridge.publish(&BridgeEvent::NotificationReceived {
                        message: self.reminder_message.clone(),
                    });
                }
            }
        }
    }

    fn on_link_lost(&self) {
        {
            let mut inner = self.lock();
            if !apply(&mut inner, LinkEvent::LinkLost) {
                return;
            }
            inner.decoder.reset();
        }

        self.bridge
            .publish_all(&BridgeEvent::ConnectionStatus { connected: false });

        let mut inner = self.lock();
        if inner.state == LinkState::Disconnected {
            self.schedule_reconnect(&mut inner);
        }
    }

    fn schedule_reconnect(&self, inner: &mut Inner) {
        if let Some(handle) = &inner.reconnect {
            if !handle.is_finished() {
                debug!("reconnect already scheduled");
                return;
            }
        }
        let Some(runtime) = &self.runtime else {
            error!("cannot schedule reconnect without a tokio runtime");
            return;
        };

        let delay = self.reconnect_delay;
        let this = self.this.clone();
        info!(delay_secs = delay.as_secs(), "scheduling reconnect");
        inner.stats.reconnects_scheduled += 1;
        inner.reconnect = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.on_reconnect_timer();
            }
        }));
    }

    fn on_reconnect_timer(&self) {
        let state = {
            let mut inner = self.lock();
            inner.reconnect = None;
            inner.state
        };
        if state == LinkState::Disconnected {
            info!("reconnecting");
            self.connect();
        } else {
            debug!(state = %state, "reconnect timer fired, link already in progress");
        }
    }

    fn saved_identity(&self) -> Option<DeviceIdentity> {
        match self.store.get_string(keys::LAST_DEVICE_ADDRESS) {
            Ok(Some(address)) => DeviceIdentity::new(address).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cannot read saved device address");
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = inner.reconnect.take() {
            handle.abort();
        }
    }
}

/// Move along a defined edge, returning whether one existed
fn apply(inner: &mut Inner, event: LinkEvent) -> bool {
    match inner.state.next(event) {
        Some(next) => {
            if next != inner.state {
                info!(from = %inner.state, to = %next, "link state changed");
            }
            inner.state = next;
            true
        }
        None => {
            debug!(state = %inner.state, event = ?event, "no transition for event");
            false
        }
    }
}
