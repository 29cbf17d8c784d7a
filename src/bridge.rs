//! Event bridge to the consuming application
//!
//! The UI listener comes and goes with the application's lifecycle, so
//! delivery is best-effort: `publish` reports whether anyone received the
//! event and never fails.

use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::types::BridgeEvent;

/// A destination for bridge events
pub trait EventSink: Send + Sync {
    /// Deliver an event, returning `false` if the receiver is gone
    fn deliver(&self, event: &BridgeEvent) -> bool;
}

/// UI sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &BridgeEvent) -> bool {
        self.tx.send(event.clone()).is_ok()
    }
}

/// Cross-process style fan-out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<BridgeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn deliver(&self, event: &BridgeEvent) -> bool {
        self.tx.send(event.clone()).is_ok()
    }
}

/// Routes events to the attached UI sink and the broadcast sink
#[derive(Default)]
pub struct Bridge {
    ui: RwLock<Option<Arc<dyn EventSink>>>,
    broadcast: Option<Arc<dyn EventSink>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broadcast(broadcast: Arc<dyn EventSink>) -> Self {
        Self {
            ui: RwLock::new(None),
            broadcast: Some(broadcast),
        }
    }

    /// Attach the UI listener, replacing any previous one
    pub fn attach_ui(&self, sink: Arc<dyn EventSink>) {
        sink.deliver(&BridgeEvent::Log {
            message: "Event channel connected".to_string(),
        });
        if let Ok(mut ui) = self.ui.write() {
            *ui = Some(sink);
        }
    }

    pub fn detach_ui(&self) {
        if let Ok(mut ui) = self.ui.write() {
            *ui = None;
        }
    }

    pub fn has_ui(&self) -> bool {
        self.ui.read().map(|ui| ui.is_some()).unwrap_or(false)
    }

    /// Deliver to the UI listener only
    pub fn publish(&self, event: &BridgeEvent) -> bool {
        let sink = self.ui.read().ok().and_then(|ui| ui.clone());
        match sink {
            Some(sink) => {
                let delivered = sink.deliver(event);
                if !delivered {
                    debug!(kind = event.kind(), "ui listener gone, event dropped");
                }
                delivered
            }
            None => {
                debug!(kind = event.kind(), "no ui listener attached, event dropped");
                false
            }
        }
    }

    /// Deliver to the broadcast sink only
    pub fn broadcast(&self, event: &BridgeEvent) -> bool {
        match &self.broadcast {
            Some(sink) => sink.deliver(event),
            None => false,
        }
    }

    /// Deliver to the UI listener and the broadcast sink
    pub fn publish_all(&self, event: &BridgeEvent) -> bool {
        let ui = self.publish(event);
        let broadcast = self.broadcast(event);
        ui || broadcast
    }
}

/// Sink that records everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<BridgeEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<BridgeEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &BridgeEvent) -> bool {
        match self.events.lock() {
            Ok(mut events) => {
                events.push(event.clone());
                true
            }
            Err(_) => false,
        }
    }
}
