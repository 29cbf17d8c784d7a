//! Long-running host for the link
//!
//! `HealthService` models the background process that keeps the band
//! connected while the consuming application comes and goes. It records
//! whether it is running and which build started it; an instance started by
//! an outdated build stops itself instead of restart-looping.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::ServiceError;
use crate::platform::Platform;
use crate::storage::{keys, KeyValueStore};

/// Delay before the platform relaunches a host whose task was removed
pub const TASK_REMOVED_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Result of `HealthService::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyConnected,
    /// Started by a different build than the one last recorded; the instance
    /// stopped itself after recording the current build
    Stale { saved: i64, current: i64 },
}

pub struct HealthService {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn KeyValueStore>,
    platform: Arc<dyn Platform>,
    running: AtomicBool,
}

impl HealthService {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn KeyValueStore>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            manager,
            store,
            platform,
            running: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start or resume the host for build `version_code`
    pub fn start(&self, version_code: i64) -> Result<StartOutcome, ServiceError> {
        if let Some(saved) = self.store.get_i64(keys::SERVICE_VERSION_CODE)? {
            if saved != version_code {
                warn!(
                    saved,
                    current = version_code,
                    "host started by a different build, stopping outdated instance"
                );
                self.store.put_batch(vec![
                    (keys::SERVICE_VERSION_CODE, Value::from(version_code)),
                    (keys::SERVICE_RUNNING, Value::Bool(false)),
                ])?;
                self.running.store(false, Ordering::SeqCst);
                self.manager.shutdown();
                return Ok(StartOutcome::Stale {
                    saved,
                    current: version_code,
                });
            }
        }

        self.store.put_batch(vec![
            (keys::SERVICE_RUNNING, Value::Bool(true)),
            (keys::SERVICE_VERSION_CODE, Value::from(version_code)),
        ])?;
        self.running.store(true, Ordering::SeqCst);

        if self.manager.is_connected_or_connecting() {
            debug!(state = %self.manager.state(), "already connected or connecting");
            return Ok(StartOutcome::AlreadyConnected);
        }
        info!(version_code, "health service started");
        self.manager.connect();
        Ok(StartOutcome::Started)
    }

    /// Stop the host, tearing the link down without emitting events
    pub fn stop(&self) -> Result<(), ServiceError> {
        self.running.store(false, Ordering::SeqCst);
        self.manager.shutdown();
        self.store.put(keys::SERVICE_RUNNING, Value::Bool(false))?;
        info!("health service stopped");
        Ok(())
    }

    /// The user dismissed the application; ask to be relaunched
    pub fn on_task_removed(&self) {
        if !self.is_running() {
            return;
        }
        info!("task removed, scheduling restart");
        self.platform.schedule_restart(TASK_REMOVED_RESTART_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, RecordingSink};
    use crate::config::LinkConfig;
    use crate::connection::LinkDeps;
    use crate::platform::{PlatformCall, RecordingPlatform};
    use crate::storage::MemoryStore;
    use crate::transport::{MockTransport, Outcome, TransportCall, TransportEvent};
    use crate::types::LinkState;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        service: HealthService,
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
        platform: Arc<RecordingPlatform>,
        ui: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        store
            .put(keys::LAST_DEVICE_ADDRESS, json!("AA:BB:CC:DD:EE:FF"))
            .unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        let ui = Arc::new(RecordingSink::new());
        let bridge = Arc::new(Bridge::new());
        bridge.attach_ui(ui.clone());
        ui.take();

        let deps = LinkDeps::new(transport.clone(), store.clone(), bridge, platform.clone());
        let manager = ConnectionManager::new(&LinkConfig::default(), deps);
        Fixture {
            service: HealthService::new(manager, store.clone(), platform.clone()),
            transport,
            store,
            platform,
            ui,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_records_version_and_connects() {
        let f = fixture();
        assert_eq!(f.service.start(7).unwrap(), StartOutcome::Started);
        assert!(f.service.is_running());
        assert_eq!(f.store.get_bool(keys::SERVICE_RUNNING).unwrap(), Some(true));
        assert_eq!(f.store.get_i64(keys::SERVICE_VERSION_CODE).unwrap(), Some(7));
        assert_eq!(f.service.manager().state(), LinkState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_does_not_reconnect() {
        let f = fixture();
        f.service.start(7).unwrap();
        assert_eq!(f.service.start(7).unwrap(), StartOutcome::AlreadyConnected);
        assert_eq!(f.transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_build_stops_itself() {
        let f = fixture();
        f.store
            .put_batch(vec![
                (keys::SERVICE_VERSION_CODE, json!(6)),
                (keys::SERVICE_RUNNING, json!(true)),
            ])
            .unwrap();

        assert_eq!(
            f.service.start(7).unwrap(),
            StartOutcome::Stale {
                saved: 6,
                current: 7
            }
        );
        assert!(!f.service.is_running());
        assert_eq!(f.store.get_bool(keys::SERVICE_RUNNING).unwrap(), Some(false));
        assert_eq!(f.store.get_i64(keys::SERVICE_VERSION_CODE).unwrap(), Some(7));
        assert_eq!(f.transport.connect_count(), 0);

        // The marker now matches, so the next start proceeds normally.
        assert_eq!(f.service.start(7).unwrap(), StartOutcome::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_quietly() {
        let f = fixture();
        f.service.start(1).unwrap();
        f.transport.take_calls();

        f.service.stop().unwrap();
        assert!(!f.service.is_running());
        assert_eq!(f.store.get_bool(keys::SERVICE_RUNNING).unwrap(), Some(false));
        assert_eq!(f.service.manager().state(), LinkState::Disconnected);
        assert_eq!(f.transport.take_calls(), vec![TransportCall::Close]);
        assert!(f.ui.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_service_ignores_late_link() {
        let f = fixture();
        f.service.start(1).unwrap();
        f.service.stop().unwrap();

        let manager = f.service.manager();
        manager.handle_event(TransportEvent::LinkEstablished);
        manager.handle_event(TransportEvent::UnitSizeNegotiated {
            size: 512,
            outcome: Outcome::Success,
        });
        manager.handle_event(TransportEvent::ChannelsDiscovered {
            outcome: Outcome::Success,
        });

        assert!(!f.service.is_running());
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert!(f.ui.events().is_empty());

        assert_eq!(f.service.start(1).unwrap(), StartOutcome::Started);
        assert_eq!(manager.state(), LinkState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_removed_schedules_restart() {
        let f = fixture();
        f.service.on_task_removed();
        assert!(f.platform.calls().is_empty());

        f.service.start(1).unwrap();
        f.service.on_task_removed();
        assert_eq!(
            f.platform.calls(),
            vec![PlatformCall::ScheduleRestart(Duration::from_secs(1))]
        );
    }
}
