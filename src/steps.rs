//! Step counting
//!
//! The platform's step sensor reports a running total since boot. The counter
//! turns it into steps since a persisted baseline and publishes each update.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::StoreError;
use crate::storage::{keys, KeyValueStore};
use crate::types::BridgeEvent;

#[derive(Debug, Default)]
struct StepState {
    running: bool,
    /// Sensor total at the start of counting, loaded lazily on first reading
    baseline: Option<f64>,
}

pub struct StepCounter {
    store: Arc<dyn KeyValueStore>,
    bridge: Arc<Bridge>,
    state: Mutex<StepState>,
}

impl StepCounter {
    pub fn new(store: Arc<dyn KeyValueStore>, bridge: Arc<Bridge>) -> Self {
        Self {
            store,
            bridge,
            state: Mutex::new(StepState::default()),
        }
    }

    pub fn start(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.running {
            debug!("step counter already running");
            return Ok(());
        }
        self.store.put(keys::STEP_SERVICE_RUNNING, Value::Bool(true))?;
        state.running = true;
        state.baseline = None;
        info!("step counter started");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.running = false;
        state.baseline = None;
        self.store.put(keys::STEP_SERVICE_RUNNING, Value::Bool(false))?;
        info!("step counter stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Handle a sensor reading, returning the steps counted since the baseline
    pub fn on_sensor_total(&self, total: f64) -> Option<i64> {
        if !total.is_finite() || total < 0.0 {
            warn!(total, "invalid step sensor reading ignored");
            return None;
        }

        let mut state = self.lock();
        if !state.running {
            debug!(total, "step reading while stopped ignored");
            return None;
        }

        let stored = match state.baseline {
            Some(baseline) => Some(baseline),
            None => self.stored_baseline(),
        };
        let mut baseline = stored.unwrap_or(total);
        if baseline > total {
            info!(baseline, total, "step sensor reset, rebasing");
            baseline = total;
        }
        if stored != Some(baseline) {
            if let Err(e) = self.store.put(keys::INITIAL_STEPS, Value::from(baseline)) {
                warn!(error = %e, "failed to persist step baseline");
            }
        }
        state.baseline = Some(baseline);
        drop(state);

        let steps = (total - baseline) as i64;
        debug!(total, baseline, steps, "step update");
        if let Err(e) = self.store.put(keys::CURRENT_STEPS, Value::from(steps)) {
            warn!(error = %e, "failed to persist step count");
        }
        self.bridge.publish_all(&BridgeEvent::StepData { steps });
        Some(steps)
    }

    /// Last persisted step count, zero if none
    pub fn current_steps(&self) -> Result<i64, StoreError> {
        current_steps(self.store.as_ref())
    }

    fn stored_baseline(&self) -> Option<f64> {
        match self.store.get_f64(keys::INITIAL_STEPS) {
            Ok(baseline) => baseline,
            Err(e) => {
                warn!(error = %e, "stored step baseline unreadable");
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn current_steps(store: &dyn KeyValueStore) -> Result<i64, StoreError> {
    Ok(store.get_i64(keys::CURRENT_STEPS)?.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingSink;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;

    fn counter() -> (StepCounter, Arc<MemoryStore>, Arc<RecordingSink>) {
        let store = Arc::new(MemoryStore::new());
        let ui = Arc::new(RecordingSink::new());
        let bridge = Arc::new(Bridge::new());
        bridge.attach_ui(ui.clone());
        ui.take();
        (StepCounter::new(store.clone(), bridge), store, ui)
    }

    #[test]
    fn test_first_reading_sets_baseline() {
        let (counter, store, ui) = counter();
        counter.start().unwrap();

        assert_eq!(counter.on_sensor_total(10_000.0), Some(0));
        assert_eq!(counter.on_sensor_total(10_250.0), Some(250));

        assert_eq!(store.get_f64(keys::INITIAL_STEPS).unwrap(), Some(10_000.0));
        assert_eq!(counter.current_steps().unwrap(), 250);
        assert_eq!(
            ui.take(),
            vec![
                BridgeEvent::StepData { steps: 0 },
                BridgeEvent::StepData { steps: 250 }
            ]
        );
    }

    #[test]
    fn test_baseline_survives_restart() {
        let (counter, store, _ui) = counter();
        counter.start().unwrap();
        counter.on_sensor_total(500.0);
        counter.stop().unwrap();

        let restarted = StepCounter::new(store, Arc::new(Bridge::new()));
        restarted.start().unwrap();
        assert_eq!(restarted.on_sensor_total(800.0), Some(300));
    }

    #[test]
    fn test_sensor_reset_rebases() {
        let (counter, store, _ui) = counter();
        store.put(keys::INITIAL_STEPS, Value::from(9_000.0)).unwrap();
        counter.start().unwrap();

        assert_eq!(counter.on_sensor_total(120.0), Some(0));
        assert_eq!(store.get_f64(keys::INITIAL_STEPS).unwrap(), Some(120.0));
        assert_eq!(counter.on_sensor_total(150.0), Some(30));
    }

    #[test]
    fn test_readings_ignored_while_stopped() {
        let (counter, store, ui) = counter();
        assert_eq!(counter.on_sensor_total(100.0), None);
        assert!(ui.events().is_empty());
        assert_eq!(store.get(keys::INITIAL_STEPS).unwrap(), None);
    }

    #[test]
    fn test_start_stop_flags() {
        let (counter, store, _ui) = counter();
        counter.start().unwrap();
        assert!(counter.is_running());
        assert_eq!(store.get_bool(keys::STEP_SERVICE_RUNNING).unwrap(), Some(true));
        counter.stop().unwrap();
        assert!(!counter.is_running());
        assert_eq!(store.get_bool(keys::STEP_SERVICE_RUNNING).unwrap(), Some(false));
    }

    #[test]
    fn test_current_steps_defaults_to_zero() {
        assert_eq!(current_steps(&MemoryStore::new()).unwrap(), 0);
    }
}
