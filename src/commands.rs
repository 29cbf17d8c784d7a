//! Commands from the consuming application
//!
//! Each command either succeeds or fails with one of three stable
//! categories (`SERVICE_ERROR`, `SAVE_ERROR`, `GET_ERROR`). `Command` and
//! `CommandResponse` carry the same operations over a JSON method channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::CommandError;
use crate::history::history_json;
use crate::service::HealthService;
use crate::steps::{current_steps, StepCounter};
use crate::storage::{keys, KeyValueStore};
use crate::types::DeviceIdentity;

/// Method names understood by `CommandHandler::dispatch`
pub mod methods {
    pub const START_SERVICE: &str = "startBackgroundService";
    pub const STOP_SERVICE: &str = "stopBackgroundService";
    pub const SET_DEVICE_IDENTITY: &str = "saveDeviceAddress";
    pub const QUERY_HISTORY: &str = "getHealthDataHistory";
    pub const START_STEP_COUNTER: &str = "startStepCounter";
    pub const STOP_STEP_COUNTER: &str = "stopStepCounter";
    pub const QUERY_CURRENT_STEPS: &str = "getSteps";
}

/// A method-channel call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Command {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Reply to a method-channel call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Success { result: Value },
    Error { code: String, message: String },
    NotImplemented,
}

impl From<Result<Value, CommandError>> for CommandResponse {
    fn from(result: Result<Value, CommandError>) -> Self {
        match result {
            Ok(result) => CommandResponse::Success { result },
            Err(e) => CommandResponse::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

pub struct CommandHandler {
    service: Arc<HealthService>,
    steps: Arc<StepCounter>,
    store: Arc<dyn KeyValueStore>,
    version_code: i64,
}

impl CommandHandler {
    pub fn new(
        service: Arc<HealthService>,
        steps: Arc<StepCounter>,
        store: Arc<dyn KeyValueStore>,
        version_code: i64,
    ) -> Self {
        Self {
            service,
            steps,
            store,
            version_code,
        }
    }

    /// Start the health service unless it is already running
    pub fn start_service(&self) -> Result<(), CommandError> {
        if self.service.is_running() {
            debug!("health service already running, skipping start");
            return Ok(());
        }
        self.service
            .start(self.version_code)
            .map(|outcome| debug!(?outcome, "start_service"))
            .map_err(|e| CommandError::Service(e.to_string()))
    }

    pub fn stop_service(&self) -> Result<(), CommandError> {
        self.service
            .stop()
            .map_err(|e| CommandError::Service(e.to_string()))
    }

    /// Save the paired band's address for the next connection attempt
    pub fn set_device_identity(&self, address: &str) -> Result<(), CommandError> {
        let identity =
            DeviceIdentity::new(address).map_err(|e| CommandError::Save(e.to_string()))?;
        self.store
            .put(keys::LAST_DEVICE_ADDRESS, Value::from(identity.as_str()))
            .map_err(|e| CommandError::Save(e.to_string()))?;
        info!(address = %identity, "device identity saved");
        Ok(())
    }

    /// Persisted history as a JSON array, oldest first
    pub fn query_history(&self) -> Result<String, CommandError> {
        let history =
            history_json(self.store.as_ref()).map_err(|e| CommandError::Get(e.to_string()))?;
        debug!(len = history.len(), "history retrieved");
        Ok(history)
    }

    pub fn start_step_counter(&self) -> Result<(), CommandError> {
        self.steps
            .start()
            .map_err(|e| CommandError::Service(e.to_string()))
    }

    pub fn stop_step_counter(&self) -> Result<(), CommandError> {
        self.steps
            .stop()
            .map_err(|e| CommandError::Service(e.to_string()))
    }

    pub fn query_current_steps(&self) -> Result<i64, CommandError> {
        current_steps(self.store.as_ref()).map_err(|e| CommandError::Get(e.to_string()))
    }

    /// Run a method-channel call
    pub fn dispatch(&self, command: &Command) -> CommandResponse {
        let result = match command.method.as_str() {
            methods::START_SERVICE => self.start_service().map(|()| Value::Bool(true)),
            methods::STOP_SERVICE => self.stop_service().map(|()| Value::Bool(true)),
            methods::SET_DEVICE_IDENTITY => match command.arguments.as_str() {
                Some(address) => self.set_device_identity(address).map(|()| Value::Bool(true)),
                None => Err(CommandError::Save("address must be a string".to_string())),
            },
            methods::QUERY_HISTORY => self.query_history().map(Value::String),
            methods::START_STEP_COUNTER => self.start_step_counter().map(|()| Value::Bool(true)),
            methods::STOP_STEP_COUNTER => self.stop_step_counter().map(|()| Value::Bool(true)),
            methods::QUERY_CURRENT_STEPS => self.query_current_steps().map(Value::from),
            other => {
                debug!(method = other, "unknown method");
                return CommandResponse::NotImplemented;
            }
        };
        result.into()
    }

    /// Parse a JSON call, run it and serialize the reply
    pub fn dispatch_json(&self, call: &str) -> Result<String, serde_json::Error> {
        let command: Command = serde_json::from_str(call)?;
        serde_json::to_string(&self.dispatch(&command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::LinkConfig;
    use crate::connection::{ConnectionManager, LinkDeps};
    use crate::platform::RecordingPlatform;
    use crate::storage::MemoryStore;
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        handler: CommandHandler,
        service: Arc<HealthService>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(RecordingPlatform::new());
        let bridge = Arc::new(Bridge::new());
        let deps = LinkDeps::new(
            transport.clone(),
            store.clone(),
            bridge.clone(),
            platform.clone(),
        );
        let manager = ConnectionManager::new(&LinkConfig::default(), deps);
        let service = Arc::new(HealthService::new(manager, store.clone(), platform));
        let steps = Arc::new(StepCounter::new(store.clone(), bridge));
        Fixture {
            handler: CommandHandler::new(service.clone(), steps, store.clone(), 3),
            service,
            transport,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_service_is_idempotent() {
        let f = fixture();
        f.handler.set_device_identity("AA:BB:CC:DD:EE:FF").unwrap();
        f.handler.start_service().unwrap();
        f.handler.start_service().unwrap();
        assert!(f.service.is_running());
        assert_eq!(f.transport.connect_count(), 1);

        f.handler.stop_service().unwrap();
        assert!(!f.service.is_running());
    }

    #[test]
    fn test_blank_address_is_save_error() {
        let f = fixture();
        let err = f.handler.set_device_identity("   ").unwrap_err();
        assert_eq!(err.code(), "SAVE_ERROR");
        assert_eq!(f.store.get(keys::LAST_DEVICE_ADDRESS).unwrap(), None);
    }

    #[test]
    fn test_address_is_trimmed() {
        let f = fixture();
        f.handler.set_device_identity(" AA:BB ").unwrap();
        assert_eq!(
            f.store.get_string(keys::LAST_DEVICE_ADDRESS).unwrap(),
            Some("AA:BB".to_string())
        );
    }

    #[test]
    fn test_queries_default_when_empty() {
        let f = fixture();
        assert_eq!(f.handler.query_history().unwrap(), "[]");
        assert_eq!(f.handler.query_current_steps().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_steps_is_get_error() {
        let f = fixture();
        f.store.put(keys::CURRENT_STEPS, json!("many")).unwrap();
        let err = f.handler.query_current_steps().unwrap_err();
        assert_eq!(err.code(), "GET_ERROR");
    }

    #[test]
    fn test_dispatch() {
        let f = fixture();
        assert_eq!(
            f.handler
                .dispatch(&Command::new(methods::SET_DEVICE_IDENTITY, json!("AA:BB"))),
            CommandResponse::Success {
                result: json!(true)
            }
        );
        assert_eq!(
            f.handler
                .dispatch(&Command::new(methods::SET_DEVICE_IDENTITY, json!(42))),
            CommandResponse::Error {
                code: "SAVE_ERROR".to_string(),
                message: "address must be a string".to_string(),
            }
        );
        assert_eq!(
            f.handler
                .dispatch(&Command::new(methods::QUERY_CURRENT_STEPS, Value::Null)),
            CommandResponse::Success { result: json!(0) }
        );
        assert_eq!(
            f.handler.dispatch(&Command::new("reboot", Value::Null)),
            CommandResponse::NotImplemented
        );
    }

    #[test]
    fn test_dispatch_json() {
        let f = fixture();
        let reply = f
            .handler
            .dispatch_json(r#"{"method":"getHealthDataHistory"}"#)
            .unwrap();
        assert_eq!(reply, r#"{"status":"success","result":"[]"}"#);

        let reply = f.handler.dispatch_json(r#"{"method":"nope"}"#).unwrap();
        assert_eq!(reply, r#"{"status":"not_implemented"}"#);

        assert!(f.handler.dispatch_json("not json").is_err());
    }
}
