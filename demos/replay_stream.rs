//! Drive a connection manager through a scripted link session

use std::sync::Arc;

use synheart_link::bridge::RecordingSink;
use synheart_link::platform::LogPlatform;
use synheart_link::storage::keys;
use synheart_link::transport::{MockTransport, Outcome};
use synheart_link::{
    Bridge, ConnectionManager, KeyValueStore, LinkConfig, LinkDeps, MemoryStore, TransportEvent,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let store = Arc::new(MemoryStore::new());
    if let Err(e) = store.put(keys::LAST_DEVICE_ADDRESS, "AA:BB:CC:DD:EE:FF".into()) {
        eprintln!("Error: {e}");
        return;
    }

    let ui = Arc::new(RecordingSink::new());
    let bridge = Arc::new(Bridge::new());
    bridge.attach_ui(ui.clone());

    let deps = LinkDeps::new(
        Arc::new(MockTransport::new()),
        store,
        bridge,
        Arc::new(LogPlatform),
    );
    let manager = ConnectionManager::new(&LinkConfig::default(), deps);

    manager.connect();
    let session = [
        TransportEvent::LinkEstablished,
        TransportEvent::UnitSizeNegotiated {
            size: 512,
            outcome: Outcome::Success,
        },
        TransportEvent::ChannelsDiscovered {
            outcome: Outcome::Success,
        },
        TransportEvent::DataReceived(b"{\"heartRate\":78,\"ste".to_vec()),
        TransportEvent::DataReceived(b"ps\":4210,\"spo2\":97}\r\n".to_vec()),
        TransportEvent::DataReceived(b"{\"message\":\"Please wear your band\"}".to_vec()),
        TransportEvent::DataReceived(
            b"{\"heartRate\":71,\"pending\":true,\"cycleCount\":2}".to_vec(),
        ),
        TransportEvent::LinkLost,
    ];
    for event in session {
        manager.handle_event(event);
    }

    for event in ui.events() {
        match serde_json::to_string(&event) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    manager.shutdown();
}
