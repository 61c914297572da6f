// Integration test: discovery bookkeeping
//
// Drives a DeviceRegistry with a hand-fed scanner on a paused clock and checks
// deduplication, event fan-out and the discovery timeout.

use bluestsdk_core::transport::mock::{ManualScanner, MockTransport};
use bluestsdk_core::{
    Advertisement, DeviceRegistry, DiscoveryListener, FeatureRegistry, NodeSession, NodeState,
    SdkConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<bool>>,
    discovered: Mutex<Vec<String>>,
}

impl DiscoveryListener for Recorder {
    fn on_discovery_change(&self, _registry: &DeviceRegistry, enabled: bool) {
        self.changes.lock().push(enabled);
    }

    fn on_node_discovered(&self, _registry: &DeviceRegistry, node: &NodeSession) {
        self.discovered.lock().push(node.tag().to_string());
    }
}

fn advertisement(address: &str, rssi: i32) -> Advertisement {
    // name "SensorTile", then vendor field: v1, SensorTile, acc|gyro|mag|pressure
    let mut data = vec![0x0B, 0x09];
    data.extend_from_slice(b"SensorTile");
    data.extend_from_slice(&[0x07, 0xFF, 0x01, 0x02, 0x00, 0xF0, 0x00, 0x00]);
    Advertisement {
        address: address.to_string(),
        rssi,
        data,
    }
}

fn setup() -> (DeviceRegistry, Arc<ManualScanner>, Arc<Recorder>) {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let scanner = Arc::new(ManualScanner::new());
    let registry = DeviceRegistry::new(
        scanner.clone(),
        Arc::new(MockTransport::new()),
        Arc::new(FeatureRegistry::with_default_boards()),
        SdkConfig::default(),
    );
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn DiscoveryListener> = recorder.clone();
    assert!(registry.add_listener(&listener));
    (registry, scanner, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_discovery_scenario_with_timeout() {
    let (registry, scanner, recorder) = setup();

    assert!(registry.start_discovery(Some(Duration::from_millis(10_000))));
    assert!(scanner.is_scanning());

    sleep(Duration::from_millis(50)).await;
    assert!(scanner.push(advertisement("AA:BB:CC:DD:EE:FF", -60)));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.discovered.lock().clone(), vec!["AA:BB:CC:DD:EE:FF"]);
    println!("✓ One discovery event at t=50ms");

    sleep(Duration::from_millis(9_900)).await;
    assert!(registry.is_discovering());
    assert_eq!(recorder.changes.lock().clone(), vec![true]);

    sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_discovering());
    assert!(!scanner.is_scanning());
    assert_eq!(recorder.changes.lock().clone(), vec![true, false]);
    println!("✓ Discovery stopped once at t=10000ms");

    sleep(Duration::from_millis(10_000)).await;
    assert_eq!(recorder.changes.lock().len(), 2);
    assert_eq!(recorder.discovered.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resighting_refreshes_without_event() {
    let (registry, scanner, recorder) = setup();
    assert!(registry.start_discovery(None));

    scanner.push(advertisement("AA:BB:CC:DD:EE:FF", -60));
    sleep(Duration::from_millis(10)).await;
    scanner.push(advertisement("AA:BB:CC:DD:EE:FF", -42));
    scanner.push(advertisement("11:22:33:44:55:66", -80));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(registry.nodes().len(), 2);
    assert_eq!(recorder.discovered.lock().len(), 2);
    let node = registry
        .node_with_tag("AA:BB:CC:DD:EE:FF")
        .expect("tracked");
    assert_eq!(node.last_rssi(), Some(-42));
    assert_eq!(node.name(), Some("SensorTile"));
    let names: Vec<&str> = node.features().iter().map(|f| f.name()).collect();
    assert_eq!(
        names,
        vec!["Accelerometer", "Gyroscope", "Magnetometer", "Pressure"]
    );
    println!("✓ Re-sighting only refreshed RSSI");

    assert!(!registry.add_node(node.clone()));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(recorder.discovered.lock().len(), 2);
    println!("✓ Duplicate add_node rejected without event");
}

#[tokio::test(start_paused = true)]
async fn test_manual_stop_cancels_timeout() {
    let (registry, _scanner, recorder) = setup();

    assert!(registry.start_discovery(Some(Duration::from_secs(10))));
    sleep(Duration::from_secs(1)).await;
    assert!(registry.stop_discovery());
    assert!(registry.start_discovery(None));

    sleep(Duration::from_secs(20)).await;
    assert!(registry.is_discovering());
    assert_eq!(recorder.changes.lock().clone(), vec![true, false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_sighted_nodes_stay_idle_and_unsighted_get_lost() {
    let (registry, scanner, _recorder) = setup();
    assert!(registry.start_discovery(None));

    scanner.push(advertisement("AA:BB:CC:DD:EE:FF", -60));
    scanner.push(advertisement("11:22:33:44:55:66", -60));
    for _ in 0..5 {
        sleep(Duration::from_millis(500)).await;
        scanner.push(advertisement("AA:BB:CC:DD:EE:FF", -61));
    }
    sleep(Duration::from_millis(100)).await;

    let seen = registry.node_with_tag("AA:BB:CC:DD:EE:FF").expect("tracked");
    let silent = registry.node_with_tag("11:22:33:44:55:66").expect("tracked");
    assert_eq!(seen.state(), NodeState::Idle);
    assert_eq!(silent.state(), NodeState::Lost);
    println!("✓ Liveness follows advertisement re-sightings");
}
