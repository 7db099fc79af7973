//! Integration tests driving the connection manager through a mock BLE
//! central: bounded-retry reconnection timing, scan timeout, and
//! last-device persistence.

use async_trait::async_trait;
use runpulse::sensors::adapter::{AdapterEvent, BleCentral};
use runpulse::sensors::manager::DeviceConnectionManager;
use runpulse::sensors::types::{
    ConnectionFailure, ConnectionState, DiscoveredDevice, SensorConfig, SensorError, SensorEvent,
};
use runpulse::storage::config::{DeviceStore, MemoryDeviceStore};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted BLE central: connect outcomes are programmed per call and the
/// test injects adapter events directly.
struct MockCentral {
    events_rx: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
    connect_results: Arc<Mutex<VecDeque<Result<String, String>>>>,
    connect_times: Arc<Mutex<Vec<tokio::time::Instant>>>,
}

#[derive(Clone)]
struct MockHandle {
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    connect_results: Arc<Mutex<VecDeque<Result<String, String>>>>,
    connect_times: Arc<Mutex<Vec<tokio::time::Instant>>>,
}

fn mock_central() -> (MockCentral, MockHandle) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connect_results = Arc::new(Mutex::new(VecDeque::new()));
    let connect_times = Arc::new(Mutex::new(Vec::new()));
    (
        MockCentral {
            events_rx: Some(events_rx),
            connect_results: connect_results.clone(),
            connect_times: connect_times.clone(),
        },
        MockHandle {
            events_tx,
            connect_results,
            connect_times,
        },
    )
}

impl MockHandle {
    fn push_connect_ok(&self, name: &str) {
        self.connect_results
            .lock()
            .unwrap()
            .push_back(Ok(name.to_string()));
    }

    fn push_connect_err(&self, message: &str) {
        self.connect_results
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    fn drop_link(&self, device_id: &str) {
        self.events_tx
            .send(AdapterEvent::DeviceDisconnected {
                device_id: device_id.to_string(),
            })
            .unwrap();
    }

    fn discover(&self, device_id: &str, name: &str) {
        self.events_tx
            .send(AdapterEvent::DeviceDiscovered(DiscoveredDevice {
                device_id: device_id.to_string(),
                name: name.to_string(),
                signal_strength: Some(-60),
                has_heart_rate: true,
                has_cadence: true,
                vendor_match: false,
                last_seen: std::time::Instant::now(),
            }))
            .unwrap();
    }

    fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.connect_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn start_scan(&self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<String, SensorError> {
        self.connect_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        match self.connect_results.lock().unwrap().pop_front() {
            Some(Ok(name)) => Ok(name),
            Some(Err(message)) => Err(SensorError::ConnectionFailed(message)),
            None => Err(SensorError::DeviceNotFound(device_id.to_string())),
        }
    }

    async fn disconnect(&self, _device_id: &str) -> Result<(), SensorError> {
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.take()
    }
}

fn manager_with_mock(
    config: SensorConfig,
) -> (DeviceConnectionManager, MockHandle, Arc<MemoryDeviceStore>) {
    let (central, handle) = mock_central();
    let store = Arc::new(MemoryDeviceStore::new());
    let manager = DeviceConnectionManager::new(Box::new(central), config, store.clone());
    (manager, handle, store)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_bounded_with_exponential_backoff() {
    let (mut manager, handle, _store) = manager_with_mock(SensorConfig::default());
    let events = manager.event_receiver();
    manager.start().unwrap();

    handle.push_connect_ok("HRM-Pro");
    manager.connect("dev-1");
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Connected {
            device_name: "HRM-Pro".to_string()
        }
    );

    // All three retry attempts fail.
    handle.push_connect_err("refused");
    handle.push_connect_err("refused");
    handle.push_connect_err("refused");

    handle.drop_link("dev-1");
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Reconnecting { attempt: 1 }
    );

    // 2s backoff, attempt 1 fails.
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Reconnecting { attempt: 2 }
    );

    // 4s backoff, attempt 2 fails.
    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Reconnecting { attempt: 3 }
    );

    // 8s backoff, attempt 3 fails: terminal.
    tokio::time::sleep(Duration::from_secs(8)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Failed {
            reason: ConnectionFailure::MaxReconnectAttemptsExceeded
        }
    );

    // Exactly 1 initial connect + 3 retries, spaced 2s/4s/8s.
    let times = handle.connect_times();
    assert_eq!(times.len(), 4);
    let tolerance = Duration::from_millis(500);
    for (i, expected) in [2u64, 4, 8].iter().enumerate() {
        let delta = times[i + 1] - times[i];
        let expected = Duration::from_secs(*expected);
        assert!(
            delta >= expected && delta <= expected + tolerance,
            "retry {} delayed {:?}, expected ~{:?}",
            i + 1,
            delta,
            expected
        );
    }

    // The terminal failure announces the fallback switch.
    let collected: Vec<SensorEvent> = events.try_iter().collect();
    assert!(collected.iter().any(|e| matches!(
        e,
        SensorEvent::FallbackActivated {
            reason: ConnectionFailure::MaxReconnectAttemptsExceeded
        }
    )));

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn successful_retry_stops_the_sequence() {
    let (mut manager, handle, _store) = manager_with_mock(SensorConfig::default());
    manager.start().unwrap();

    handle.push_connect_ok("HRM-Pro");
    manager.connect("dev-1");
    settle().await;

    // First retry fails, second succeeds.
    handle.push_connect_err("refused");
    handle.push_connect_ok("HRM-Pro");

    handle.drop_link("dev-1");
    settle().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Reconnecting { attempt: 2 }
    );

    tokio::time::sleep(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Connected {
            device_name: "HRM-Pro".to_string()
        }
    );
    // 1 initial + 2 retries, nothing further scheduled.
    assert_eq!(handle.connect_times().len(), 3);

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_cancels_pending_retry() {
    let (mut manager, handle, _store) = manager_with_mock(SensorConfig::default());
    manager.start().unwrap();

    handle.push_connect_ok("HRM-Pro");
    manager.connect("dev-1");
    settle().await;

    handle.drop_link("dev-1");
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Reconnecting { attempt: 1 }
    );

    manager.disconnect();
    settle().await;
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);

    // Long after the backoff would have fired, no retry ran.
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    assert_eq!(handle.connect_times().len(), 1);

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn scan_times_out_to_device_not_found() {
    let (mut manager, _handle, _store) = manager_with_mock(SensorConfig::default());
    manager.start().unwrap();

    manager.start_scanning();
    settle().await;
    assert_eq!(manager.current_state(), ConnectionState::Scanning);

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(
        manager.current_state(),
        ConnectionState::Failed {
            reason: ConnectionFailure::DeviceNotFound
        }
    );

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn scan_timeout_with_discoveries_returns_to_disconnected() {
    let (mut manager, handle, _store) = manager_with_mock(SensorConfig::default());
    let events = manager.event_receiver();
    manager.start().unwrap();

    manager.start_scanning();
    settle().await;
    handle.discover("dev-1", "Forerunner 255");
    settle().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);

    let collected: Vec<SensorEvent> = events.try_iter().collect();
    assert!(collected
        .iter()
        .any(|e| matches!(e, SensorEvent::Discovered(d) if d.device_id == "dev-1")));

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn successful_connect_records_last_device() {
    let (mut manager, handle, store) = manager_with_mock(SensorConfig::default());
    manager.start().unwrap();

    assert!(store.last_device().is_none());

    handle.push_connect_ok("HRM-Pro");
    manager.connect("dev-42");
    settle().await;

    let known = store.last_device().expect("device recorded after connect");
    assert_eq!(known.device_id, "dev-42");
    assert_eq!(known.name, "HRM-Pro");

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn connect_last_known_without_record_is_diagnostic_noop() {
    let (mut manager, _handle, _store) = manager_with_mock(SensorConfig::default());
    let events = manager.event_receiver();
    manager.start().unwrap();

    manager.connect_last_known();
    settle().await;

    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    let collected: Vec<SensorEvent> = events.try_iter().collect();
    assert!(collected
        .iter()
        .any(|e| matches!(e, SensorEvent::Error(_))));

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn connect_last_known_uses_recorded_device() {
    let (mut manager, handle, store) = manager_with_mock(SensorConfig::default());
    manager.start().unwrap();

    store.record(&runpulse::storage::config::KnownDevice {
        device_id: "dev-7".to_string(),
        name: "HRM-Pro".to_string(),
        last_connected_at: chrono::Utc::now(),
    });

    handle.push_connect_ok("HRM-Pro");
    manager.connect_last_known();
    settle().await;

    assert_eq!(
        manager.current_state(),
        ConnectionState::Connected {
            device_name: "HRM-Pro".to_string()
        }
    );

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unknown_device_id_is_not_retried() {
    let (mut manager, handle, _store) = manager_with_mock(SensorConfig::default());
    let events = manager.event_receiver();
    manager.start().unwrap();

    // No programmed result: the mock reports DeviceNotFound.
    manager.connect("ghost");
    settle().await;

    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    assert_eq!(handle.connect_times().len(), 1);
    let collected: Vec<SensorEvent> = events.try_iter().collect();
    assert!(collected
        .iter()
        .any(|e| matches!(e, SensorEvent::Error(_))));

    manager.shutdown();
}
