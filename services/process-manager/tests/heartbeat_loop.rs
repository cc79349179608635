//! Heartbeat loop tests against a stand-in fleet manager.
//!
//! The stand-in records every heartbeat it receives so the tests can check
//! sequence ordering, out-of-band reports, and the shutdown latch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use fleet_id::MachineId;
use fleet_process_manager::{
    client::FleetManagerClient, heartbeat, ManagerSettings, MockLauncher, ProcessManager,
};
use fleet_protocol::fleet::MachineHeartbeat;
use fleet_protocol::CapacityState;
use tokio::net::TcpListener;
use tokio::sync::watch;

type Received = Arc<Mutex<Vec<(String, MachineHeartbeat)>>>;

async fn record(
    State(received): State<Received>,
    Path(machine_id): Path<String>,
    Json(heartbeat): Json<MachineHeartbeat>,
) -> StatusCode {
    received.lock().unwrap().push((machine_id, heartbeat));
    StatusCode::OK
}

async fn spawn_fleet_manager() -> (String, Received) {
    let received: Received = Arc::default();
    let app = Router::new()
        .route("/vms/{machine_id}/heartbeat", post(record))
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), received)
}

fn manager(launcher: Arc<MockLauncher>) -> Arc<ProcessManager> {
    ProcessManager::new(
        ManagerSettings {
            max_process_count: 2,
            advertise_url: "http://127.0.0.1:4200".to_string(),
            max_starting_heartbeat_age: Duration::from_secs(20),
            max_running_heartbeat_age: Duration::from_secs(10),
        },
        launcher,
    )
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_periodic_heartbeats_carry_increasing_sequence() {
    let (url, received) = spawn_fleet_manager().await;
    let machine_id = MachineId::new();
    let manager = manager(Arc::new(MockLauncher::new()));
    let client = FleetManagerClient::new(url, machine_id).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        client,
        manager,
        Duration::from_millis(20),
        shutdown_rx,
    ));

    wait_until(|| received.lock().unwrap().len() >= 3).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let received = received.lock().unwrap();
    assert!(received.iter().all(|(id, _)| *id == machine_id.to_string()));
    assert!(received
        .iter()
        .all(|(_, hb)| hb.capacity_state == CapacityState::Empty));
    let indexes: Vec<u64> = received.iter().map(|(_, hb)| hb.sequence_index).collect();
    assert!(indexes.windows(2).all(|w| w[0] < w[1]), "{indexes:?}");
}

#[tokio::test]
async fn test_exit_triggers_out_of_band_heartbeat() {
    let (url, received) = spawn_fleet_manager().await;
    let launcher = Arc::new(MockLauncher::new());
    let manager = manager(launcher.clone());
    let client = FleetManagerClient::new(url, MachineId::new()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // Period long enough that only out-of-band heartbeats can arrive.
    tokio::spawn(heartbeat::run_heartbeat_loop(
        client,
        Arc::clone(&manager),
        Duration::from_secs(3600),
        shutdown_rx,
    ));

    let start = manager
        .start_process(serde_json::Value::Null)
        .await
        .unwrap();
    launcher.exit(start.process_id.unwrap(), 1);

    wait_until(|| !received.lock().unwrap().is_empty()).await;
    let heartbeat = received.lock().unwrap()[0].1;
    assert_eq!(heartbeat.capacity_state, CapacityState::Empty);
    assert!(heartbeat.sequence_index > start.sequence_index.unwrap());
}

#[tokio::test]
async fn test_loop_stops_once_shutdown_latches() {
    let (url, received) = spawn_fleet_manager().await;
    let manager = manager(Arc::new(MockLauncher::new()));
    let client = FleetManagerClient::new(url, MachineId::new()).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        client,
        Arc::clone(&manager),
        Duration::from_millis(20),
        shutdown_rx,
    ));
    wait_until(|| !received.lock().unwrap().is_empty()).await;

    assert!(manager.request_shutdown().await.accepted());
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("heartbeat loop should stop after the latch")
        .unwrap();

    let count = received.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.lock().unwrap().len(), count);
}

#[tokio::test]
async fn test_unreachable_fleet_manager_does_not_stop_loop() {
    // Nothing listens on this port.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let manager = manager(Arc::new(MockLauncher::new()));
    let client = FleetManagerClient::new(url, MachineId::new()).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        client,
        Arc::clone(&manager),
        Duration::from_millis(10),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    // Each failed attempt still consumed a sequence index.
    let next = manager.next_heartbeat().await.unwrap();
    assert!(next.sequence_index > 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
