//! Fleet manager HTTP API tests.
//!
//! Requests go through the router in-process; the machines behind the mock
//! provider are a real process manager served on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use fleet_id::MachineId;
use fleet_manager::sweep::SweepWorker;
use fleet_manager::{api, AppState, Fleet, FleetSettings, HttpMachineApi, MockProvider};
use fleet_process_manager::{ManagerSettings, MockLauncher, ProcessManager};
use fleet_protocol::fleet::{AllocateResponse, MachineView};
use fleet_protocol::problem::ProblemDetails;
use fleet_protocol::MachineState;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;

struct Harness {
    router: Router,
    fleet: Arc<Fleet>,
    provider: Arc<MockProvider>,
}

impl Harness {
    async fn new(max_machine_heartbeat_age: Duration) -> Self {
        let pm = ProcessManager::new(
            ManagerSettings {
                max_process_count: 2,
                advertise_url: "http://127.0.0.1:9".to_string(),
                max_starting_heartbeat_age: Duration::from_secs(20),
                max_running_heartbeat_age: Duration::from_secs(10),
            },
            Arc::new(MockLauncher::new()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pm_url = format!("http://{}", listener.local_addr().unwrap());
        let pm_router = fleet_process_manager::api::create_router(pm);
        tokio::spawn(async move {
            axum::serve(listener, pm_router).await.unwrap();
        });

        let provider = Arc::new(MockProvider::new(pm_url));
        let fleet = Fleet::new(
            FleetSettings {
                max_machine_heartbeat_age,
            },
            provider.clone(),
            Arc::new(HttpMachineApi::new(Duration::from_secs(5)).unwrap()),
        );
        let router = api::create_router(AppState::new(Arc::clone(&fleet)));
        Self {
            router,
            fleet,
            provider,
        }
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> T {
        let (status, bytes) = self.request(method, uri, body).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&bytes));
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn allocate(&self) -> AllocateResponse {
        self.json(
            Method::POST,
            "/processes",
            Some(serde_json::json!({ "params": {"mode": "ctf"} })),
        )
        .await
    }
}

#[tokio::test]
async fn test_list_machines_starts_empty() {
    let h = Harness::new(Duration::from_secs(20)).await;

    let machines: Vec<MachineView> = h.json(Method::GET, "/vms", None).await;
    assert!(machines.is_empty());
    let machines: Vec<MachineView> = h.json(Method::GET, "/vms/", None).await;
    assert!(machines.is_empty());
}

#[tokio::test]
async fn test_allocate_then_list_and_get_machine() {
    let h = Harness::new(Duration::from_secs(20)).await;

    let response = h.allocate().await;
    assert!(response.is_ok(), "{}", response.msg);
    assert!(response.process_id.is_some());
    let machine_id = response.machine_id.unwrap();

    let machines: Vec<MachineView> = h.json(Method::GET, "/vms", None).await;
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].id, machine_id);

    let machine: MachineView = h
        .json(Method::GET, &format!("/vms/{machine_id}"), None)
        .await;
    assert_eq!(machine.capacity_state, MachineState::Partial);
    assert_eq!(machine.last_sequence_index, 1);
}

#[tokio::test]
async fn test_unknown_and_malformed_machine_ids_are_404() {
    let h = Harness::new(Duration::from_secs(20)).await;

    let unknown = MachineId::new();
    for uri in [format!("/vms/{unknown}"), "/vms/not-an-id".to_string()] {
        let (status, bytes) = h.request(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        let problem: ProblemDetails = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(problem.code, "machine_not_found");
    }
}

#[tokio::test]
async fn test_failed_provisioning_is_reported_in_msg() {
    let h = Harness::new(Duration::from_secs(20)).await;
    h.provider.fail_provisioning(true);

    let response = h.allocate().await;
    assert!(!response.is_ok());
    assert!(response.msg.contains("provision"), "{}", response.msg);
    assert!(response.process_id.is_none());
    assert!(response.machine_id.is_none());
    assert_eq!(h.fleet.machine_count().await, 0);
}

#[tokio::test]
async fn test_sweep_worker_retires_silent_machine_and_stops_on_shutdown() {
    let h = Harness::new(Duration::from_millis(20)).await;
    assert!(h.allocate().await.is_ok());
    assert_eq!(h.provider.live_count(), 1);

    let (tx, rx) = watch::channel(false);
    let worker = SweepWorker::new(Arc::clone(&h.fleet), Duration::from_millis(10));
    let task = tokio::spawn(async move { worker.run(rx).await });

    let mut retired = false;
    for _ in 0..200 {
        if h.fleet.machine_count().await == 0 {
            retired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(retired, "silent machine was never swept");
    assert_eq!(h.provider.live_count(), 0);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("sweep worker did not stop")
        .unwrap();
}
