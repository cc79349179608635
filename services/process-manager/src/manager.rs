//! Process registry and machine capacity state machine.
//!
//! The process manager:
//! - Accepts start requests while the machine has spare capacity
//! - Tracks each worker's lifecycle and heartbeat age
//! - Derives the machine's capacity from the live process count
//! - Latches `ShuttingDown` once the fleet manager asks to retire the machine
//!
//! All registry mutations happen under one lock that is never held across
//! network I/O. Worker exits are observed by a supervisor task per worker,
//! which removes the process and signals a capacity change when it happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_id::ProcessId;
use fleet_protocol::fleet::MachineHeartbeat;
use fleet_protocol::process::{
    ProcessView, ShutdownOutcome, ShutdownResponse, StartOutcome, StartProcessResponse,
};
use fleet_protocol::{CapacityState, LifecycleState};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::launcher::{LaunchError, LaunchSpec, Launcher, Worker};

/// Tunables for a process manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Number of workers at which the machine reports `Full`. Must be >= 1.
    pub max_process_count: usize,

    /// URL workers use to reach this PM.
    pub advertise_url: String,

    pub max_starting_heartbeat_age: Duration,

    pub max_running_heartbeat_age: Duration,
}

/// Derive capacity from the live process count.
///
/// The latch wins over counts; otherwise zero is `Empty` and reaching the
/// maximum is `Full`.
pub fn derive_capacity(count: usize, max: usize, shutdown_latched: bool) -> CapacityState {
    if shutdown_latched {
        CapacityState::ShuttingDown
    } else if count == 0 {
        CapacityState::Empty
    } else if count >= max {
        CapacityState::Full
    } else {
        CapacityState::Partial
    }
}

/// One supervised worker.
#[derive(Debug)]
struct ManagedProcess {
    params: serde_json::Value,
    lifecycle: LifecycleState,
    last_heartbeat_at: DateTime<Utc>,
    /// Set to true to ask the supervisor task to kill the worker.
    kill: watch::Sender<bool>,
}

impl ManagedProcess {
    fn view(&self, id: ProcessId, now: DateTime<Utc>) -> ProcessView {
        ProcessView {
            id,
            params: self.params.clone(),
            lifecycle_state: self.lifecycle,
            heartbeat_age: (now - self.last_heartbeat_at).num_seconds(),
        }
    }
}

#[derive(Debug, Default)]
struct ManagerInner {
    processes: HashMap<ProcessId, ManagedProcess>,
    sequence_index: u64,
    shutdown_latched: bool,
}

impl ManagerInner {
    fn capacity(&self, max: usize) -> CapacityState {
        derive_capacity(self.processes.len(), max, self.shutdown_latched)
    }

    fn next_sequence_index(&mut self) -> u64 {
        self.sequence_index += 1;
        self.sequence_index
    }
}

/// Per-machine process manager.
pub struct ProcessManager {
    settings: ManagerSettings,
    launcher: Arc<dyn Launcher>,
    inner: Mutex<ManagerInner>,
    capacity_changed: Notify,
    shutdown_latch: watch::Sender<bool>,
}

impl ProcessManager {
    pub fn new(settings: ManagerSettings, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let (shutdown_latch, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            launcher,
            inner: Mutex::new(ManagerInner::default()),
            capacity_changed: Notify::new(),
            shutdown_latch,
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub async fn capacity_state(&self) -> CapacityState {
        self.inner
            .lock()
            .await
            .capacity(self.settings.max_process_count)
    }

    pub async fn process_count(&self) -> usize {
        self.inner.lock().await.processes.len()
    }

    /// Start a worker if the machine has room.
    ///
    /// Rejections are successful responses that still consume a sequence
    /// index, so the fleet manager can trust the capacity they carry.
    pub async fn start_process(
        self: &Arc<Self>,
        params: serde_json::Value,
    ) -> Result<StartProcessResponse, LaunchError> {
        let max = self.settings.max_process_count;
        let mut inner = self.inner.lock().await;

        let rejection = match inner.capacity(max) {
            CapacityState::Full => Some(StartOutcome::AlreadyFull),
            CapacityState::ShuttingDown => Some(StartOutcome::AlreadyShuttingDown),
            CapacityState::Empty | CapacityState::Partial => None,
        };
        if let Some(msg) = rejection {
            let capacity_state = inner.capacity(max);
            let sequence_index = inner.next_sequence_index();
            info!(%msg, %capacity_state, sequence_index, "Rejected start request");
            return Ok(StartProcessResponse {
                msg,
                process_id: None,
                capacity_state,
                sequence_index: Some(sequence_index),
            });
        }

        let process_id = ProcessId::new();
        let worker = self.launcher.launch(&LaunchSpec {
            process_id,
            manager_url: &self.settings.advertise_url,
            params: &params,
        })?;

        let (kill, kill_rx) = watch::channel(false);
        inner.processes.insert(
            process_id,
            ManagedProcess {
                params,
                lifecycle: LifecycleState::Starting,
                last_heartbeat_at: Utc::now(),
                kill,
            },
        );
        tokio::spawn(supervise(Arc::clone(self), process_id, worker, kill_rx));

        let capacity_state = inner.capacity(max);
        let sequence_index = inner.next_sequence_index();
        info!(
            process_id = %process_id,
            %capacity_state,
            sequence_index,
            process_count = inner.processes.len(),
            "Started process"
        );

        Ok(StartProcessResponse {
            msg: StartOutcome::Ok,
            process_id: Some(process_id),
            capacity_state,
            sequence_index: Some(sequence_index),
        })
    }

    /// Ask a worker to terminate. Returns false if the id is unknown.
    ///
    /// The process stays registered until its exit is observed.
    pub async fn kill_process(&self, process_id: ProcessId) -> bool {
        let inner = self.inner.lock().await;
        match inner.processes.get(&process_id) {
            Some(process) => {
                info!(process_id = %process_id, "Killing process");
                process.kill.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat from a worker. Returns false if the id is unknown.
    pub async fn record_heartbeat(&self, process_id: ProcessId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.processes.get_mut(&process_id) {
            Some(process) => {
                if process.lifecycle == LifecycleState::Starting {
                    debug!(process_id = %process_id, "Process is now running");
                }
                process.last_heartbeat_at = Utc::now();
                process.lifecycle = LifecycleState::Running;
                true
            }
            None => false,
        }
    }

    pub async fn list_processes(&self) -> Vec<ProcessView> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut views: Vec<_> = inner
            .processes
            .iter()
            .map(|(id, process)| process.view(*id, now))
            .collect();
        views.sort_by_key(|view| view.id);
        views
    }

    pub async fn get_process(&self, process_id: ProcessId) -> Option<ProcessView> {
        let inner = self.inner.lock().await;
        inner
            .processes
            .get(&process_id)
            .map(|process| process.view(process_id, Utc::now()))
    }

    /// Agree to shut down if nothing is running.
    ///
    /// Once accepted the latch holds for the life of this PM and the
    /// heartbeat loop stops.
    pub async fn request_shutdown(&self) -> ShutdownResponse {
        let mut inner = self.inner.lock().await;
        let current = inner.capacity(self.settings.max_process_count);

        match current {
            CapacityState::Empty | CapacityState::ShuttingDown => {
                if !inner.shutdown_latched {
                    info!("Shutdown accepted, stopping heartbeats");
                    inner.shutdown_latched = true;
                    self.shutdown_latch.send_replace(true);
                }
                ShutdownResponse {
                    msg: ShutdownOutcome::Ok,
                    capacity_state: CapacityState::ShuttingDown,
                }
            }
            CapacityState::Partial | CapacityState::Full => {
                info!(capacity_state = %current, "Shutdown refused, processes still running");
                ShutdownResponse {
                    msg: ShutdownOutcome::NotEmpty,
                    capacity_state: current,
                }
            }
        }
    }

    pub fn is_shutdown_latched(&self) -> bool {
        *self.shutdown_latch.borrow()
    }

    /// Subscribe to the shutdown latch.
    pub fn shutdown_latched(&self) -> watch::Receiver<bool> {
        self.shutdown_latch.subscribe()
    }

    /// Next heartbeat to send, or `None` once shutdown has latched.
    pub async fn next_heartbeat(&self) -> Option<MachineHeartbeat> {
        let mut inner = self.inner.lock().await;
        if inner.shutdown_latched {
            return None;
        }
        let capacity_state = inner.capacity(self.settings.max_process_count);
        Some(MachineHeartbeat {
            sequence_index: inner.next_sequence_index(),
            capacity_state,
        })
    }

    /// Resolves when a worker exit changed the machine's capacity.
    pub async fn capacity_changed(&self) {
        self.capacity_changed.notified().await;
    }

    /// Signal a kill to every worker whose heartbeat is too old at `now`.
    ///
    /// Starting workers get the generous threshold, running workers the
    /// tight one. Kills are issued after the scan completes.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<ProcessId> {
        let inner = self.inner.lock().await;

        let expired: Vec<ProcessId> = inner
            .processes
            .iter()
            .filter(|(_, process)| {
                let age = now - process.last_heartbeat_at;
                exceeds(age, self.settings.max_starting_heartbeat_age)
                    || (process.lifecycle == LifecycleState::Running
                        && exceeds(age, self.settings.max_running_heartbeat_age))
            })
            .map(|(id, _)| *id)
            .collect();

        for process_id in &expired {
            if let Some(process) = inner.processes.get(process_id) {
                warn!(
                    process_id = %process_id,
                    lifecycle = ?process.lifecycle,
                    heartbeat_age_secs = (now - process.last_heartbeat_at).num_seconds(),
                    "Process heartbeat timed out"
                );
                process.kill.send_replace(true);
            }
        }

        expired
    }

    async fn handle_exit(&self, process_id: ProcessId, exit_code: Option<i32>) {
        let max = self.settings.max_process_count;
        let mut inner = self.inner.lock().await;

        let before = inner.capacity(max);
        if inner.processes.remove(&process_id).is_none() {
            return;
        }
        let after = inner.capacity(max);

        info!(
            process_id = %process_id,
            exit_code,
            process_count = inner.processes.len(),
            "Process exited"
        );

        if before != after {
            info!(from = %before, to = %after, "Capacity changed");
            self.capacity_changed.notify_one();
        }
    }
}

fn exceeds(age: TimeDelta, limit: Duration) -> bool {
    age.to_std().map(|age| age > limit).unwrap_or(false)
}

async fn supervise(
    manager: Arc<ProcessManager>,
    process_id: ProcessId,
    mut worker: Box<dyn Worker>,
    mut kill_rx: watch::Receiver<bool>,
) {
    let exited = tokio::select! {
        code = worker.wait() => Some(code),
        _ = kill_rx.changed() => None,
    };

    let exit_code = match exited {
        Some(code) => code,
        None => {
            worker.kill().await;
            worker.wait().await
        }
    };

    manager.handle_exit(process_id, exit_code).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::MockLauncher;
    use rstest::rstest;

    fn settings(max: usize) -> ManagerSettings {
        ManagerSettings {
            max_process_count: max,
            advertise_url: "http://127.0.0.1:4000".to_string(),
            max_starting_heartbeat_age: Duration::from_secs(20),
            max_running_heartbeat_age: Duration::from_secs(10),
        }
    }

    fn manager(max: usize) -> (Arc<ProcessManager>, Arc<MockLauncher>) {
        let launcher = Arc::new(MockLauncher::new());
        (ProcessManager::new(settings(max), launcher.clone()), launcher)
    }

    async fn wait_for_count(manager: &ProcessManager, expected: usize) {
        for _ in 0..200 {
            if manager.process_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("process count never reached {expected}");
    }

    #[rstest]
    #[case(0, 4, false, CapacityState::Empty)]
    #[case(1, 4, false, CapacityState::Partial)]
    #[case(3, 4, false, CapacityState::Partial)]
    #[case(4, 4, false, CapacityState::Full)]
    #[case(1, 1, false, CapacityState::Full)]
    #[case(0, 4, true, CapacityState::ShuttingDown)]
    #[case(2, 4, true, CapacityState::ShuttingDown)]
    fn test_derive_capacity(
        #[case] count: usize,
        #[case] max: usize,
        #[case] latched: bool,
        #[case] expected: CapacityState,
    ) {
        assert_eq!(derive_capacity(count, max, latched), expected);
    }

    #[test]
    fn test_derived_capacity_never_contradicts_count() {
        for max in 1..6 {
            for count in 0..=max {
                let state = derive_capacity(count, max, false);
                if count < max {
                    assert_ne!(state, CapacityState::Full);
                }
                if count > 0 {
                    assert_ne!(state, CapacityState::Empty);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_single_slot_machine_rejects_second_start() {
        let (manager, launcher) = manager(1);

        let first = manager
            .start_process(serde_json::json!({"maxPlayers": 4}))
            .await
            .unwrap();
        assert_eq!(first.msg, StartOutcome::Ok);
        assert_eq!(first.capacity_state, CapacityState::Full);
        assert!(first.process_id.is_some());

        let second = manager
            .start_process(serde_json::json!({"maxPlayers": 4}))
            .await
            .unwrap();
        assert_eq!(second.msg, StartOutcome::AlreadyFull);
        assert_eq!(second.process_id, None);
        assert!(second.sequence_index > first.sequence_index);

        assert_eq!(manager.process_count().await, 1);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_params_and_url_reach_worker() {
        let (manager, launcher) = manager(2);
        let params = serde_json::json!({"map": "docks", "maxPlayers": 8});

        let response = manager.start_process(params.clone()).await.unwrap();

        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(Some(launches[0].process_id), response.process_id);
        assert_eq!(launches[0].manager_url, "http://127.0.0.1:4000");
        assert_eq!(launches[0].params, params);
    }

    #[tokio::test]
    async fn test_launch_failure_registers_nothing() {
        let manager = ProcessManager::new(settings(2), Arc::new(MockLauncher::failing()));

        assert!(manager.start_process(serde_json::Value::Null).await.is_err());
        assert_eq!(manager.process_count().await, 0);
        assert_eq!(manager.capacity_state().await, CapacityState::Empty);
    }

    #[tokio::test]
    async fn test_kill_removes_process_after_exit() {
        let (manager, _launcher) = manager(2);
        let id = manager
            .start_process(serde_json::Value::Null)
            .await
            .unwrap()
            .process_id
            .unwrap();

        assert!(manager.kill_process(id).await);
        wait_for_count(&manager, 0).await;
        assert!(manager.get_process(id).await.is_none());
        assert!(!manager.kill_process(id).await);
    }

    #[tokio::test]
    async fn test_exit_from_full_drops_to_partial_and_signals() {
        let (manager, launcher) = manager(2);
        let a = manager.start_process(serde_json::Value::Null).await.unwrap();
        manager.start_process(serde_json::Value::Null).await.unwrap();
        assert_eq!(manager.capacity_state().await, CapacityState::Full);

        launcher.exit(a.process_id.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(1), manager.capacity_changed())
            .await
            .expect("capacity change should be signalled");
        assert_eq!(manager.capacity_state().await, CapacityState::Partial);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_running() {
        let (manager, _launcher) = manager(2);
        let id = manager
            .start_process(serde_json::Value::Null)
            .await
            .unwrap()
            .process_id
            .unwrap();

        assert_eq!(
            manager.get_process(id).await.unwrap().lifecycle_state,
            LifecycleState::Starting
        );
        assert!(manager.record_heartbeat(id).await);
        assert_eq!(
            manager.get_process(id).await.unwrap().lifecycle_state,
            LifecycleState::Running
        );
        assert!(!manager.record_heartbeat(ProcessId::new()).await);
    }

    #[tokio::test]
    async fn test_shutdown_refused_while_busy() {
        let (manager, _launcher) = manager(2);
        manager.start_process(serde_json::Value::Null).await.unwrap();

        let response = manager.request_shutdown().await;
        assert_eq!(response.msg, ShutdownOutcome::NotEmpty);
        assert_eq!(response.capacity_state, CapacityState::Partial);
        assert!(!manager.is_shutdown_latched());
        assert!(manager.next_heartbeat().await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_latches_and_blocks_starts() {
        let (manager, launcher) = manager(2);

        let response = manager.request_shutdown().await;
        assert!(response.accepted());
        assert!(manager.is_shutdown_latched());
        assert!(manager.next_heartbeat().await.is_none());

        // idempotent
        assert!(manager.request_shutdown().await.accepted());

        let start = manager.start_process(serde_json::Value::Null).await.unwrap();
        assert_eq!(start.msg, StartOutcome::AlreadyShuttingDown);
        assert_eq!(start.capacity_state, CapacityState::ShuttingDown);
        assert_eq!(launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_sequence_index_shared_by_heartbeats_and_starts() {
        let (manager, _launcher) = manager(2);
        let h1 = manager.next_heartbeat().await.unwrap();
        let start = manager.start_process(serde_json::Value::Null).await.unwrap();
        let h2 = manager.next_heartbeat().await.unwrap();

        assert_eq!(h1.sequence_index, 1);
        assert_eq!(start.sequence_index, Some(2));
        assert_eq!(h2.sequence_index, 3);
        assert_eq!(h2.capacity_state, CapacityState::Partial);
    }

    #[tokio::test]
    async fn test_sweep_kills_silent_starting_process() {
        let (manager, _launcher) = manager(2);
        let id = manager
            .start_process(serde_json::Value::Null)
            .await
            .unwrap()
            .process_id
            .unwrap();

        let soon = Utc::now() + TimeDelta::seconds(15);
        assert!(manager.sweep(soon).await.is_empty(), "starting gets 20s");

        let later = Utc::now() + TimeDelta::seconds(25);
        assert_eq!(manager.sweep(later).await, vec![id]);
        wait_for_count(&manager, 0).await;
    }

    #[tokio::test]
    async fn test_sweep_uses_tighter_threshold_for_running() {
        let (manager, _launcher) = manager(2);
        let id = manager
            .start_process(serde_json::Value::Null)
            .await
            .unwrap()
            .process_id
            .unwrap();
        manager.record_heartbeat(id).await;

        let at = Utc::now() + TimeDelta::seconds(15);
        assert_eq!(manager.sweep(at).await, vec![id]);
    }

    #[tokio::test]
    async fn test_heartbeating_process_survives_sweeps() {
        let (manager, _launcher) = manager(2);
        let id = manager
            .start_process(serde_json::Value::Null)
            .await
            .unwrap()
            .process_id
            .unwrap();

        for _ in 0..5 {
            manager.record_heartbeat(id).await;
            let at = Utc::now() + TimeDelta::seconds(5);
            assert!(manager.sweep(at).await.is_empty());
        }
        assert_eq!(manager.process_count().await, 1);
    }
}
