//! In-memory provider for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MachineId;
use tracing::debug;

use super::{CloudProvider, ProviderError, ProviderHandle, ProvisionedMachine};

/// Provider that records calls and hands every machine the same endpoint.
///
/// Point the endpoint at an in-process PM router to exercise the whole
/// allocation and teardown path without subprocesses.
pub struct MockProvider {
    endpoint: String,
    provision_delay: Duration,
    provisioned: Mutex<Vec<MachineId>>,
    live: Mutex<HashMap<ProviderHandle, MachineId>>,
    deprovision_calls: AtomicUsize,
    fail_provision: AtomicBool,
    /// Number of upcoming deprovision calls that will fail.
    deprovision_failures: AtomicUsize,
}

impl MockProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            provision_delay: Duration::ZERO,
            provisioned: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            deprovision_calls: AtomicUsize::new(0),
            fail_provision: AtomicBool::new(false),
            deprovision_failures: AtomicUsize::new(0),
        }
    }

    /// Make every provision call take `delay` before returning.
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    pub fn fail_provisioning(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` deprovision calls.
    pub fn fail_next_deprovisions(&self, count: usize) {
        self.deprovision_failures.store(count, Ordering::SeqCst);
    }

    pub fn provisioned(&self) -> Vec<MachineId> {
        self.provisioned
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn provision_count(&self) -> usize {
        self.provisioned().len()
    }

    pub fn deprovision_calls(&self) -> usize {
        self.deprovision_calls.load(Ordering::SeqCst)
    }

    /// Machines provisioned and not yet successfully deprovisioned.
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn provision(&self, machine_id: MachineId) -> Result<ProvisionedMachine, ProviderError> {
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(ProviderError::Refused("mock provider configured to fail".into()));
        }

        let handle = ProviderHandle::new(format!("mock-{machine_id}"));
        if let Ok(mut provisioned) = self.provisioned.lock() {
            provisioned.push(machine_id);
        }
        if let Ok(mut live) = self.live.lock() {
            live.insert(handle.clone(), machine_id);
        }

        debug!(machine_id = %machine_id, handle = %handle, "[MOCK] Provisioned machine");
        Ok(ProvisionedMachine {
            endpoint: self.endpoint.clone(),
            handle,
        })
    }

    async fn deprovision(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .deprovision_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Refused("mock deprovision failure".into()));
        }

        let removed = self
            .live
            .lock()
            .ok()
            .and_then(|mut live| live.remove(handle));
        match removed {
            Some(machine_id) => {
                debug!(machine_id = %machine_id, handle = %handle, "[MOCK] Deprovisioned machine");
                Ok(())
            }
            None => Err(ProviderError::UnknownHandle(handle.clone())),
        }
    }
}
