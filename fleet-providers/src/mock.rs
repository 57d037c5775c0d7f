use crate::CloudGateway;
use async_trait::async_trait;
use chrono::Utc;
use fleet_common::{CloudInstance, FleetError, InstanceState, InstanceTemplate, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::info;

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    terminated: HashSet<String>,
    next_id: u32,
    fail_next_create: Option<String>,
    quota: Option<usize>,
}

struct MockInstance {
    snapshot: CloudInstance,
    // Metadata polls still needed before PENDING flips to RUNNING.
    boot_polls_left: u32,
    user_metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct MockCallCounts {
    pub creates: AtomicUsize,
    pub suspends: AtomicUsize,
    pub resumes: AtomicUsize,
    pub terminates: AtomicUsize,
}

/// In-memory gateway with deterministic ids (`mock-1`, `mock-2`, ...).
///
/// Instances start PENDING and report RUNNING after `boot_polls` metadata calls.
pub struct MockGateway {
    state: Mutex<MockState>,
    boot_polls: u32,
    pub calls: MockCallCounts,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_boot_polls(0)
    }

    pub fn with_boot_polls(boot_polls: u32) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            boot_polls,
            calls: MockCallCounts::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `create_instance` fail with a provisioning error.
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        self.lock().fail_next_create = Some(reason.into());
    }

    /// Caps the number of non-terminated instances.
    pub fn set_quota(&self, quota: usize) {
        self.lock().quota = Some(quota);
    }

    /// Registers an instance that exists outside this process.
    pub fn insert_instance(&self, instance: CloudInstance) {
        let mut state = self.lock();
        state.instances.insert(
            instance.id.clone(),
            MockInstance {
                snapshot: instance,
                boot_polls_left: 0,
                user_metadata: HashMap::new(),
            },
        );
    }

    /// Current state, including TERMINATED for ids that were destroyed.
    pub fn state_of(&self, instance_id: &str) -> Option<InstanceState> {
        let state = self.lock();
        if state.terminated.contains(instance_id) {
            return Some(InstanceState::Terminated);
        }
        state.instances.get(instance_id).map(|i| i.snapshot.state)
    }

    pub fn user_metadata_of(&self, instance_id: &str) -> Option<HashMap<String, String>> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|i| i.user_metadata.clone())
    }

    pub fn live_count(&self) -> usize {
        self.lock().instances.len()
    }

    fn transition(&self, instance_id: &str, to: InstanceState) -> Result<CloudInstance> {
        let mut state = self.lock();
        let Some(inst) = state.instances.get_mut(instance_id) else {
            return Err(FleetError::InstanceNotFound(instance_id.to_string()));
        };
        let from = inst.snapshot.state;
        if from == to {
            return Ok(inst.snapshot.clone());
        }
        if !from.can_transition_to(to) {
            return Err(FleetError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from,
                to,
            });
        }
        inst.snapshot = inst.snapshot.with_state(to);
        Ok(inst.snapshot.clone())
    }
}

#[async_trait]
impl CloudGateway for MockGateway {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn create_instance(
        &self,
        template: &InstanceTemplate,
        user_metadata: &HashMap<String, String>,
    ) -> Result<CloudInstance> {
        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_create.take() {
            return Err(FleetError::provisioning(reason));
        }
        if let Some(quota) = state.quota {
            if state.instances.len() >= quota {
                return Err(FleetError::provisioning(format!(
                    "quota exceeded: {} instance(s) allowed",
                    quota
                )));
            }
        }

        state.next_id += 1;
        let n = state.next_id;
        let id = format!("mock-{}", n);
        let initial = if self.boot_polls == 0 {
            InstanceState::Running
        } else {
            InstanceState::Pending
        };
        let snapshot = CloudInstance {
            id: id.clone(),
            state: initial,
            public_addresses: vec![format!("198.51.100.{}", n % 250 + 1)],
            private_addresses: vec![format!("10.0.{}.1", n % 250)],
            credentials: template.credentials.clone(),
            zone: template.zone.clone(),
            instance_type: template.instance_type.clone(),
            created_at: Utc::now(),
        };
        state.instances.insert(
            id.clone(),
            MockInstance {
                snapshot: snapshot.clone(),
                boot_polls_left: self.boot_polls,
                user_metadata: user_metadata.clone(),
            },
        );
        info!(instance_id = %id, instance_type = %template.instance_type, "mock instance created");
        Ok(snapshot)
    }

    async fn suspend_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        self.calls.suspends.fetch_add(1, Ordering::SeqCst);
        self.transition(instance_id, InstanceState::Suspended)
    }

    async fn resume_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        self.calls.resumes.fetch_add(1, Ordering::SeqCst);
        self.transition(instance_id, InstanceState::Running)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.calls.terminates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.instances.remove(instance_id).is_none() {
            return Err(FleetError::InstanceNotFound(instance_id.to_string()));
        }
        state.terminated.insert(instance_id.to_string());
        info!(instance_id = %instance_id, "mock instance terminated");
        Ok(())
    }

    async fn get_instance_metadata(&self, instance_id: &str) -> Result<CloudInstance> {
        let mut state = self.lock();
        let Some(inst) = state.instances.get_mut(instance_id) else {
            return Err(FleetError::InstanceNotFound(instance_id.to_string()));
        };
        if inst.snapshot.state == InstanceState::Pending {
            if inst.boot_polls_left == 0 {
                inst.snapshot = inst.snapshot.with_state(InstanceState::Running);
            } else {
                inst.boot_polls_left -= 1;
            }
        }
        Ok(inst.snapshot.clone())
    }

    async fn list_instances(&self) -> Result<Vec<CloudInstance>> {
        let state = self.lock();
        let mut out: Vec<CloudInstance> =
            state.instances.values().map(|i| i.snapshot.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
