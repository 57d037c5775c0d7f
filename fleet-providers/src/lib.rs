use async_trait::async_trait;
use fleet_common::{CloudInstance, FleetError, InstanceState, InstanceTemplate, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Thin facade over a cloud compute API.
///
/// Implementations map provider failures into `FleetError`:
/// rejected creates become `Provisioning`, unknown or terminated ids become
/// `InstanceNotFound`. Suspend/resume/terminate are idempotent.
#[async_trait]
pub trait CloudGateway: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn create_instance(
        &self,
        template: &InstanceTemplate,
        user_metadata: &HashMap<String, String>,
    ) -> Result<CloudInstance>;

    async fn suspend_instance(&self, instance_id: &str) -> Result<CloudInstance>;

    async fn resume_instance(&self, instance_id: &str) -> Result<CloudInstance>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn get_instance_metadata(&self, instance_id: &str) -> Result<CloudInstance>;

    // For reconciliation / discovery
    async fn list_instances(&self) -> Result<Vec<CloudInstance>>;

    /// Applies `desired` to an instance. RUNNING resumes, SUSPENDED suspends,
    /// TERMINATED terminates; PENDING is not a state callers can request.
    async fn transition(&self, instance_id: &str, desired: InstanceState) -> Result<()> {
        match desired {
            InstanceState::Running => self.resume_instance(instance_id).await.map(|_| ()),
            InstanceState::Suspended => self.suspend_instance(instance_id).await.map(|_| ()),
            InstanceState::Terminated => self.terminate_instance(instance_id).await,
            InstanceState::Pending => Err(FleetError::config(
                "PENDING cannot be requested as a target instance state",
            )),
        }
    }
}

/// Escalating poll delays used while waiting for a provider-side transition.
pub const DEFAULT_WAIT_DELAYS_MS: &[u64] = &[2000, 3000, 5000, 8000, 13000, 21000, 34000, 55000];

/// Poll an instance until it is RUNNING and has an address.
///
/// Bounded: each entry of `delays` is one wait before the next poll. Fails with
/// `Provisioning` when the list is exhausted, or immediately if the instance
/// goes anywhere other than PENDING/RUNNING.
pub async fn wait_until_running(
    gateway: &dyn CloudGateway,
    instance_id: &str,
    delays: &[Duration],
) -> Result<CloudInstance> {
    let mut attempt = 0usize;
    loop {
        let instance = gateway.get_instance_metadata(instance_id).await?;
        match instance.state {
            InstanceState::Running if instance.is_addressable() => return Ok(instance),
            InstanceState::Running | InstanceState::Pending => {}
            other => {
                return Err(FleetError::provisioning(format!(
                    "instance {} left the boot path while waiting (state: {})",
                    instance_id, other
                )));
            }
        }

        let Some(delay) = delays.get(attempt) else {
            warn!(
                instance_id = %instance_id,
                attempts = attempt + 1,
                "instance did not become running within the wait window"
            );
            return Err(FleetError::provisioning(format!(
                "instance {} not running after {} polls (state: {})",
                instance_id,
                attempt + 1,
                instance.state
            )));
        };
        attempt += 1;
        debug!(
            instance_id = %instance_id,
            state = %instance.state,
            delay_ms = delay.as_millis() as u64,
            attempt,
            "waiting for instance to become running"
        );
        sleep(*delay).await;
    }
}

pub fn delays_from_millis(ms: &[u64]) -> Vec<Duration> {
    ms.iter().map(|m| Duration::from_millis(*m)).collect()
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "scaleway")]
pub mod scaleway;
