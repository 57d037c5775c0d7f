//! Deploying workers through a batch scheduler's login node.
//!
//! The login node gets the same checksum-cached package as a cloud instance;
//! workers are then submitted as batch jobs instead of being started directly.

use fleet_common::{FleetError, NodeType, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::ResourceCatalog;
use crate::settings::{render_command, FleetSettings};
use crate::shell::{sh_quote, RemoteShell};
use crate::sync::{DeployReport, RemoteResourceSynchronizer, SyncReport};

pub const DEFAULT_SUBMIT_COMMAND: &str =
    "sbatch --job-name={job_name} --output={package_dir}/{job_name}.out --wrap {start}";
pub const DEFAULT_CANCEL_COMMAND: &str = "scancel {job_ids}";

const SUBMITTED_PREFIX: &str = "Submitted batch job ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpcJob {
    pub job_id: String,
    pub job_name: String,
    pub node_id: Uuid,
    pub management_port: u16,
}

/// Extracts the job id from `sbatch` output.
pub fn parse_job_id(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(SUBMITTED_PREFIX)?;
        let id = rest.split_whitespace().next()?;
        id.chars().all(|c| c.is_ascii_digit()).then(|| id.to_string())
    })
}

pub struct HpcDeployment {
    settings: FleetSettings,
    synchronizer: RemoteResourceSynchronizer,
    submit_command: String,
    cancel_command: String,
}

impl HpcDeployment {
    pub fn new(settings: FleetSettings) -> Self {
        let synchronizer = RemoteResourceSynchronizer::new(settings.remote_resource_dir.clone());
        Self {
            settings,
            synchronizer,
            submit_command: DEFAULT_SUBMIT_COMMAND.to_string(),
            cancel_command: DEFAULT_CANCEL_COMMAND.to_string(),
        }
    }

    pub fn with_submit_command(mut self, template: impl Into<String>) -> Self {
        self.submit_command = template.into();
        self
    }

    pub fn with_cancel_command(mut self, template: impl Into<String>) -> Self {
        self.cancel_command = template.into();
        self
    }

    /// Puts the package on the login node's shared filesystem.
    pub async fn prepare(
        &self,
        shell: &dyn RemoteShell,
        catalog: &mut ResourceCatalog,
    ) -> Result<(SyncReport, DeployReport)> {
        let reports = self.synchronizer.synchronize_and_deploy(catalog, shell).await?;
        info!(
            host = %shell.host(),
            uploaded = reports.0.uploaded.len(),
            cache_hits = reports.0.cache_hits.len(),
            "login node prepared"
        );
        Ok(reports)
    }

    fn start_command(&self, node_id: &str, port: u16, coordinator: &str) -> String {
        let port = port.to_string();
        render_command(
            &self.settings.start_command,
            &[
                ("package_dir", self.settings.package_dir.as_str()),
                ("node_type", NodeType::Worker.as_str()),
                ("node_id", node_id),
                ("port", port.as_str()),
                ("coordinator", coordinator),
            ],
        )
    }

    /// Submits `count` worker jobs pointed at `coordinator` (`host:port`).
    ///
    /// Stops at the first rejected submission. Jobs queued before it stay queued
    /// and are named `fleet-worker-*` on the scheduler.
    pub async fn submit_workers(
        &self,
        shell: &dyn RemoteShell,
        count: usize,
        coordinator: &str,
    ) -> Result<Vec<HpcJob>> {
        let mut jobs = Vec::with_capacity(count);
        for i in 0..count {
            let node_id = fleet_common::new_node_id();
            let port = u16::try_from(i + 1)
                .ok()
                .and_then(|offset| self.settings.base_port.checked_add(offset))
                .ok_or_else(|| FleetError::Conflict("management ports exhausted".to_string()))?;
            let job_name = format!("fleet-worker-{}", &node_id.simple().to_string()[..8]);
            let start = self.start_command(&node_id.to_string(), port, coordinator);
            let submit = render_command(
                &self.submit_command,
                &[
                    ("job_name", job_name.as_str()),
                    ("package_dir", self.settings.package_dir.as_str()),
                    ("start", sh_quote(&start).as_str()),
                ],
            );

            let out = match shell.exec_checked(&submit).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(host = %shell.host(), submitted = jobs.len(), error = %e, "job submission failed");
                    return Err(e);
                }
            };
            let job_id = parse_job_id(&out.stdout).ok_or_else(|| {
                FleetError::transport(
                    shell.host(),
                    format!("unexpected submit output: {}", out.stdout.trim()),
                )
            })?;
            info!(host = %shell.host(), job_id = %job_id, job_name = %job_name, node_id = %node_id, "worker job submitted");
            jobs.push(HpcJob {
                job_id,
                job_name,
                node_id,
                management_port: port,
            });
        }
        Ok(jobs)
    }

    /// Cancels jobs in one scheduler call; a no-op for an empty slice.
    pub async fn cancel(&self, shell: &dyn RemoteShell, jobs: &[HpcJob]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let ids = jobs
            .iter()
            .map(|j| j.job_id.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        shell
            .exec_checked(&render_command(&self.cancel_command, &[("job_ids", ids.as_str())]))
            .await?;
        info!(host = %shell.host(), jobs = jobs.len(), "worker jobs cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_from_sbatch_output() {
        assert_eq!(parse_job_id("Submitted batch job 4242\n").as_deref(), Some("4242"));
        assert_eq!(
            parse_job_id("sbatch: info: memory defaulted\nSubmitted batch job 17 on cluster a\n").as_deref(),
            Some("17")
        );
        assert_eq!(parse_job_id("Submitted batch job abc"), None);
        assert_eq!(parse_job_id("error: invalid partition"), None);
    }

    #[test]
    fn submit_template_is_rendered() {
        let hpc = HpcDeployment::new(FleetSettings::default()).with_submit_command("qsub -N {job_name} {start}");
        assert_eq!(hpc.submit_command, "qsub -N {job_name} {start}");
        let start = hpc.start_command("n1", 11001, "login:11000");
        assert!(start.contains("--port 11001"));
        assert!(start.contains("--coordinator login:11000"));
        assert!(start.contains("--type worker"));
    }
}
