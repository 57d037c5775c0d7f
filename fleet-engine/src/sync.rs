//! Checksum-addressed upload and deployment of a `ResourceCatalog` to one host.
//!
//! Remote layout under the resource dir:
//! - `<dir>/<name>`            resource body
//! - `<dir>/.crc/<name>.crc`   CRC32 of the body as decimal text, no newline
//!
//! A resource whose cache file matches the local checksum is not re-sent. Failures
//! are isolated per resource: the failing entry keeps its flags cleared so the next
//! pass retries it, and the remaining entries are still processed.

use fleet_common::{FleetError, Result};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{checksum_dir, checksum_path, remote_path, ManagedResource, ResourceCatalog};
use crate::logger::tail_str;
use crate::shell::{sh_quote, RemoteShell};

const DEPLOY_OK: &str = "fleet-deploy:ok:";
const DEPLOY_FAIL: &str = "fleet-deploy:fail:";

/// State of a resource's checksum file on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChecksum {
    Missing,
    Matches,
    /// Stale or foreign cache entry; triggers a re-upload.
    Differs(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub cache_hits: Vec<String>,
    /// Already uploaded earlier in this process with the same checksum.
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn failure_for(&self, name: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_str())
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeployReport {
    pub deployed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DeployReport {
    pub fn failure_for(&self, name: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteResourceSynchronizer {
    resource_dir: String,
}

impl RemoteResourceSynchronizer {
    pub fn new(resource_dir: impl Into<String>) -> Self {
        Self {
            resource_dir: resource_dir.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn resource_dir(&self) -> &str {
        &self.resource_dir
    }

    /// `mkdir -p` the resource and checksum-cache directories.
    pub async fn prepare_directories(&self, shell: &dyn RemoteShell) -> Result<()> {
        let cmd = format!(
            "mkdir -p {} {}",
            sh_quote(&self.resource_dir),
            sh_quote(&checksum_dir(&self.resource_dir))
        );
        shell.exec_checked(&cmd).await?;
        Ok(())
    }

    pub async fn remote_checksum(
        &self,
        shell: &dyn RemoteShell,
        name: &str,
        local_checksum: u32,
    ) -> Result<RemoteChecksum> {
        let path = checksum_path(&self.resource_dir, name);
        let quoted = sh_quote(&path);
        let exists = shell
            .exec_checked(&format!(
                "if [ -f {} ]; then echo true; else echo false; fi",
                quoted
            ))
            .await?;
        if exists.stdout.trim() != "true" {
            return Ok(RemoteChecksum::Missing);
        }
        let out = shell.exec_checked(&format!("cat {}", quoted)).await?;
        let remote = out.stdout.trim();
        if remote == local_checksum.to_string() {
            Ok(RemoteChecksum::Matches)
        } else {
            Ok(RemoteChecksum::Differs(remote.to_string()))
        }
    }

    /// Uploads every resource whose current checksum has not been uploaded yet.
    pub async fn synchronize(
        &self,
        catalog: &mut ResourceCatalog,
        shell: &dyn RemoteShell,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for resource in catalog.resources_mut() {
            let name = resource.name().to_string();
            let (bytes, crc) = match resource.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(host = %shell.host(), resource = %name, error = %e, "cannot read local resource");
                    resource.invalidate();
                    report.failed.push((name, e.to_string()));
                    continue;
                }
            };
            if resource.is_current(crc) {
                report.unchanged.push(name);
                continue;
            }

            match self.sync_one(shell, resource, &bytes, crc).await {
                Ok(true) => {
                    resource.mark_uploaded(crc);
                    report.uploaded.push(name);
                }
                Ok(false) => {
                    resource.mark_uploaded(crc);
                    report.cache_hits.push(name);
                }
                Err(e) => {
                    // Retried on the next pass.
                    warn!(host = %shell.host(), resource = %name, error = %e, "resource upload failed");
                    resource.invalidate();
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// Returns `true` if the body was uploaded, `false` on a cache hit.
    async fn sync_one(
        &self,
        shell: &dyn RemoteShell,
        resource: &ManagedResource,
        bytes: &[u8],
        crc: u32,
    ) -> Result<bool> {
        let name = resource.name();
        match self.remote_checksum(shell, name, crc).await? {
            RemoteChecksum::Matches => {
                debug!(host = %shell.host(), resource = %name, checksum = crc, "checksum cache hit");
                return Ok(false);
            }
            RemoteChecksum::Differs(remote) => {
                debug!(host = %shell.host(), resource = %name, local = crc, remote = %remote, "checksum mismatch, re-uploading");
            }
            RemoteChecksum::Missing => {}
        }

        let started = Instant::now();
        let crc_path = checksum_path(&self.resource_dir, name);
        // Drop the stale cache entry first so an interrupted body upload is never trusted.
        shell
            .exec_checked(&format!("rm -rf {}", sh_quote(&crc_path)))
            .await?;
        shell
            .upload(bytes, &remote_path(&self.resource_dir, name))
            .await?;
        shell.upload(crc.to_string().as_bytes(), &crc_path).await?;
        info!(
            host = %shell.host(),
            resource = %name,
            bytes = bytes.len(),
            checksum = crc,
            duration_ms = started.elapsed().as_millis() as u64,
            "resource uploaded"
        );
        Ok(true)
    }

    fn deploy_command(&self, resource: &ManagedResource) -> String {
        let name = resource.name();
        let src = sh_quote(&remote_path(&self.resource_dir, name));
        let target = sh_quote(resource.deploy_dir());
        if resource.unzip_on_deploy() {
            format!("mkdir -p {target} && unzip -o {src} -d {target}")
        } else {
            let dest = sh_quote(&format!("{}/{}", resource.deploy_dir(), name));
            format!("mkdir -p {target} && cp {src} {dest}")
        }
    }

    /// Copies or unpacks every uploaded-but-not-deployed resource, in one remote invocation.
    pub async fn deploy(&self, catalog: &mut ResourceCatalog, shell: &dyn RemoteShell) -> DeployReport {
        let mut report = DeployReport::default();
        let pending: Vec<usize> = catalog
            .resources()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.uploaded() && !r.deployed())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return report;
        }

        // Each step reports its own marker on stdout; its output goes to stderr.
        let script = pending
            .iter()
            .map(|&i| {
                let r = &catalog.resources()[i];
                format!(
                    "if ( {} ) 1>&2; then echo {}; else echo {}; fi",
                    self.deploy_command(r),
                    sh_quote(&format!("{}{}", DEPLOY_OK, r.name())),
                    sh_quote(&format!("{}{}", DEPLOY_FAIL, r.name())),
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        let output = match shell.exec(&script).await {
            Ok(out) => out,
            Err(e) => {
                warn!(host = %shell.host(), error = %e, "deploy batch failed");
                for &i in &pending {
                    report
                        .failed
                        .push((catalog.resources()[i].name().to_string(), e.to_string()));
                }
                return report;
            }
        };

        let stderr_tail = tail_str(output.stderr.trim(), 2000).to_string();
        for &i in &pending {
            let resource = &mut catalog.resources_mut()[i];
            let name = resource.name().to_string();
            let ok_marker = format!("{}{}", DEPLOY_OK, name);
            if output.stdout.lines().any(|l| l.trim() == ok_marker) {
                resource.mark_deployed();
                report.deployed.push(name);
            } else {
                warn!(host = %shell.host(), resource = %name, stderr = %stderr_tail, "resource deploy failed");
                report.failed.push((name, format!("deploy command failed: {}", stderr_tail)));
            }
        }
        if !report.deployed.is_empty() {
            info!(host = %shell.host(), deployed = ?report.deployed, "resources deployed");
        }
        report
    }

    /// Directory preparation, upload pass and deploy pass; fails only if a
    /// required resource did not make it.
    pub async fn synchronize_and_deploy(
        &self,
        catalog: &mut ResourceCatalog,
        shell: &dyn RemoteShell,
    ) -> Result<(SyncReport, DeployReport)> {
        self.prepare_directories(shell).await?;
        let sync = self.synchronize(catalog, shell).await;
        let deploy = self.deploy(catalog, shell).await;
        check_required(catalog, &sync, &deploy)?;
        Ok((sync, deploy))
    }
}

/// Error for the first required resource that is not deployed.
pub fn check_required(catalog: &ResourceCatalog, sync: &SyncReport, deploy: &DeployReport) -> Result<()> {
    for r in catalog.resources() {
        if r.is_required() && !r.deployed() {
            let reason = sync
                .failure_for(r.name())
                .or_else(|| deploy.failure_for(r.name()))
                .unwrap_or("not deployed");
            return Err(FleetError::resource(r.name(), reason));
        }
    }
    Ok(())
}
