use crate::CloudGateway;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{
    CloudInstance, FleetError, InstanceState, InstanceTemplate, LoginCredentials, Result,
};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.scaleway.com/instance/v1";

/// Polls after a pre-delete `poweroff` before giving up on a clean stop.
const STOP_POLLS: u32 = 30;
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ScalewayGateway {
    client: Client,
    project_id: String,
    secret_key: String,
    zone: String,
    // Scaleway does not hand back login material; the key is provisioned via cloud-init.
    credentials: LoginCredentials,
}

impl ScalewayGateway {
    pub fn new(
        project_id: String,
        secret_key: String,
        zone: String,
        credentials: LoginCredentials,
    ) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a fleet operation hangs forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| FleetError::config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            project_id: project_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            zone: zone.trim().to_string(),
            credentials,
        })
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            reqwest::header::HeaderValue::from_str(&self.secret_key)
                .map_err(|e| FleetError::config(format!("invalid secret key: {}", e)))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    fn server_url(&self, server_id: &str) -> String {
        format!("{}/zones/{}/servers/{}", API_BASE, self.zone, server_id)
    }

    async fn fetch_server(&self, server_id: &str) -> Result<Value> {
        let url = self.server_url(server_id);
        debug!(url = %url, "scaleway GET server");
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FleetError::InstanceNotFound(server_id.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Scaleway GET server failed: status={} body={}", status, text).into());
        }
        let body: Value = resp.json().await.map_err(anyhow::Error::from)?;
        Ok(body["server"].clone())
    }

    async fn server_action(&self, server_id: &str, action: &str) -> Result<()> {
        let url = format!("{}/action", self.server_url(server_id));
        info!(server_id = %server_id, action = %action, "scaleway server action");
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&json!({ "action": action }))
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FleetError::InstanceNotFound(server_id.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(server_id = %server_id, action = %action, status = %status, "scaleway action rejected");
            return Err(anyhow!(
                "Scaleway {} failed: status={} body={}",
                action,
                status,
                text
            )
            .into());
        }
        Ok(())
    }

    /// Powers the server off and waits (bounded) until Scaleway reports it stopped.
    async fn stop_before_delete(&self, server_id: &str) -> Result<()> {
        self.server_action(server_id, "poweroff").await?;
        for _ in 0..STOP_POLLS {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            let server = self.fetch_server(server_id).await?;
            if is_stopped(server["state"].as_str().unwrap_or_default()) {
                return Ok(());
            }
        }
        warn!(server_id = %server_id, "poweroff accepted but server not stopped yet");
        Ok(())
    }

    async fn delete_server(&self, server_id: &str) -> Result<std::result::Result<(), String>> {
        let url = self.server_url(server_id);
        info!(server_id = %server_id, "scaleway DELETE server");
        let resp = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FleetError::InstanceNotFound(server_id.to_string()));
        }
        if status.is_success() {
            return Ok(Ok(()));
        }
        let text = resp.text().await.unwrap_or_default();
        Ok(Err(format!("status={} body={}", status, text)))
    }

    fn to_instance(&self, server: &Value) -> Result<CloudInstance> {
        let id = server["id"]
            .as_str()
            .ok_or_else(|| anyhow!("No server id in response"))?
            .to_string();
        let raw_state = server["state"].as_str().unwrap_or("unknown");
        let state = map_state(raw_state).ok_or_else(|| {
            anyhow!("Scaleway server {} in unsupported state '{}'", id, raw_state)
        })?;

        let mut public_addresses = Vec::new();
        if let Some(ip) = server["public_ip"]["address"].as_str() {
            public_addresses.push(ip.to_string());
        }
        if let Some(ips) = server["public_ips"].as_array() {
            for ip in ips.iter().filter_map(|v| v["address"].as_str()) {
                if !public_addresses.iter().any(|a| a == ip) {
                    public_addresses.push(ip.to_string());
                }
            }
        }
        let private_addresses = server["private_ip"]
            .as_str()
            .map(|s| vec![s.to_string()])
            .unwrap_or_default();
        let created_at = server["creation_date"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(CloudInstance {
            id,
            state,
            public_addresses,
            private_addresses,
            credentials: self.credentials.clone(),
            zone: Some(self.zone.clone()),
            instance_type: server["commercial_type"].as_str().unwrap_or_default().to_string(),
            created_at,
        })
    }
}

fn is_stopped(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "stopped" | "stopped in place" | "stopped_in_place"
    )
}

/// Whether a rejected DELETE asks for the server to be powered off first.
fn delete_needs_poweroff(body: &str) -> bool {
    body.contains("powered off") || body.contains("resource_still_in_use")
}

/// Maps a Scaleway server state onto the fleet lifecycle.
fn map_state(raw: &str) -> Option<InstanceState> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "starting" => Some(InstanceState::Pending),
        "running" => Some(InstanceState::Running),
        "stopping" | "stopped" | "stopped in place" | "stopped_in_place" => {
            Some(InstanceState::Suspended)
        }
        _ => None,
    }
}

#[async_trait]
impl CloudGateway for ScalewayGateway {
    fn provider_name(&self) -> &str {
        "scaleway"
    }

    async fn create_instance(
        &self,
        template: &InstanceTemplate,
        user_metadata: &HashMap<String, String>,
    ) -> Result<CloudInstance> {
        if let Some(zone) = template.zone.as_deref() {
            if zone != self.zone {
                return Err(FleetError::provisioning(format!(
                    "template zone {} does not match gateway zone {}",
                    zone, self.zone
                )));
            }
        }
        let url = format!("{}/zones/{}/servers", API_BASE, self.zone);
        let name = format!("{}-{}", template.name_prefix, uuid::Uuid::new_v4());
        let tags: Vec<String> = std::iter::once("fleet".to_string())
            .chain(user_metadata.iter().map(|(k, v)| format!("{}={}", k, v)))
            .collect();
        let body = json!({
            "name": name,
            "commercial_type": template.instance_type,
            "project": self.project_id,
            "image": template.image,
            "tags": tags,
            "dynamic_ip_required": true
        });

        info!(
            instance_type = %template.instance_type,
            image = %template.image,
            zone = %self.zone,
            "scaleway create server"
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::provisioning(format!("create request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FleetError::provisioning(format!(
                "Scaleway create_instance failed: status={} body={}",
                status, text
            )));
        }
        let json_resp: Value = resp
            .json()
            .await
            .map_err(|e| FleetError::provisioning(format!("create response: {}", e)))?;
        let created = self.to_instance(&json_resp["server"])?;

        // Servers are created stopped; power on so the caller can wait for RUNNING.
        self.server_action(&created.id, "poweron")
            .await
            .map_err(|e| FleetError::provisioning(format!("poweron {}: {}", created.id, e)))?;
        Ok(created.with_state(InstanceState::Pending))
    }

    async fn suspend_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        let current = self.get_instance_metadata(instance_id).await?;
        if current.state == InstanceState::Suspended {
            debug!(instance_id = %instance_id, "already suspended");
            return Ok(current);
        }
        self.server_action(instance_id, "poweroff").await?;
        Ok(current.with_state(InstanceState::Suspended))
    }

    async fn resume_instance(&self, instance_id: &str) -> Result<CloudInstance> {
        let current = self.get_instance_metadata(instance_id).await?;
        if matches!(current.state, InstanceState::Running | InstanceState::Pending) {
            return Ok(current);
        }
        self.server_action(instance_id, "poweron").await?;
        Ok(current.with_state(InstanceState::Pending))
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        // Scaleway only deletes stopped servers.
        let server = self.fetch_server(instance_id).await?;
        let raw_state = server["state"].as_str().unwrap_or_default();
        if !is_stopped(raw_state) {
            debug!(instance_id = %instance_id, state = %raw_state, "stopping before delete");
            if let Err(e) = self.stop_before_delete(instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "poweroff before delete failed, deleting anyway");
            }
        }

        let rejected = match self.delete_server(instance_id).await? {
            Ok(()) => return Ok(()),
            Err(rejected) => rejected,
        };
        if !delete_needs_poweroff(&rejected) {
            return Err(anyhow!("Scaleway terminate failed: {}", rejected).into());
        }
        warn!(instance_id = %instance_id, "server still powered on, retrying delete after poweroff");
        self.stop_before_delete(instance_id).await?;
        self.delete_server(instance_id)
            .await?
            .map_err(|rejected| FleetError::from(anyhow!("Scaleway terminate failed after poweroff: {}", rejected)))
    }

    async fn get_instance_metadata(&self, instance_id: &str) -> Result<CloudInstance> {
        let server = self.fetch_server(instance_id).await?;
        self.to_instance(&server)
    }

    async fn list_instances(&self) -> Result<Vec<CloudInstance>> {
        let url = format!(
            "{}/zones/{}/servers?project={}&tags=fleet&per_page=100",
            API_BASE, self.zone, self.project_id
        );
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Scaleway list servers failed: status={} body={}", status, text).into());
        }
        let body: Value = resp.json().await.map_err(anyhow::Error::from)?;
        let mut out = Vec::new();
        for server in body["servers"].as_array().cloned().unwrap_or_default() {
            match self.to_instance(&server) {
                Ok(inst) => out.push(inst),
                // Servers mid-transition to a state we do not model are skipped.
                Err(e) => debug!(error = %e, "skipping server"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> ScalewayGateway {
        ScalewayGateway::new(
            "project".to_string(),
            "secret".to_string(),
            "fr-par-2".to_string(),
            LoginCredentials::key_pair("root", "/keys/fleet"),
        )
        .unwrap()
    }

    #[test]
    fn state_mapping() {
        assert_eq!(map_state("starting"), Some(InstanceState::Pending));
        assert_eq!(map_state("running"), Some(InstanceState::Running));
        assert_eq!(map_state("stopped in place"), Some(InstanceState::Suspended));
        assert_eq!(map_state("STOPPED"), Some(InstanceState::Suspended));
        assert_eq!(map_state("locked"), None);
    }

    #[test]
    fn delete_waits_for_a_full_stop() {
        assert!(is_stopped("stopped"));
        assert!(is_stopped("Stopped in place"));
        assert!(!is_stopped("stopping"));
        assert!(!is_stopped("running"));
        assert!(delete_needs_poweroff(
            r#"{"type":"resource_still_in_use","message":"server should be powered off"}"#
        ));
        assert!(!delete_needs_poweroff(r#"{"type":"permissions_denied"}"#));
    }

    #[test]
    fn server_json_to_instance() {
        let server = json!({
            "id": "0a1b",
            "state": "running",
            "commercial_type": "GP1-XS",
            "public_ip": { "address": "51.15.1.2" },
            "public_ips": [{ "address": "51.15.1.2" }, { "address": "51.15.9.9" }],
            "private_ip": "10.1.2.3",
            "creation_date": "2024-03-01T10:00:00+00:00"
        });
        let inst = gateway().to_instance(&server).unwrap();
        assert_eq!(inst.id, "0a1b");
        assert_eq!(inst.state, InstanceState::Running);
        assert_eq!(inst.public_addresses, vec!["51.15.1.2", "51.15.9.9"]);
        assert_eq!(inst.private_addresses, vec!["10.1.2.3"]);
        assert_eq!(inst.zone.as_deref(), Some("fr-par-2"));
        assert_eq!(inst.instance_type, "GP1-XS");
    }

    #[test]
    fn server_json_without_id_is_rejected() {
        assert!(gateway().to_instance(&json!({ "state": "running" })).is_err());
    }
}
