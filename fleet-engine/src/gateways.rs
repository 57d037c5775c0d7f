use fleet_common::{FleetError, LoginCredentials, Result};
use fleet_providers::CloudGateway;
use std::sync::Arc;

pub const DEFAULT_PROVIDER: &str = "scaleway";

pub fn current_provider_name<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("FLEET_PROVIDER")
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
}

/// Login used on instances the gateway creates.
pub fn credentials_from_lookup<F>(lookup: &F) -> Result<LoginCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let user = lookup("FLEET_SSH_USER").unwrap_or_else(|| "root".to_string());
    if let Some(path) = lookup("FLEET_SSH_KEY_PATH").filter(|p| !p.trim().is_empty()) {
        return Ok(LoginCredentials::key_pair(user, path.trim()));
    }
    if let Some(password) = lookup("FLEET_SSH_PASSWORD").filter(|p| !p.is_empty()) {
        return Ok(LoginCredentials::password(user, password));
    }
    Err(FleetError::config("set FLEET_SSH_KEY_PATH or FLEET_SSH_PASSWORD"))
}

/// Builds the gateway named by `FLEET_PROVIDER`; only providers compiled in
/// through cargo features are available.
pub fn gateway_from_lookup<F>(lookup: F) -> Result<Arc<dyn CloudGateway>>
where
    F: Fn(&str) -> Option<String>,
{
    let name = current_provider_name(&lookup);
    match name.as_str() {
        #[cfg(feature = "provider-mock")]
        "mock" => Ok(Arc::new(fleet_providers::mock::MockGateway::new())),
        #[cfg(feature = "provider-scaleway")]
        "scaleway" => {
            let project_id = lookup("SCALEWAY_PROJECT_ID")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FleetError::config("SCALEWAY_PROJECT_ID is not set"))?;
            // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
            let secret_key = lookup("SCALEWAY_SECRET_KEY_FILE")
                .and_then(|path| std::fs::read_to_string(path.trim()).ok())
                .or_else(|| lookup("SCALEWAY_SECRET_KEY"))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FleetError::config("SCALEWAY_SECRET_KEY is not set"))?;
            let zone = lookup("SCALEWAY_ZONE").unwrap_or_else(|| "fr-par-2".to_string());
            let credentials = credentials_from_lookup(&lookup)?;
            let gateway =
                fleet_providers::scaleway::ScalewayGateway::new(project_id, secret_key, zone, credentials)?;
            Ok(Arc::new(gateway))
        }
        other => Err(FleetError::config(format!(
            "provider '{}' is unknown or not compiled in",
            other
        ))),
    }
}

pub fn gateway_from_env() -> Result<Arc<dyn CloudGateway>> {
    dotenv::dotenv().ok();
    gateway_from_lookup(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::Auth;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn provider_defaults_to_scaleway() {
        assert_eq!(current_provider_name(&lookup(&[])), "scaleway");
        assert_eq!(current_provider_name(&lookup(&[("FLEET_PROVIDER", " Mock ")])), "mock");
    }

    #[test]
    fn key_pair_wins_over_password() {
        let creds = credentials_from_lookup(&lookup(&[
            ("FLEET_SSH_USER", "ubuntu"),
            ("FLEET_SSH_KEY_PATH", "/keys/fleet"),
            ("FLEET_SSH_PASSWORD", "secret"),
        ]))
        .unwrap();
        assert_eq!(creds.user, "ubuntu");
        assert!(matches!(creds.auth, Auth::KeyPair { .. }));

        let creds = credentials_from_lookup(&lookup(&[("FLEET_SSH_PASSWORD", "secret")])).unwrap();
        assert_eq!(creds.user, "root");
        assert!(matches!(creds.auth, Auth::Password { .. }));

        assert!(credentials_from_lookup(&lookup(&[])).is_err());
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let err = gateway_from_lookup(lookup(&[("FLEET_PROVIDER", "ovh")])).err();
        assert!(matches!(err, Some(FleetError::Config(_))));
    }
}
