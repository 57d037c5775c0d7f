use fleet_engine::{gateways, logger, FleetSettings};
use fleet_providers::CloudGateway;
use tracing::info;

/// Prints the instances visible to the configured provider as JSON.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let settings = FleetSettings::from_env()?;
    let gateway = gateways::gateway_from_env()?;
    info!(
        provider = gateway.provider_name(),
        base_port = settings.base_port,
        worker_pool_size = settings.worker_pool_size,
        "fleet engine configured"
    );

    let instances = gateway.list_instances().await?;
    info!(count = instances.len(), "instances listed");
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}
