use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{BRIDGE_SERVICE_TYPE, TXT_SITE, TXT_SUPERVISOR};
use crate::config::BridgeConfig;

/// Announce the bridge API so clients can find the registry without
/// configuration. Addresses follow the enabled interfaces.
pub fn register_bridge(
    daemon: &ServiceDaemon,
    config: &BridgeConfig,
    api_port: u16,
) -> Result<ServiceInfo> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let instance_name = format!("ua-discovery-{}", config.supervisor_id);

    let mut txt_records = HashMap::from([(TXT_SUPERVISOR.to_string(), config.supervisor_id.clone())]);
    if let Some(site) = &config.site_id {
        txt_records.insert(TXT_SITE.to_string(), site.clone());
    }

    let service_info = ServiceInfo::new(
        BRIDGE_SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", hostname),
        "",
        api_port,
        txt_records,
    )
    .context("Failed to create ServiceInfo")?
    .enable_addr_auto();

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        "Registered {} as {} on port {}",
        BRIDGE_SERVICE_TYPE,
        instance_name,
        api_port
    );

    Ok(service_info)
}

pub fn unregister_bridge(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}
