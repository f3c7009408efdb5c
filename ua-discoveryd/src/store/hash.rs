use std::collections::BTreeSet;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::{ApplicationRecord, Credential, EndpointRecord, SecurityMode};

/// Stable fields of an application. last_seen and version move on every
/// rescan without the registration changing.
#[derive(Serialize)]
struct ApplicationView<'a> {
    application_id: &'a str,
    application_uri: &'a str,
    supervisor_id: &'a str,
    site_id: Option<&'a str>,
    application_name: Option<&'a str>,
    application_type: &'a str,
    product_uri: Option<&'a str>,
    discovery_urls: &'a BTreeSet<String>,
    capabilities: &'a BTreeSet<String>,
    disabled: bool,
}

#[derive(Serialize)]
struct EndpointView<'a> {
    endpoint_id: &'a str,
    application_id: &'a str,
    url: &'a str,
    security_mode: SecurityMode,
    security_policy: Option<&'a str>,
    credential: &'a Credential,
    server_thumbprint: Option<&'a str>,
    security_level: Option<u8>,
    disabled: bool,
}

#[derive(Serialize)]
struct RegistryView<'a> {
    applications: Vec<ApplicationView<'a>>,
    endpoints: Vec<EndpointView<'a>>,
}

/// SHA-256 over the registry contents, independent of input order.
pub fn compute_hash(applications: &[ApplicationRecord], endpoints: &[EndpointRecord]) -> String {
    let mut app_indices: Vec<usize> = (0..applications.len()).collect();
    app_indices.sort_by(|&a, &b| applications[a].application_id.cmp(&applications[b].application_id));
    let mut endpoint_indices: Vec<usize> = (0..endpoints.len()).collect();
    endpoint_indices.sort_by(|&a, &b| endpoints[a].endpoint_id.cmp(&endpoints[b].endpoint_id));

    let view = RegistryView {
        applications: app_indices
            .iter()
            .map(|&i| {
                let a = &applications[i];
                ApplicationView {
                    application_id: &a.application_id,
                    application_uri: &a.application_uri,
                    supervisor_id: &a.supervisor_id,
                    site_id: a.site_id.as_deref(),
                    application_name: a.application_name.as_deref(),
                    application_type: a.application_type.as_str(),
                    product_uri: a.product_uri.as_deref(),
                    discovery_urls: &a.discovery_urls,
                    capabilities: &a.capabilities,
                    disabled: a.disabled,
                }
            })
            .collect(),
        endpoints: endpoint_indices
            .iter()
            .map(|&i| {
                let e = &endpoints[i];
                EndpointView {
                    endpoint_id: &e.endpoint_id,
                    application_id: &e.application_id,
                    url: &e.url,
                    security_mode: e.security_mode,
                    security_policy: e.security_policy.as_deref(),
                    credential: &e.credential,
                    server_thumbprint: e.server_thumbprint.as_deref(),
                    security_level: e.security_level,
                    disabled: e.disabled,
                }
            })
            .collect(),
    };

    // Borrowed strings and sets always serialize
    let json = serde_json::to_vec(&view).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::ApplicationType;

    fn application(id: &str) -> ApplicationRecord {
        ApplicationRecord {
            application_id: id.to_string(),
            application_uri: format!("urn:{}", id),
            supervisor_id: "sup".to_string(),
            site_id: None,
            application_name: None,
            application_type: ApplicationType::Server,
            product_uri: None,
            discovery_urls: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            host_addresses: BTreeSet::new(),
            created: Utc::now(),
            last_seen: Utc::now(),
            disabled: false,
            version: 1,
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let a = application("a");
        let b = application("b");

        let hash1 = compute_hash(&[a.clone(), b.clone()], &[]);
        let hash2 = compute_hash(&[b, a], &[]);
        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_disable() {
        let a = application("a");
        let mut disabled = a.clone();
        disabled.disabled = true;

        assert_ne!(compute_hash(&[a], &[]), compute_hash(&[disabled], &[]));
    }

    #[test]
    fn test_hash_stable_across_rescans() {
        let a = application("a");
        let mut rescanned = a.clone();
        rescanned.last_seen = Utc::now() + chrono::Duration::seconds(60);
        rescanned.version += 3;

        assert_eq!(compute_hash(&[a], &[]), compute_hash(&[rescanned], &[]));
    }
}
