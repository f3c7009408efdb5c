use std::collections::BTreeSet;
use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Message security mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Let the client pick the most secure configuration offered
    #[default]
    Best,
    None,
    Sign,
    SignAndEncrypt,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Best => "best",
            SecurityMode::None => "none",
            SecurityMode::Sign => "sign",
            SecurityMode::SignAndEncrypt => "sign_and_encrypt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "best" => Some(SecurityMode::Best),
            "none" => Some(SecurityMode::None),
            "sign" => Some(SecurityMode::Sign),
            "sign_and_encrypt" => Some(SecurityMode::SignAndEncrypt),
            _ => None,
        }
    }
}

/// Kind of user credential used to connect to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    #[default]
    None,
    UserName,
    X509Certificate,
    Token,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::None => "none",
            CredentialType::UserName => "user_name",
            CredentialType::X509Certificate => "x509_certificate",
            CredentialType::Token => "token",
        }
    }
}

/// User credential attached to an endpoint.
/// Equality and hashing are structural over the variant and its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    #[default]
    None,
    UserName {
        user: String,
        password: String,
    },
    X509Certificate {
        /// SHA-1 thumbprint of the client certificate, hex encoded
        thumbprint: String,
    },
    Token {
        token_type: String,
        value: String,
    },
}

/// Stands in for secrets in anything handed out over the API
pub const REDACTED: &str = "<redacted>";

impl Credential {
    /// Same credential with its secret replaced by `REDACTED`
    pub fn redacted(&self) -> Credential {
        match self {
            Credential::UserName { user, .. } => Credential::UserName {
                user: user.clone(),
                password: REDACTED.to_string(),
            },
            Credential::Token { token_type, .. } => Credential::Token {
                token_type: token_type.clone(),
                value: REDACTED.to_string(),
            },
            other => other.clone(),
        }
    }

    pub fn credential_type(&self) -> CredentialType {
        match self {
            Credential::None => CredentialType::None,
            Credential::UserName { .. } => CredentialType::UserName,
            Credential::X509Certificate { .. } => CredentialType::X509Certificate,
            Credential::Token { .. } => CredentialType::Token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    Server,
    Client,
    ClientAndServer,
    DiscoveryServer,
}

impl ApplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::Server => "server",
            ApplicationType::Client => "client",
            ApplicationType::ClientAndServer => "client_and_server",
            ApplicationType::DiscoveryServer => "discovery_server",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "server" => Some(ApplicationType::Server),
            "client" => Some(ApplicationType::Client),
            "client_and_server" => Some(ApplicationType::ClientAndServer),
            "discovery_server" => Some(ApplicationType::DiscoveryServer),
            _ => None,
        }
    }
}

/// Application metadata as reported by a server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Application URI, e.g. "urn:plc-7:UA:Server"
    pub application_uri: String,

    #[serde(default)]
    pub application_name: Option<String>,

    #[serde(default)]
    pub application_type: ApplicationType,

    #[serde(default)]
    pub product_uri: Option<String>,

    #[serde(default)]
    pub discovery_urls: BTreeSet<String>,

    /// Server capability identifiers, e.g. "DA", "HD"
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

/// One network and security configuration offered by a server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint URL, e.g. "opc.tcp://10.0.0.7:4840/UA/Server"
    pub url: String,

    #[serde(default)]
    pub security_mode: Option<SecurityMode>,

    #[serde(default)]
    pub security_policy: Option<String>,

    #[serde(default)]
    pub credential: Option<Credential>,

    /// Hex encoded thumbprint of the server certificate
    #[serde(default)]
    pub server_thumbprint: Option<String>,

    #[serde(default)]
    pub security_level: Option<u8>,
}

/// A single discovered endpoint together with the application exposing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub application: ApplicationInfo,
    pub endpoint: EndpointInfo,

    /// Address and port the endpoint was actually reached at
    #[serde(default)]
    pub host_address: Option<SocketAddr>,
}

/// Persisted application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    /// Identifier derived from (application URI, supervisor id)
    pub application_id: String,
    pub application_uri: String,

    /// Supervisor whose discovery scans own this record
    pub supervisor_id: String,
    pub site_id: Option<String>,
    pub application_name: Option<String>,
    pub application_type: ApplicationType,
    pub product_uri: Option<String>,
    pub discovery_urls: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    pub host_addresses: BTreeSet<String>,

    /// First time this application was seen
    pub created: DateTime<Utc>,

    /// Last time a scan observed this application
    pub last_seen: DateTime<Utc>,

    /// Set when a completed scan did not observe the application
    pub disabled: bool,

    /// Optimistic concurrency tag, bumped on every write
    pub version: u64,
}

/// Persisted endpoint registration, owned by exactly one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Identifier derived from the owning application and the endpoint identity
    pub endpoint_id: String,
    pub application_id: String,
    pub url: String,
    pub security_mode: SecurityMode,
    pub security_policy: Option<String>,
    pub credential: Credential,
    pub server_thumbprint: Option<String>,
    pub security_level: Option<u8>,
    pub last_seen: DateTime<Utc>,
    pub disabled: bool,
    pub version: u64,
}

impl EndpointRecord {
    /// Record as served to API clients, without credential secrets
    pub fn redacted(mut self) -> Self {
        self.credential = self.credential.redacted();
        self
    }
}

/// An application together with all endpoints it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRegistration {
    pub application: ApplicationRecord,
    pub endpoints: Vec<EndpointRecord>,
}

/// Filter for application queries. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationQuery {
    #[serde(default)]
    pub application_uri: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub application_type: Option<ApplicationType>,
    #[serde(default)]
    pub product_uri: Option<String>,
    #[serde(default)]
    pub supervisor_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    /// Include soft-disabled applications
    #[serde(default)]
    pub include_disabled: bool,
}

/// Filter for endpoint queries. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointQuery {
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub security_mode: Option<SecurityMode>,
    #[serde(default)]
    pub security_policy: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

/// One page of a listing plus the cursor for the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation_token: Option<String>,
}

/// Discovery scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// No scanning, only explicit registrations
    #[default]
    Off,
    /// Probe the addresses of this host only
    Local,
    /// Nearby subnet, well known ports
    Fast,
    /// Full attached subnets, well known ports
    Network,
    /// Full attached subnets, all ports
    Scan,
}

/// Classes of network interfaces to derive scan ranges from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    #[default]
    Wired,
    Wireless,
    Loopback,
    All,
}

/// Discovery configuration model as written by operators.
/// Absent values fall back to the defaults of the active mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub idle_time_between_scans_secs: Option<u64>,
    #[serde(default)]
    pub port_probe_timeout_ms: Option<u64>,
    #[serde(default)]
    pub network_probe_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_port_probes: Option<usize>,
    #[serde(default)]
    pub max_network_probes: Option<usize>,
    #[serde(default)]
    pub min_port_probes_percent: Option<u8>,
    #[serde(default)]
    pub max_scan_duration_secs: Option<u64>,

    /// e.g. "10.0.0.1-10.0.0.254;192.168.1.0/24"
    #[serde(default)]
    pub address_ranges: Option<String>,

    /// e.g. "4840-4841;48010"
    #[serde(default)]
    pub port_ranges: Option<String>,

    #[serde(default)]
    pub network_class: Option<NetworkClass>,

    /// Servers to probe directly on every scan, e.g. "opc.tcp://plc-7:4840"
    #[serde(default)]
    pub discovery_urls: Vec<String>,
}

/// Per entity change counts of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub disabled: usize,
    pub failed: usize,
}

/// Outcome of merging one discovery batch into the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub applications: ChangeCounts,
    pub endpoints: ChangeCounts,

    /// Records that could not be written, with the reason
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeSummary {
    pub applications: usize,
    pub endpoints: usize,
}

impl PurgeSummary {
    pub fn total(&self) -> usize {
        self.applications + self.endpoints
    }
}

/// Aggregate probe counters of one scan run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub addresses_probed: u64,
    pub addresses_reachable: u64,
    pub ports_probed: u64,
    pub ports_open: u64,
    pub ports_timed_out: u64,
    pub ports_abandoned: u64,
    pub handshakes_failed: u64,
    pub endpoints_found: u64,
}

/// Report of the last finished scan, exposed on the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub generation: u64,
    pub mode: DiscoveryMode,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub stats: ScanStats,
    pub cancelled: bool,
    pub deadline_expired: bool,
    pub summary: Option<ReconcileSummary>,
    pub error: Option<String>,
}

/// Discovery state visible to control surface callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    pub mode: DiscoveryMode,
    pub generation: u64,
    pub scanning: bool,
    pub last_scan: Option<ScanReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_type_follows_variant() {
        let cred = Credential::UserName {
            user: "operator".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(cred.credential_type(), CredentialType::UserName);
        assert_eq!(Credential::default().credential_type(), CredentialType::None);
    }

    #[test]
    fn test_redacted_credential_hides_secrets() {
        let user = Credential::UserName {
            user: "operator".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(
            user.redacted(),
            Credential::UserName {
                user: "operator".to_string(),
                password: REDACTED.to_string(),
            }
        );

        let token = Credential::Token {
            token_type: "jwt".to_string(),
            value: "abc".to_string(),
        };
        let json = serde_json::to_string(&token.redacted()).unwrap();
        assert!(json.contains("\"token_type\":\"jwt\""));
        assert!(!json.contains("abc"));

        let cert = Credential::X509Certificate { thumbprint: "ab12".to_string() };
        assert_eq!(cert.redacted(), cert);
        assert_eq!(Credential::None.redacted(), Credential::None);
    }

    #[test]
    fn test_credential_serialized_as_tagged_object() {
        let cred = Credential::Token {
            token_type: "jwt".to_string(),
            value: "abc".to_string(),
        };
        let json = serde_json::to_string(&cred).unwrap();
        assert!(json.contains("\"type\":\"token\""));

        let back: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cred);
    }

    #[test]
    fn test_discovery_config_defaults_from_empty_object() {
        let config: DiscoveryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DiscoveryConfig::default());
        assert!(config.discovery_urls.is_empty());
    }
}
