use sha2::{Digest, Sha256};
use shared::types::{Credential, EndpointInfo, SecurityMode};

/// Identity of an application: its URI, compared case-insensitively, and the
/// supervisor whose scans own it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationKey {
    uri: String,
    supervisor_id: String,
}

impl ApplicationKey {
    pub fn new(uri: &str, supervisor_id: &str) -> Self {
        Self {
            uri: uri.trim().to_lowercase(),
            supervisor_id: supervisor_id.to_string(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Stable record id, `uas` followed by the hex SHA-256 of the key
    pub fn record_id(&self) -> String {
        let mut hasher = Sha256::new();
        feed(&mut hasher, &self.uri);
        feed(&mut hasher, &self.supervisor_id);
        format!("uas{}", hex::encode(hasher.finalize()))
    }
}

/// Identity of an endpoint within its application. An unset security mode
/// means `Best`, an unset credential means `Credential::None` and a blank
/// security policy counts as unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    url: String,
    security_mode: SecurityMode,
    security_policy: Option<String>,
    credential: Credential,
}

impl EndpointKey {
    pub fn new(
        url: &str,
        security_mode: Option<SecurityMode>,
        security_policy: Option<&str>,
        credential: Option<&Credential>,
    ) -> Self {
        Self {
            url: url.trim().to_string(),
            security_mode: security_mode.unwrap_or_default(),
            security_policy: security_policy
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            credential: credential.cloned().unwrap_or_default(),
        }
    }

    pub fn from_info(info: &EndpointInfo) -> Self {
        Self::new(
            &info.url,
            info.security_mode,
            info.security_policy.as_deref(),
            info.credential.as_ref(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    pub fn security_policy(&self) -> Option<&str> {
        self.security_policy.as_deref()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Stable record id, scoped to the owning application
    pub fn record_id(&self, application_id: &str) -> String {
        let mut hasher = Sha256::new();
        feed(&mut hasher, application_id);
        feed(&mut hasher, &self.url);
        feed(&mut hasher, self.security_mode.as_str());
        feed(&mut hasher, self.security_policy.as_deref().unwrap_or(""));
        feed(&mut hasher, self.credential.credential_type().as_str());
        match &self.credential {
            Credential::None => {}
            Credential::UserName { user, password } => {
                feed(&mut hasher, user);
                feed(&mut hasher, password);
            }
            Credential::X509Certificate { thumbprint } => feed(&mut hasher, thumbprint),
            Credential::Token { token_type, value } => {
                feed(&mut hasher, token_type);
                feed(&mut hasher, value);
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Length prefixed so that field boundaries cannot shift between keys
fn feed(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_application_uri_is_case_insensitive() {
        let a = ApplicationKey::new("urn:Plc-7:UA:Server", "sup-1");
        let b = ApplicationKey::new("URN:PLC-7:ua:server", "sup-1");
        assert_eq!(a, b);
        assert_eq!(a.record_id(), b.record_id());
        assert!(a.record_id().starts_with("uas"));
    }

    #[test]
    fn test_application_key_includes_supervisor() {
        let a = ApplicationKey::new("urn:plc-7", "sup-1");
        let b = ApplicationKey::new("urn:plc-7", "sup-2");
        assert_ne!(a, b);
        assert_ne!(a.record_id(), b.record_id());
    }

    #[test]
    fn test_absent_mode_and_credential_use_defaults() {
        let implicit = EndpointKey::new("opc.tcp://h:4840", None, None, None);
        let explicit = EndpointKey::new(
            "opc.tcp://h:4840",
            Some(SecurityMode::Best),
            None,
            Some(&Credential::None),
        );
        assert_eq!(implicit, explicit);
        assert_eq!(implicit.record_id("app"), explicit.record_id("app"));
    }

    #[test]
    fn test_credentials_compare_structurally() {
        let user = |name: &str| Credential::UserName {
            user: name.to_string(),
            password: "pw".to_string(),
        };
        let keys: HashSet<EndpointKey> = [
            EndpointKey::new("opc.tcp://h:4840", None, None, Some(&user("alice"))),
            EndpointKey::new("opc.tcp://h:4840", None, None, Some(&user("alice"))),
            EndpointKey::new("opc.tcp://h:4840", None, None, Some(&user("bob"))),
            EndpointKey::new(
                "opc.tcp://h:4840",
                None,
                None,
                Some(&Credential::X509Certificate { thumbprint: "alice".to_string() }),
            ),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_blank_policy_is_unset() {
        let unset = EndpointKey::new("opc.tcp://h:4840", None, None, None);
        let blank = EndpointKey::new("opc.tcp://h:4840", None, Some(""), None);
        let spaces = EndpointKey::new("opc.tcp://h:4840", None, Some("  "), None);
        assert_eq!(unset, blank);
        assert_eq!(unset, spaces);
        assert_eq!(blank.security_policy(), None);
        assert_eq!(unset.record_id("app"), blank.record_id("app"));
    }

    #[test]
    fn test_distinct_policies_are_distinct_endpoints() {
        let basic = EndpointKey::new("opc.tcp://h:4840", None, Some("Basic256"), None);
        let sha = EndpointKey::new("opc.tcp://h:4840", None, Some("Basic256Sha256"), None);
        assert_ne!(basic, sha);
        assert_ne!(basic.record_id("app"), sha.record_id("app"));
    }

    #[test]
    fn test_named_policy_differs_from_unset() {
        let unset = EndpointKey::new("opc.tcp://h:4840", None, None, None);
        let named = EndpointKey::new("opc.tcp://h:4840", None, Some("X"), None);
        assert_ne!(unset, named);
        assert_ne!(unset.record_id("app"), named.record_id("app"));
    }

    #[test]
    fn test_endpoint_id_scoped_to_application() {
        let key = EndpointKey::new("opc.tcp://h:4840", Some(SecurityMode::Sign), Some("Basic256"), None);
        assert_ne!(key.record_id("app-a"), key.record_id("app-b"));
    }
}
