use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Position in a keyset-paginated listing. Encoded as hex JSON so callers
/// treat it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// Last record id handed out
    pub after: String,
    /// Digest of the query the token belongs to
    pub fingerprint: String,
}

impl Continuation {
    pub fn new(after: impl Into<String>, query: &impl Serialize) -> Self {
        Self {
            after: after.into(),
            fingerprint: fingerprint(query),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing two strings cannot fail
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode a token and check it was issued for `query`
    pub fn decode(token: &str, query: &impl Serialize) -> Option<Self> {
        let bytes = hex::decode(token.trim()).ok()?;
        let continuation: Continuation = serde_json::from_slice(&bytes).ok()?;
        (continuation.fingerprint == fingerprint(query)).then_some(continuation)
    }
}

/// Stable digest of a query filter
pub fn fingerprint(query: &impl Serialize) -> String {
    let json = serde_json::to_vec(query).unwrap_or_default();
    hex::encode(&Sha256::digest(&json)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ApplicationQuery;

    #[test]
    fn test_token_accepted_for_same_query() {
        let query = ApplicationQuery {
            site_id: Some("plant-1".to_string()),
            ..Default::default()
        };
        let token = Continuation::new("uas00ff", &query).encode();

        let decoded = Continuation::decode(&token, &query).unwrap();
        assert_eq!(decoded.after, "uas00ff");
    }

    #[test]
    fn test_token_rejected_for_other_query() {
        let issued_for = ApplicationQuery::default();
        let token = Continuation::new("uas00ff", &issued_for).encode();

        let other = ApplicationQuery {
            include_disabled: true,
            ..Default::default()
        };
        assert!(Continuation::decode(&token, &other).is_none());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let query = ApplicationQuery::default();
        assert!(Continuation::decode("not hex", &query).is_none());
        assert!(Continuation::decode("deadbeef", &query).is_none());
    }
}
