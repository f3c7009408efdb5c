//! Registry error types.

use thiserror::Error;
use crate::registry::store::StoreError;

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// Concurrent writers kept winning; the caller may retry later
    #[error("{entity_type} {id} kept changing concurrently, giving up")]
    Conflict { entity_type: &'static str, id: String },

    #[error("continuation token does not belong to this query")]
    InvalidContinuation,

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: &'static str, id: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn conflict(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            entity_type,
            id: id.into(),
        }
    }

    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }
}
