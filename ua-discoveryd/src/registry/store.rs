use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::types::{ApplicationQuery, ApplicationRecord, EndpointQuery, EndpointRecord};

/// Failure of a single store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record changed since it was read, or already exists on create
    #[error("version conflict on record {0}")]
    Conflict(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Versioned persistence of application and endpoint records.
///
/// Updates and deletes carry the version that was read; a mismatch fails
/// with `StoreError::Conflict` and leaves the record untouched. Successful
/// creates and updates return the record with its new version. Query
/// methods return records ordered by id, strictly after `after`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_application(&self, id: &str) -> StoreResult<Option<ApplicationRecord>>;
    async fn create_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord>;
    async fn update_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord>;
    /// Deleting an application deletes its endpoints
    async fn delete_application(&self, id: &str, version: u64) -> StoreResult<()>;
    async fn query_applications(
        &self,
        filter: &ApplicationQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ApplicationRecord>>;

    async fn get_endpoint(&self, id: &str) -> StoreResult<Option<EndpointRecord>>;
    async fn create_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord>;
    async fn update_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord>;
    async fn delete_endpoint(&self, id: &str, version: u64) -> StoreResult<()>;
    async fn query_endpoints(
        &self,
        filter: &EndpointQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EndpointRecord>>;

    /// Disabled applications last seen before `cutoff`
    async fn disabled_applications_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ApplicationRecord>>;

    /// Disabled endpoints last seen before `cutoff`
    async fn disabled_endpoints_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointRecord>>;
}
