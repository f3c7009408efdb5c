use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::{anyhow, Result};
use shared::types::{ApplicationQuery, ApplicationRecord, EndpointQuery, EndpointRecord};
use crate::config::RegistryConfig;
use crate::registry::store::{RecordStore, StoreError, StoreResult};
use crate::registry::Registry;
use crate::store::{db::RegistryDb, hash};

type Reply<T> = oneshot::Sender<StoreResult<T>>;

/// Writes closer together than this share one hash recompute
const HASH_QUIET: Duration = Duration::from_millis(200);

/// Upper bound on how stale the published hash gets under constant writes
const HASH_MAX_DELAY: Duration = Duration::from_secs(2);

/// Commands sent to the store thread
pub enum StoreCommand {
    GetApplication(String, Reply<Option<ApplicationRecord>>),
    CreateApplication(ApplicationRecord, Reply<ApplicationRecord>),
    UpdateApplication(ApplicationRecord, Reply<ApplicationRecord>),
    DeleteApplication(String, u64, Reply<()>),
    QueryApplications {
        filter: ApplicationQuery,
        after: Option<String>,
        limit: usize,
        reply: Reply<Vec<ApplicationRecord>>,
    },
    GetEndpoint(String, Reply<Option<EndpointRecord>>),
    CreateEndpoint(EndpointRecord, Reply<EndpointRecord>),
    UpdateEndpoint(EndpointRecord, Reply<EndpointRecord>),
    DeleteEndpoint(String, u64, Reply<()>),
    QueryEndpoints {
        filter: EndpointQuery,
        after: Option<String>,
        limit: usize,
        reply: Reply<Vec<EndpointRecord>>,
    },
    DisabledApplicationsBefore(DateTime<Utc>, Reply<Vec<ApplicationRecord>>),
    DisabledEndpointsBefore(DateTime<Utc>, Reply<Vec<EndpointRecord>>),
    Shutdown,
}

enum Step {
    Read,
    Wrote,
    Shutdown,
}

/// Handle to the registry database. The connection lives on a dedicated
/// thread; every call is a command with a oneshot reply.
#[derive(Clone)]
pub struct StoreHandle {
    tx: flume::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread. The content hash is republished once writes
    /// have been quiet for a moment, and at least every couple of seconds
    /// while they keep coming.
    pub fn spawn(db: RegistryDb, hash_tx: watch::Sender<String>) -> Self {
        Self::spawn_with(db, hash_tx, HASH_QUIET, HASH_MAX_DELAY)
    }

    fn spawn_with(
        db: RegistryDb,
        hash_tx: watch::Sender<String>,
        quiet: Duration,
        max_delay: Duration,
    ) -> Self {
        let (tx, rx) = flume::bounded::<StoreCommand>(256);

        thread::spawn(move || {
            // Time of the first write the published hash does not cover yet
            let mut dirty_since: Option<Instant> = None;
            loop {
                let cmd = match dirty_since {
                    None => match rx.recv() {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    },
                    Some(since) => {
                        let wait = quiet.min(max_delay.saturating_sub(since.elapsed()));
                        match rx.recv_timeout(wait) {
                            Ok(cmd) => cmd,
                            Err(flume::RecvTimeoutError::Timeout) => {
                                dirty_since = publish_hash(&db, &hash_tx, since);
                                continue;
                            }
                            Err(flume::RecvTimeoutError::Disconnected) => {
                                publish_hash(&db, &hash_tx, since);
                                break;
                            }
                        }
                    }
                };

                match handle(&db, cmd) {
                    Step::Read => {}
                    Step::Wrote => {
                        dirty_since.get_or_insert_with(Instant::now);
                    }
                    Step::Shutdown => {
                        if let Some(since) = dirty_since {
                            publish_hash(&db, &hash_tx, since);
                        }
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }

                if let Some(since) = dirty_since {
                    if since.elapsed() >= max_delay {
                        dirty_since = publish_hash(&db, &hash_tx, since);
                    }
                }
            }
        });

        Self { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> StoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(make(reply))
            .await
            .map_err(|_| StoreError::Backend(anyhow!("Store thread has stopped")))?;
        rx.await
            .map_err(|_| StoreError::Backend(anyhow!("Store thread dropped the request")))?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send_async(StoreCommand::Shutdown)
            .await
            .map_err(|_| anyhow!("Store thread has stopped"))?;
        Ok(())
    }
}

/// Recompute and publish the hash. Returns the dirty mark to keep: cleared on
/// success, unchanged when the hash could not be computed.
fn publish_hash(
    db: &RegistryDb,
    hash_tx: &watch::Sender<String>,
    dirty_since: Instant,
) -> Option<Instant> {
    match registry_hash(db) {
        Ok(new_hash) => {
            hash_tx.send_replace(new_hash);
            None
        }
        Err(e) => {
            tracing::error!("Failed to recompute registry hash: {}", e);
            Some(dirty_since)
        }
    }
}

/// Hash of everything currently stored
pub fn registry_hash(db: &RegistryDb) -> StoreResult<String> {
    Ok(hash::compute_hash(&db.all_applications()?, &db.all_endpoints()?))
}

fn handle(db: &RegistryDb, cmd: StoreCommand) -> Step {
    fn wrote<T>(result: &StoreResult<T>) -> Step {
        if result.is_ok() {
            Step::Wrote
        } else {
            Step::Read
        }
    }

    match cmd {
        StoreCommand::GetApplication(id, reply) => {
            let _ = reply.send(db.get_application(&id));
            Step::Read
        }
        StoreCommand::CreateApplication(record, reply) => {
            let result = db.create_application(&record);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::UpdateApplication(record, reply) => {
            let result = db.update_application(&record);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::DeleteApplication(id, version, reply) => {
            let result = db.delete_application(&id, version);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::QueryApplications { filter, after, limit, reply } => {
            let _ = reply.send(db.query_applications(&filter, after.as_deref(), limit));
            Step::Read
        }
        StoreCommand::GetEndpoint(id, reply) => {
            let _ = reply.send(db.get_endpoint(&id));
            Step::Read
        }
        StoreCommand::CreateEndpoint(record, reply) => {
            let result = db.create_endpoint(&record);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::UpdateEndpoint(record, reply) => {
            let result = db.update_endpoint(&record);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::DeleteEndpoint(id, version, reply) => {
            let result = db.delete_endpoint(&id, version);
            let step = wrote(&result);
            let _ = reply.send(result);
            step
        }
        StoreCommand::QueryEndpoints { filter, after, limit, reply } => {
            let _ = reply.send(db.query_endpoints(&filter, after.as_deref(), limit));
            Step::Read
        }
        StoreCommand::DisabledApplicationsBefore(cutoff, reply) => {
            let _ = reply.send(db.disabled_applications_before(&cutoff));
            Step::Read
        }
        StoreCommand::DisabledEndpointsBefore(cutoff, reply) => {
            let _ = reply.send(db.disabled_endpoints_before(&cutoff));
            Step::Read
        }
        StoreCommand::Shutdown => Step::Shutdown,
    }
}

#[async_trait]
impl RecordStore for StoreHandle {
    async fn get_application(&self, id: &str) -> StoreResult<Option<ApplicationRecord>> {
        let id = id.to_string();
        self.call(|reply| StoreCommand::GetApplication(id, reply)).await
    }

    async fn create_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord> {
        self.call(|reply| StoreCommand::CreateApplication(record, reply)).await
    }

    async fn update_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord> {
        self.call(|reply| StoreCommand::UpdateApplication(record, reply)).await
    }

    async fn delete_application(&self, id: &str, version: u64) -> StoreResult<()> {
        let id = id.to_string();
        self.call(|reply| StoreCommand::DeleteApplication(id, version, reply)).await
    }

    async fn query_applications(
        &self,
        filter: &ApplicationQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ApplicationRecord>> {
        let filter = filter.clone();
        let after = after.map(str::to_string);
        self.call(|reply| StoreCommand::QueryApplications { filter, after, limit, reply })
            .await
    }

    async fn get_endpoint(&self, id: &str) -> StoreResult<Option<EndpointRecord>> {
        let id = id.to_string();
        self.call(|reply| StoreCommand::GetEndpoint(id, reply)).await
    }

    async fn create_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord> {
        self.call(|reply| StoreCommand::CreateEndpoint(record, reply)).await
    }

    async fn update_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord> {
        self.call(|reply| StoreCommand::UpdateEndpoint(record, reply)).await
    }

    async fn delete_endpoint(&self, id: &str, version: u64) -> StoreResult<()> {
        let id = id.to_string();
        self.call(|reply| StoreCommand::DeleteEndpoint(id, version, reply)).await
    }

    async fn query_endpoints(
        &self,
        filter: &EndpointQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EndpointRecord>> {
        let filter = filter.clone();
        let after = after.map(str::to_string);
        self.call(|reply| StoreCommand::QueryEndpoints { filter, after, limit, reply })
            .await
    }

    async fn disabled_applications_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ApplicationRecord>> {
        self.call(|reply| StoreCommand::DisabledApplicationsBefore(cutoff, reply)).await
    }

    async fn disabled_endpoints_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointRecord>> {
        self.call(|reply| StoreCommand::DisabledEndpointsBefore(cutoff, reply)).await
    }
}

/// Registry maintenance loop: purges records that stayed disabled past the
/// retention window.
pub async fn run(
    registry: Arc<Registry>,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let retention = chrono::Duration::seconds(config.purge_after_secs.min(i64::MAX as u64) as i64);
    let mut maintenance_interval =
        tokio::time::interval(Duration::from_secs(config.purge_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = maintenance_interval.tick() => {
                match registry.purge_disabled(retention, Utc::now()).await {
                    Ok(summary) if summary.total() > 0 => {
                        tracing::info!(
                            "Purged {} applications and {} endpoints",
                            summary.applications,
                            summary.endpoints
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Failed to purge registry: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry maintenance shutting down");
                break;
            }
        }
    }

    Ok(())
}
