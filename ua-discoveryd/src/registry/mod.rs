pub mod identity;
pub mod store;
pub mod token;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use shared::types::{
    ApplicationInfo, ApplicationQuery, ApplicationRecord, ApplicationRegistration, ChangeCounts,
    EndpointDescriptor, EndpointInfo, EndpointQuery, EndpointRecord, Page, PurgeSummary,
    ReconcileSummary,
};
use tracing::{debug, warn};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use identity::{ApplicationKey, EndpointKey};
use store::{RecordStore, StoreError, StoreResult};
use token::Continuation;

/// Page size used when walking whole collections internally
const SCAN_PAGE: usize = 500;

/// How much of the registry a batch speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// A complete scan: whatever the supervisor owns and the batch lacks is
    /// soft-disabled.
    Full,
    /// Partial scans, register requests and announcements only add and
    /// refresh.
    RegisterOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Updated,
    Unchanged,
}

fn count(counts: &mut ChangeCounts, change: Change) {
    match change {
        Change::Added => counts.added += 1,
        Change::Updated => counts.updated += 1,
        Change::Unchanged => counts.unchanged += 1,
    }
}

/// All descriptors of one application within a batch, merged.
struct ObservedApplication {
    info: ApplicationInfo,
    host_addresses: BTreeSet<String>,
    endpoints: BTreeMap<EndpointKey, EndpointInfo>,
}

/// Catalog of discovered applications and endpoints on top of a versioned
/// record store. Every write is read-modify-write against the version that
/// was read; conflicts are retried a bounded number of times.
pub struct Registry {
    store: Arc<dyn RecordStore>,
    conflict_retries: u32,
    default_page_size: usize,
    max_page_size: usize,
}

impl Registry {
    pub fn new(store: Arc<dyn RecordStore>, config: &RegistryConfig) -> Self {
        Self {
            store,
            conflict_retries: config.conflict_retries,
            default_page_size: config.default_page_size.max(1),
            max_page_size: config.max_page_size.max(1),
        }
    }

    /// Merge a discovery batch into the registry on behalf of
    /// `supervisor_id`. The batch is treated as a set. Per-record failures are
    /// counted and listed in the summary; only failures to enumerate what the
    /// supervisor owns abort the call.
    pub async fn reconcile(
        &self,
        batch: &[EndpointDescriptor],
        supervisor_id: &str,
        site_id: Option<&str>,
        now: DateTime<Utc>,
        mode: ReconcileMode,
    ) -> RegistryResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let groups = group_batch(batch, supervisor_id, &mut summary);
        let mut touched = HashSet::new();

        for (key, observed) in &groups {
            let application_id = key.record_id();
            touched.insert(application_id.clone());

            match self
                .upsert_application(&application_id, observed, supervisor_id, site_id, now)
                .await
            {
                Ok(change) => count(&mut summary.applications, change),
                Err(e) => {
                    warn!("Failed to reconcile application {}: {}", key.uri(), e);
                    summary.applications.failed += 1;
                    summary.endpoints.failed += observed.endpoints.len();
                    summary.failures.push(e.to_string());
                    continue;
                }
            }

            let mut seen = HashSet::new();
            for (endpoint_key, info) in &observed.endpoints {
                let endpoint_id = endpoint_key.record_id(&application_id);
                seen.insert(endpoint_id.clone());

                match self
                    .upsert_endpoint(&endpoint_id, &application_id, endpoint_key, info, now)
                    .await
                {
                    Ok(change) => count(&mut summary.endpoints, change),
                    Err(e) => {
                        warn!("Failed to reconcile endpoint {}: {}", endpoint_key.url(), e);
                        summary.endpoints.failed += 1;
                        summary.failures.push(e.to_string());
                    }
                }
            }

            if mode == ReconcileMode::Full {
                for endpoint in self.endpoints_of(&application_id).await? {
                    if !endpoint.disabled && !seen.contains(&endpoint.endpoint_id) {
                        self.disable_endpoint_counted(&endpoint.endpoint_id, &mut summary)
                            .await;
                    }
                }
            }
        }

        if mode == ReconcileMode::Full {
            for application in self.applications_of(supervisor_id).await? {
                if application.disabled || touched.contains(&application.application_id) {
                    continue;
                }
                match self.set_application_disabled(&application.application_id, true).await {
                    Ok(true) => summary.applications.disabled += 1,
                    Ok(false) | Err(RegistryError::NotFound { .. }) => continue,
                    Err(e) => {
                        warn!("Failed to disable application {}: {}", application.application_uri, e);
                        summary.applications.failed += 1;
                        summary.failures.push(e.to_string());
                        continue;
                    }
                }
                for endpoint in self.endpoints_of(&application.application_id).await? {
                    if !endpoint.disabled {
                        self.disable_endpoint_counted(&endpoint.endpoint_id, &mut summary)
                            .await;
                    }
                }
            }
        }

        debug!(
            "Reconciled {} descriptors for {}: applications {:?}, endpoints {:?}",
            batch.len(),
            supervisor_id,
            summary.applications,
            summary.endpoints
        );
        Ok(summary)
    }

    /// Delete disabled applications (with their endpoints) and disabled
    /// endpoints last seen before `now - not_seen_for`. Records that changed
    /// since they were listed are re-checked, so a concurrent reconcile that
    /// revives a record wins.
    pub async fn purge_disabled(
        &self,
        not_seen_for: chrono::Duration,
        now: DateTime<Utc>,
    ) -> RegistryResult<PurgeSummary> {
        let cutoff = now - not_seen_for;
        let mut summary = PurgeSummary::default();
        let store = self.store.as_ref();

        for application in store.disabled_applications_before(cutoff).await? {
            let id = application.application_id.as_str();
            let purged = self
                .retry("application", id, move || async move {
                    let Some(current) = store.get_application(id).await? else {
                        return Ok(None);
                    };
                    if !current.disabled || current.last_seen >= cutoff {
                        return Ok(None);
                    }
                    let endpoints = self.endpoints_of(id).await?.len();
                    match store.delete_application(id, current.version).await {
                        Ok(()) => Ok(Some(endpoints)),
                        Err(StoreError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    }
                })
                .await;
            match purged {
                Ok(Some(endpoints)) => {
                    summary.applications += 1;
                    summary.endpoints += endpoints;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to purge application {}: {}", id, e),
            }
        }

        for endpoint in store.disabled_endpoints_before(cutoff).await? {
            let id = endpoint.endpoint_id.as_str();
            let purged = self
                .retry("endpoint", id, move || async move {
                    let Some(current) = store.get_endpoint(id).await? else {
                        return Ok(false);
                    };
                    if !current.disabled || current.last_seen >= cutoff {
                        return Ok(false);
                    }
                    match store.delete_endpoint(id, current.version).await {
                        Ok(()) => Ok(true),
                        Err(StoreError::NotFound(_)) => Ok(false),
                        Err(e) => Err(e),
                    }
                })
                .await;
            match purged {
                Ok(true) => summary.endpoints += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to purge endpoint {}: {}", id, e),
            }
        }

        Ok(summary)
    }

    pub async fn list_applications(
        &self,
        continuation: Option<&str>,
        page_size: Option<usize>,
    ) -> RegistryResult<Page<ApplicationRecord>> {
        self.query_applications(&ApplicationQuery::default(), continuation, page_size)
            .await
    }

    pub async fn query_applications(
        &self,
        filter: &ApplicationQuery,
        continuation: Option<&str>,
        page_size: Option<usize>,
    ) -> RegistryResult<Page<ApplicationRecord>> {
        let after = decode_continuation(continuation, filter)?;
        let limit = self.page_size(page_size);
        let items = self
            .store
            .query_applications(filter, after.as_deref(), limit + 1)
            .await?;
        Ok(paginate(items, limit, filter, |a| &a.application_id))
    }

    pub async fn list_endpoints(
        &self,
        continuation: Option<&str>,
        page_size: Option<usize>,
    ) -> RegistryResult<Page<EndpointRecord>> {
        self.query_endpoints(&EndpointQuery::default(), continuation, page_size)
            .await
    }

    pub async fn query_endpoints(
        &self,
        filter: &EndpointQuery,
        continuation: Option<&str>,
        page_size: Option<usize>,
    ) -> RegistryResult<Page<EndpointRecord>> {
        let after = decode_continuation(continuation, filter)?;
        let limit = self.page_size(page_size);
        let items = self
            .store
            .query_endpoints(filter, after.as_deref(), limit + 1)
            .await?;
        Ok(paginate(items, limit, filter, |e| &e.endpoint_id))
    }

    /// An application with all of its endpoints
    pub async fn get_application(&self, id: &str) -> RegistryResult<ApplicationRegistration> {
        let application = self
            .store
            .get_application(id)
            .await?
            .ok_or_else(|| RegistryError::not_found("application", id))?;
        let endpoints = self.endpoints_of(id).await?;
        Ok(ApplicationRegistration {
            application,
            endpoints,
        })
    }

    pub async fn get_endpoint(&self, id: &str) -> RegistryResult<EndpointRecord> {
        self.store
            .get_endpoint(id)
            .await?
            .ok_or_else(|| RegistryError::not_found("endpoint", id))
    }

    /// Soft-disable an application and its endpoints
    pub async fn disable_application(&self, id: &str) -> RegistryResult<()> {
        self.set_application_disabled(id, true).await?;
        self.set_endpoints_disabled(id, true).await
    }

    /// Re-enable an application and its endpoints
    pub async fn enable_application(&self, id: &str) -> RegistryResult<()> {
        self.set_application_disabled(id, false).await?;
        self.set_endpoints_disabled(id, false).await
    }

    /// Delete an application and its endpoints right away
    pub async fn unregister_application(&self, id: &str) -> RegistryResult<()> {
        let store = self.store.as_ref();
        self.retry("application", id, move || async move {
            let current = store
                .get_application(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            store.delete_application(id, current.version).await
        })
        .await
    }

    fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }

    async fn upsert_application(
        &self,
        id: &str,
        observed: &ObservedApplication,
        supervisor_id: &str,
        site_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> RegistryResult<Change> {
        let store = self.store.as_ref();
        self.retry("application", id, move || async move {
            match store.get_application(id).await? {
                None => {
                    let record = new_application(id, observed, supervisor_id, site_id, now);
                    store.create_application(record).await?;
                    Ok(Change::Added)
                }
                Some(existing) => {
                    let (record, change, write) =
                        merge_application(existing, observed, site_id, now);
                    if write {
                        store
                            .update_application(record)
                            .await
                            .map_err(vanished_is_conflict)?;
                    }
                    Ok(change)
                }
            }
        })
        .await
    }

    async fn upsert_endpoint(
        &self,
        id: &str,
        application_id: &str,
        key: &EndpointKey,
        info: &EndpointInfo,
        now: DateTime<Utc>,
    ) -> RegistryResult<Change> {
        let store = self.store.as_ref();
        self.retry("endpoint", id, move || async move {
            match store.get_endpoint(id).await? {
                None => {
                    let record = new_endpoint(id, application_id, key, info, now);
                    store.create_endpoint(record).await?;
                    Ok(Change::Added)
                }
                Some(existing) => {
                    let (record, change, write) = merge_endpoint(existing, info, now);
                    if write {
                        store
                            .update_endpoint(record)
                            .await
                            .map_err(vanished_is_conflict)?;
                    }
                    Ok(change)
                }
            }
        })
        .await
    }

    /// Returns whether the flag actually changed
    async fn set_application_disabled(&self, id: &str, disabled: bool) -> RegistryResult<bool> {
        let store = self.store.as_ref();
        self.retry("application", id, move || async move {
            let mut record = store
                .get_application(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if record.disabled == disabled {
                return Ok(false);
            }
            record.disabled = disabled;
            store.update_application(record).await?;
            Ok(true)
        })
        .await
    }

    async fn set_endpoint_disabled(&self, id: &str, disabled: bool) -> RegistryResult<bool> {
        let store = self.store.as_ref();
        self.retry("endpoint", id, move || async move {
            let mut record = store
                .get_endpoint(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if record.disabled == disabled {
                return Ok(false);
            }
            record.disabled = disabled;
            store.update_endpoint(record).await?;
            Ok(true)
        })
        .await
    }

    async fn set_endpoints_disabled(&self, application_id: &str, disabled: bool) -> RegistryResult<()> {
        for endpoint in self.endpoints_of(application_id).await? {
            match self.set_endpoint_disabled(&endpoint.endpoint_id, disabled).await {
                Ok(_) | Err(RegistryError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn disable_endpoint_counted(&self, id: &str, summary: &mut ReconcileSummary) {
        match self.set_endpoint_disabled(id, true).await {
            Ok(true) => summary.endpoints.disabled += 1,
            Ok(false) | Err(RegistryError::NotFound { .. }) => {}
            Err(e) => {
                warn!("Failed to disable endpoint {}: {}", id, e);
                summary.endpoints.failed += 1;
                summary.failures.push(e.to_string());
            }
        }
    }

    async fn endpoints_of(&self, application_id: &str) -> StoreResult<Vec<EndpointRecord>> {
        let filter = EndpointQuery {
            application_id: Some(application_id.to_string()),
            include_disabled: true,
            ..Default::default()
        };
        let mut all: Vec<EndpointRecord> = Vec::new();
        loop {
            let after = all.last().map(|e| e.endpoint_id.clone());
            let page = self
                .store
                .query_endpoints(&filter, after.as_deref(), SCAN_PAGE)
                .await?;
            let done = page.len() < SCAN_PAGE;
            all.extend(page);
            if done {
                return Ok(all);
            }
        }
    }

    async fn applications_of(&self, supervisor_id: &str) -> StoreResult<Vec<ApplicationRecord>> {
        let filter = ApplicationQuery {
            supervisor_id: Some(supervisor_id.to_string()),
            include_disabled: true,
            ..Default::default()
        };
        let mut all: Vec<ApplicationRecord> = Vec::new();
        loop {
            let after = all.last().map(|a| a.application_id.clone());
            let page = self
                .store
                .query_applications(&filter, after.as_deref(), SCAN_PAGE)
                .await?;
            let done = page.len() < SCAN_PAGE;
            all.extend(page);
            if done {
                return Ok(all);
            }
        }
    }

    /// Run a read-modify-write attempt until it stops hitting version
    /// conflicts or the retry budget is spent.
    async fn retry<T, F, Fut>(&self, entity_type: &'static str, id: &str, mut attempt: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        for round in 0..=self.conflict_retries {
            match attempt().await {
                Err(StoreError::Conflict(_)) => {
                    debug!("Version conflict on {} {} (attempt {})", entity_type, id, round + 1);
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(RegistryError::not_found(entity_type, id));
                }
                other => return other.map_err(RegistryError::from),
            }
        }
        warn!(
            "Giving up on {} {} after {} version conflicts",
            entity_type,
            id,
            self.conflict_retries + 1
        );
        Err(RegistryError::conflict(entity_type, id))
    }
}

/// A record deleted between read and write is re-read like any other race
fn vanished_is_conflict(e: StoreError) -> StoreError {
    match e {
        StoreError::NotFound(id) => StoreError::Conflict(id),
        other => other,
    }
}

fn decode_continuation(
    token: Option<&str>,
    query: &impl serde::Serialize,
) -> RegistryResult<Option<String>> {
    match token.filter(|t| !t.is_empty()) {
        None => Ok(None),
        Some(token) => Continuation::decode(token, query)
            .map(|c| Some(c.after))
            .ok_or(RegistryError::InvalidContinuation),
    }
}

/// Trim a `limit + 1` fetch to a page and mint the token for the next one
fn paginate<T>(
    mut items: Vec<T>,
    limit: usize,
    query: &impl serde::Serialize,
    id_of: impl Fn(&T) -> &String,
) -> Page<T> {
    let continuation_token = if items.len() > limit {
        items.truncate(limit);
        items
            .last()
            .map(|last| Continuation::new(id_of(last).as_str(), query).encode())
    } else {
        None
    };
    Page {
        items,
        continuation_token,
    }
}

fn group_batch(
    batch: &[EndpointDescriptor],
    supervisor_id: &str,
    summary: &mut ReconcileSummary,
) -> BTreeMap<ApplicationKey, ObservedApplication> {
    let mut groups: BTreeMap<ApplicationKey, ObservedApplication> = BTreeMap::new();

    for descriptor in batch {
        let uri = descriptor.application.application_uri.trim();
        if uri.is_empty() {
            warn!("Ignoring endpoint {} without application URI", descriptor.endpoint.url);
            summary.endpoints.failed += 1;
            summary
                .failures
                .push(format!("endpoint {} has no application URI", descriptor.endpoint.url));
            continue;
        }

        let key = ApplicationKey::new(uri, supervisor_id);
        let group = groups.entry(key).or_insert_with(|| ObservedApplication {
            info: descriptor.application.clone(),
            host_addresses: BTreeSet::new(),
            endpoints: BTreeMap::new(),
        });

        let info = &mut group.info;
        let incoming = &descriptor.application;
        info.discovery_urls.extend(incoming.discovery_urls.iter().cloned());
        info.capabilities.extend(incoming.capabilities.iter().cloned());
        replace_if_set(&mut info.application_name, incoming.application_name.as_ref());
        replace_if_set(&mut info.product_uri, incoming.product_uri.as_ref());
        info.application_type = incoming.application_type;

        if let Some(address) = descriptor.host_address {
            group.host_addresses.insert(address.to_string());
        }

        let endpoint_key = EndpointKey::from_info(&descriptor.endpoint);
        group
            .endpoints
            .entry(endpoint_key)
            .and_modify(|existing| {
                replace_if_set(&mut existing.server_thumbprint, descriptor.endpoint.server_thumbprint.as_ref());
                replace_if_set(&mut existing.security_level, descriptor.endpoint.security_level.as_ref());
            })
            .or_insert_with(|| descriptor.endpoint.clone());
    }

    groups
}

fn new_application(
    id: &str,
    observed: &ObservedApplication,
    supervisor_id: &str,
    site_id: Option<&str>,
    now: DateTime<Utc>,
) -> ApplicationRecord {
    ApplicationRecord {
        application_id: id.to_string(),
        application_uri: observed.info.application_uri.trim().to_string(),
        supervisor_id: supervisor_id.to_string(),
        site_id: site_id.map(str::to_string),
        application_name: observed.info.application_name.clone(),
        application_type: observed.info.application_type,
        product_uri: observed.info.product_uri.clone(),
        discovery_urls: observed.info.discovery_urls.clone(),
        capabilities: observed.info.capabilities.clone(),
        host_addresses: observed.host_addresses.clone(),
        created: now,
        last_seen: now,
        disabled: false,
        version: 0,
    }
}

/// Returns the merged record, how it changed, and whether it needs a write
fn merge_application(
    existing: ApplicationRecord,
    observed: &ObservedApplication,
    site_id: Option<&str>,
    now: DateTime<Utc>,
) -> (ApplicationRecord, Change, bool) {
    let mut record = existing;
    let mut changed = false;

    changed |= union(&mut record.discovery_urls, &observed.info.discovery_urls);
    changed |= union(&mut record.capabilities, &observed.info.capabilities);
    changed |= union(&mut record.host_addresses, &observed.host_addresses);
    changed |= replace_if_set(&mut record.application_name, observed.info.application_name.as_ref());
    changed |= replace_if_set(&mut record.product_uri, observed.info.product_uri.as_ref());
    changed |= replace_if_set(&mut record.site_id, site_id.map(str::to_string).as_ref());
    if record.application_type != observed.info.application_type {
        record.application_type = observed.info.application_type;
        changed = true;
    }
    if record.disabled {
        record.disabled = false;
        changed = true;
    }

    let refreshed = now > record.last_seen;
    if refreshed {
        record.last_seen = now;
    }

    let change = if changed { Change::Updated } else { Change::Unchanged };
    (record, change, changed || refreshed)
}

fn new_endpoint(
    id: &str,
    application_id: &str,
    key: &EndpointKey,
    info: &EndpointInfo,
    now: DateTime<Utc>,
) -> EndpointRecord {
    EndpointRecord {
        endpoint_id: id.to_string(),
        application_id: application_id.to_string(),
        url: key.url().to_string(),
        security_mode: key.security_mode(),
        security_policy: key.security_policy().map(str::to_string),
        credential: key.credential().clone(),
        server_thumbprint: info.server_thumbprint.clone(),
        security_level: info.security_level,
        last_seen: now,
        disabled: false,
        version: 0,
    }
}

fn merge_endpoint(
    existing: EndpointRecord,
    info: &EndpointInfo,
    now: DateTime<Utc>,
) -> (EndpointRecord, Change, bool) {
    let mut record = existing;
    let mut changed = false;

    changed |= replace_if_set(&mut record.server_thumbprint, info.server_thumbprint.as_ref());
    changed |= replace_if_set(&mut record.security_level, info.security_level.as_ref());
    if record.disabled {
        record.disabled = false;
        changed = true;
    }

    let refreshed = now > record.last_seen;
    if refreshed {
        record.last_seen = now;
    }

    let change = if changed { Change::Updated } else { Change::Unchanged };
    (record, change, changed || refreshed)
}

fn union(target: &mut BTreeSet<String>, incoming: &BTreeSet<String>) -> bool {
    let before = target.len();
    target.extend(incoming.iter().cloned());
    target.len() != before
}

/// Last write wins, but an absent value never clears a known one
fn replace_if_set<T: PartialEq + Clone>(slot: &mut Option<T>, value: Option<&T>) -> bool {
    match value {
        Some(value) if slot.as_ref() != Some(value) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use tokio::sync::watch;
    use crate::store::db::RegistryDb;
    use crate::store_manager::StoreHandle;

    fn store() -> StoreHandle {
        let db = RegistryDb::open(":memory:").unwrap();
        let (hash_tx, _hash_rx) = watch::channel(String::new());
        StoreHandle::spawn(db, hash_tx)
    }

    fn registry_over(store: Arc<dyn RecordStore>, conflict_retries: u32) -> Registry {
        let config = RegistryConfig {
            conflict_retries,
            default_page_size: 2,
            ..Default::default()
        };
        Registry::new(store, &config)
    }

    fn registry() -> Registry {
        registry_over(Arc::new(store()), 3)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn descriptor(uri: &str, endpoint: &str) -> EndpointDescriptor {
        EndpointDescriptor {
            application: ApplicationInfo {
                application_uri: uri.to_string(),
                capabilities: BTreeSet::from(["DA".to_string()]),
                ..Default::default()
            },
            endpoint: EndpointInfo {
                url: format!("opc.tcp://10.0.0.7:4840/{}", endpoint),
                ..Default::default()
            },
            host_address: Some("10.0.0.7:4840".parse().unwrap()),
        }
    }

    fn app_id(uri: &str, supervisor: &str) -> String {
        ApplicationKey::new(uri, supervisor).record_id()
    }

    fn endpoint_by_suffix<'a>(registration: &'a ApplicationRegistration, suffix: &str) -> &'a EndpointRecord {
        registration
            .endpoints
            .iter()
            .find(|e| e.url.ends_with(suffix))
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_endpoint_disabled_then_purged() {
        let registry = registry();
        let batch_a = [descriptor("urn:app1", "ep1"), descriptor("urn:app1", "ep2")];
        let batch_b = [descriptor("urn:app1", "ep1")];

        let summary = registry
            .reconcile(&batch_a, "sup", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications.added, 1);
        assert_eq!(summary.endpoints.added, 2);

        let t1 = t0() + Duration::hours(1);
        let summary = registry
            .reconcile(&batch_b, "sup", None, t1, ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.endpoints.disabled, 1);
        assert_eq!(summary.applications.disabled, 0);

        let registration = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        assert!(!registration.application.disabled);
        assert_eq!(endpoint_by_suffix(&registration, "ep1").last_seen, t1);
        assert!(!endpoint_by_suffix(&registration, "ep1").disabled);
        assert!(endpoint_by_suffix(&registration, "ep2").disabled);

        let purged = registry.purge_disabled(Duration::hours(2), t1).await.unwrap();
        assert_eq!(purged.total(), 0);

        let later = t0() + Duration::days(2);
        let purged = registry.purge_disabled(Duration::days(1), later).await.unwrap();
        assert_eq!(purged, PurgeSummary { applications: 0, endpoints: 1 });

        let registration = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        assert_eq!(registration.endpoints.len(), 1);
        assert!(registration.endpoints[0].url.ends_with("ep1"));

        let again = registry.purge_disabled(Duration::days(1), later).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let registry = registry();
        let batch = [descriptor("urn:app1", "ep1"), descriptor("urn:app1", "ep2")];

        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();
        let before = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();

        let summary = registry
            .reconcile(&batch, "sup", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications, ChangeCounts { unchanged: 1, ..Default::default() });
        assert_eq!(summary.endpoints, ChangeCounts { unchanged: 2, ..Default::default() });

        let after = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        assert_eq!(before.application, after.application);
        assert_eq!(before.endpoints, after.endpoints);
    }

    #[tokio::test]
    async fn test_last_seen_refresh_is_not_an_update() {
        let registry = registry();
        let batch = [descriptor("urn:app1", "ep1")];

        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();
        let t1 = t0() + Duration::minutes(5);
        let summary = registry.reconcile(&batch, "sup", None, t1, ReconcileMode::Full).await.unwrap();
        assert_eq!(summary.applications.updated, 0);
        assert_eq!(summary.applications.unchanged, 1);

        // An older observation never moves last-seen backwards
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();
        let registration = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        assert_eq!(registration.application.last_seen, t1);
        assert_eq!(registration.application.created, t0());
    }

    #[tokio::test]
    async fn test_full_reconcile_leaves_other_supervisors_alone() {
        let registry = registry();
        registry
            .reconcile(&[descriptor("urn:app1", "ep1")], "sup-a", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        registry
            .reconcile(&[descriptor("urn:app2", "ep1")], "sup-b", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();

        let summary = registry
            .reconcile(&[], "sup-a", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications.disabled, 1);
        assert_eq!(summary.endpoints.disabled, 1);

        let a = registry.get_application(&app_id("urn:app1", "sup-a")).await.unwrap();
        assert!(a.application.disabled);
        assert!(a.endpoints.iter().all(|e| e.disabled));

        let b = registry.get_application(&app_id("urn:app2", "sup-b")).await.unwrap();
        assert!(!b.application.disabled);
        assert!(b.endpoints.iter().all(|e| !e.disabled));
    }

    #[tokio::test]
    async fn test_register_only_never_disables() {
        let registry = registry();
        let batch = [descriptor("urn:app1", "ep1"), descriptor("urn:app1", "ep2")];
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        let summary = registry
            .reconcile(&[descriptor("urn:app2", "ep1")], "sup", None, t0(), ReconcileMode::RegisterOnly)
            .await
            .unwrap();
        assert_eq!(summary.applications.added, 1);
        assert_eq!(summary.applications.disabled, 0);
        assert_eq!(summary.endpoints.disabled, 0);
    }

    #[tokio::test]
    async fn test_rediscovery_reenables_and_merges_metadata() {
        let registry = registry();
        let batch = [descriptor("urn:app1", "ep1")];
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();
        registry.reconcile(&[], "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        let mut richer = descriptor("URN:APP1", "ep1");
        richer.application.application_name = Some("Press line".to_string());
        richer.application.capabilities = BTreeSet::from(["HD".to_string()]);

        let summary = registry
            .reconcile(&[richer], "sup", Some("plant-1"), t0() + Duration::hours(1), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications.updated, 1);
        assert_eq!(summary.applications.added, 0);
        assert_eq!(summary.endpoints.updated, 1);

        let registration = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        let application = registration.application;
        assert!(!application.disabled);
        assert_eq!(application.application_name.as_deref(), Some("Press line"));
        assert_eq!(application.site_id.as_deref(), Some("plant-1"));
        assert_eq!(
            application.capabilities,
            BTreeSet::from(["DA".to_string(), "HD".to_string()])
        );
    }

    #[tokio::test]
    async fn test_descriptor_without_uri_is_counted_not_fatal() {
        let registry = registry();
        let batch = [descriptor("", "ep1"), descriptor("urn:app1", "ep1")];

        let summary = registry
            .reconcile(&batch, "sup", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications.added, 1);
        assert_eq!(summary.endpoints.failed, 1);
        assert_eq!(summary.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_paging_visits_every_record_once() {
        let registry = registry();
        let batch: Vec<_> = (0..5)
            .map(|i| descriptor(&format!("urn:app{}", i), "ep"))
            .collect();
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = registry.list_applications(token.as_deref(), None).await.unwrap();
            assert!(page.items.len() <= 2);
            seen.extend(page.items.into_iter().map(|a| a.application_id));
            token = page.continuation_token;
            if token.is_none() {
                break;
            }
        }

        let unique: BTreeSet<_> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_token_from_other_query_rejected() {
        let registry = registry();
        let batch: Vec<_> = (0..3)
            .map(|i| descriptor(&format!("urn:app{}", i), "ep"))
            .collect();
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        let page = registry.list_applications(None, Some(1)).await.unwrap();
        let token = page.continuation_token.unwrap();

        let filter = ApplicationQuery {
            supervisor_id: Some("sup".to_string()),
            ..Default::default()
        };
        let result = registry.query_applications(&filter, Some(&token), Some(1)).await;
        assert!(matches!(result, Err(RegistryError::InvalidContinuation)));
    }

    #[tokio::test]
    async fn test_manual_disable_enable_and_unregister() {
        let registry = registry();
        let batch = [descriptor("urn:app1", "ep1"), descriptor("urn:app1", "ep2")];
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();
        let id = app_id("urn:app1", "sup");

        registry.disable_application(&id).await.unwrap();
        let registration = registry.get_application(&id).await.unwrap();
        assert!(registration.application.disabled);
        assert!(registration.endpoints.iter().all(|e| e.disabled));

        registry.enable_application(&id).await.unwrap();
        let registration = registry.get_application(&id).await.unwrap();
        assert!(!registration.application.disabled);
        assert!(registration.endpoints.iter().all(|e| !e.disabled));

        registry.unregister_application(&id).await.unwrap();
        assert!(matches!(
            registry.get_application(&id).await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.list_endpoints(None, Some(10)).await.unwrap().items.is_empty());
        assert!(matches!(
            registry.unregister_application(&id).await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_keeps_records_inside_window() {
        let registry = registry();
        registry
            .reconcile(&[descriptor("urn:app1", "ep1")], "sup", None, t0(), ReconcileMode::Full)
            .await
            .unwrap();
        registry.reconcile(&[], "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        let inside = registry
            .purge_disabled(Duration::days(7), t0() + Duration::days(6))
            .await
            .unwrap();
        assert_eq!(inside.total(), 0);

        let outside = registry
            .purge_disabled(Duration::days(7), t0() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(outside, PurgeSummary { applications: 1, endpoints: 1 });
    }

    /// Store wrapper whose application updates lose the race a set number
    /// of times.
    struct RacingStore {
        inner: StoreHandle,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn get_application(&self, id: &str) -> StoreResult<Option<ApplicationRecord>> {
            self.inner.get_application(id).await
        }
        async fn create_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord> {
            self.inner.create_application(record).await
        }
        async fn update_application(&self, record: ApplicationRecord) -> StoreResult<ApplicationRecord> {
            let lost = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Err(StoreError::Conflict(record.application_id));
            }
            self.inner.update_application(record).await
        }
        async fn delete_application(&self, id: &str, version: u64) -> StoreResult<()> {
            self.inner.delete_application(id, version).await
        }
        async fn query_applications(
            &self,
            filter: &ApplicationQuery,
            after: Option<&str>,
            limit: usize,
        ) -> StoreResult<Vec<ApplicationRecord>> {
            self.inner.query_applications(filter, after, limit).await
        }
        async fn get_endpoint(&self, id: &str) -> StoreResult<Option<EndpointRecord>> {
            self.inner.get_endpoint(id).await
        }
        async fn create_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord> {
            self.inner.create_endpoint(record).await
        }
        async fn update_endpoint(&self, record: EndpointRecord) -> StoreResult<EndpointRecord> {
            self.inner.update_endpoint(record).await
        }
        async fn delete_endpoint(&self, id: &str, version: u64) -> StoreResult<()> {
            self.inner.delete_endpoint(id, version).await
        }
        async fn query_endpoints(
            &self,
            filter: &EndpointQuery,
            after: Option<&str>,
            limit: usize,
        ) -> StoreResult<Vec<EndpointRecord>> {
            self.inner.query_endpoints(filter, after, limit).await
        }
        async fn disabled_applications_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> StoreResult<Vec<ApplicationRecord>> {
            self.inner.disabled_applications_before(cutoff).await
        }
        async fn disabled_endpoints_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> StoreResult<Vec<EndpointRecord>> {
            self.inner.disabled_endpoints_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let racing = Arc::new(RacingStore {
            inner: store(),
            conflicts: AtomicU32::new(0),
        });
        let registry = registry_over(racing.clone(), 3);
        let batch = [descriptor("urn:app1", "ep1")];
        registry.reconcile(&batch, "sup", None, t0(), ReconcileMode::Full).await.unwrap();

        racing.conflicts.store(2, Ordering::SeqCst);
        let summary = registry
            .reconcile(&batch, "sup", None, t0() + Duration::hours(1), ReconcileMode::Full)
            .await
            .unwrap();
        assert_eq!(summary.applications.failed, 0);
        assert!(summary.failures.is_empty());

        let registration = registry.get_application(&app_id("urn:app1", "sup")).await.unwrap();
        assert_eq!(registration.application.last_seen, t0() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_one_record_only() {
        let racing = Arc::new(RacingStore {
            inner: store(),
            conflicts: AtomicU32::new(0),
        });
        let registry = registry_over(racing.clone(), 2);
        registry
            .reconcile(&[descriptor("urn:app1", "ep1")], "sup", None, t0(), ReconcileMode::RegisterOnly)
            .await
            .unwrap();

        racing.conflicts.store(u32::MAX, Ordering::SeqCst);
        let batch = [descriptor("urn:app1", "ep1"), descriptor("urn:app2", "ep1")];
        let summary = registry
            .reconcile(&batch, "sup", None, t0() + Duration::hours(1), ReconcileMode::RegisterOnly)
            .await
            .unwrap();

        assert_eq!(summary.applications.failed, 1);
        assert_eq!(summary.applications.added, 1);
        assert_eq!(summary.endpoints.added, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].contains("concurrently"));
    }
}
