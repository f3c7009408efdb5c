use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use shared::types::{
    ApplicationQuery, ApplicationRecord, ApplicationType, EndpointQuery, EndpointRecord,
    SecurityMode,
};
use crate::registry::store::{StoreError, StoreResult};

const APPLICATION_COLUMNS: &str = "application_id, application_uri, supervisor_id, site_id,
    application_name, application_type, product_uri, discovery_urls, capabilities,
    host_addresses, created, last_seen, disabled, version";

const ENDPOINT_COLUMNS: &str = "endpoint_id, application_id, url, security_mode,
    security_policy, credential, server_thumbprint, security_level, last_seen, disabled,
    version";

pub struct RegistryDb {
    conn: Connection,
}

impl RegistryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applications (
                application_id   TEXT PRIMARY KEY,
                application_uri  TEXT NOT NULL,
                supervisor_id    TEXT NOT NULL,
                site_id          TEXT,
                application_name TEXT,
                application_type TEXT NOT NULL,
                product_uri      TEXT,
                discovery_urls   TEXT NOT NULL,
                capabilities     TEXT NOT NULL,
                host_addresses   TEXT NOT NULL,
                created          TEXT NOT NULL,
                last_seen        TEXT NOT NULL,
                disabled         INTEGER NOT NULL DEFAULT 0,
                version          INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_app_supervisor ON applications(supervisor_id);

            CREATE TABLE IF NOT EXISTS endpoints (
                endpoint_id       TEXT PRIMARY KEY,
                application_id    TEXT NOT NULL
                                  REFERENCES applications(application_id) ON DELETE CASCADE,
                url               TEXT NOT NULL,
                security_mode     TEXT NOT NULL,
                security_policy   TEXT,
                credential        TEXT NOT NULL,
                server_thumbprint TEXT,
                security_level    INTEGER,
                last_seen         TEXT NOT NULL,
                disabled          INTEGER NOT NULL DEFAULT 0,
                version           INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_endpoint_application ON endpoints(application_id);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    pub fn get_application(&self, id: &str) -> StoreResult<Option<ApplicationRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM applications WHERE application_id = ?1", APPLICATION_COLUMNS),
                params![id],
                Self::row_to_application,
            )
            .optional()
            .context("Failed to query application")?;
        Ok(record)
    }

    /// Insert a new application at version 1
    pub fn create_application(&self, record: &ApplicationRecord) -> StoreResult<ApplicationRecord> {
        let created = ApplicationRecord {
            version: 1,
            ..record.clone()
        };
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO applications ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(application_id) DO NOTHING",
                    APPLICATION_COLUMNS
                ),
                params![
                    &created.application_id,
                    &created.application_uri,
                    &created.supervisor_id,
                    &created.site_id,
                    &created.application_name,
                    created.application_type.as_str(),
                    &created.product_uri,
                    to_json(&created.discovery_urls)?,
                    to_json(&created.capabilities)?,
                    to_json(&created.host_addresses)?,
                    timestamp(&created.created),
                    timestamp(&created.last_seen),
                    created.disabled as i32,
                    created.version as i64,
                ],
            )
            .context("Failed to insert application")?;

        if inserted == 0 {
            return Err(StoreError::Conflict(created.application_id));
        }
        Ok(created)
    }

    /// Overwrite an application if its stored version still matches
    pub fn update_application(&self, record: &ApplicationRecord) -> StoreResult<ApplicationRecord> {
        let updated = self
            .conn
            .execute(
                "UPDATE applications SET
                    application_uri = ?3, supervisor_id = ?4, site_id = ?5,
                    application_name = ?6, application_type = ?7, product_uri = ?8,
                    discovery_urls = ?9, capabilities = ?10, host_addresses = ?11,
                    created = ?12, last_seen = ?13, disabled = ?14, version = version + 1
                 WHERE application_id = ?1 AND version = ?2",
                params![
                    &record.application_id,
                    record.version as i64,
                    &record.application_uri,
                    &record.supervisor_id,
                    &record.site_id,
                    &record.application_name,
                    record.application_type.as_str(),
                    &record.product_uri,
                    to_json(&record.discovery_urls)?,
                    to_json(&record.capabilities)?,
                    to_json(&record.host_addresses)?,
                    timestamp(&record.created),
                    timestamp(&record.last_seen),
                    record.disabled as i32,
                ],
            )
            .context("Failed to update application")?;

        if updated == 0 {
            return Err(self.miss("applications", "application_id", &record.application_id));
        }
        Ok(ApplicationRecord {
            version: record.version + 1,
            ..record.clone()
        })
    }

    pub fn delete_application(&self, id: &str, version: u64) -> StoreResult<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM applications WHERE application_id = ?1 AND version = ?2",
                params![id, version as i64],
            )
            .context("Failed to delete application")?;

        if deleted == 0 {
            return Err(self.miss("applications", "application_id", id));
        }
        Ok(())
    }

    pub fn query_applications(
        &self,
        filter: &ApplicationQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ApplicationRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut bind = |clause: &str, value: Value| {
            values.push(value);
            clauses.push(clause.replace('?', &format!("?{}", values.len())));
        };

        if let Some(uri) = &filter.application_uri {
            bind("lower(application_uri) = lower(?)", Value::Text(uri.clone()));
        }
        if let Some(name) = &filter.application_name {
            bind("application_name = ?", Value::Text(name.clone()));
        }
        if let Some(application_type) = filter.application_type {
            bind("application_type = ?", Value::Text(application_type.as_str().to_string()));
        }
        if let Some(product_uri) = &filter.product_uri {
            bind("product_uri = ?", Value::Text(product_uri.clone()));
        }
        if let Some(supervisor_id) = &filter.supervisor_id {
            bind("supervisor_id = ?", Value::Text(supervisor_id.clone()));
        }
        if let Some(site_id) = &filter.site_id {
            bind("site_id = ?", Value::Text(site_id.clone()));
        }
        if let Some(capability) = &filter.capability {
            bind(
                "EXISTS (SELECT 1 FROM json_each(applications.capabilities) WHERE json_each.value = ?)",
                Value::Text(capability.clone()),
            );
        }
        if let Some(after) = after {
            bind("application_id > ?", Value::Text(after.to_string()));
        }
        if !filter.include_disabled {
            clauses.push("disabled = 0".to_string());
        }
        values.push(Value::Integer(limit.min(i64::MAX as usize) as i64));

        let sql = format!(
            "SELECT {} FROM applications {} ORDER BY application_id LIMIT ?{}",
            APPLICATION_COLUMNS,
            where_clause(&clauses),
            values.len()
        );
        self.select(&sql, values, Self::row_to_application)
    }

    pub fn get_endpoint(&self, id: &str) -> StoreResult<Option<EndpointRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM endpoints WHERE endpoint_id = ?1", ENDPOINT_COLUMNS),
                params![id],
                Self::row_to_endpoint,
            )
            .optional()
            .context("Failed to query endpoint")?;
        Ok(record)
    }

    /// Insert a new endpoint at version 1. The owning application must exist.
    pub fn create_endpoint(&self, record: &EndpointRecord) -> StoreResult<EndpointRecord> {
        if self.get_application(&record.application_id)?.is_none() {
            return Err(StoreError::NotFound(record.application_id.clone()));
        }

        let created = EndpointRecord {
            version: 1,
            ..record.clone()
        };
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO endpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(endpoint_id) DO NOTHING",
                    ENDPOINT_COLUMNS
                ),
                params![
                    &created.endpoint_id,
                    &created.application_id,
                    &created.url,
                    created.security_mode.as_str(),
                    &created.security_policy,
                    to_json(&created.credential)?,
                    &created.server_thumbprint,
                    created.security_level,
                    timestamp(&created.last_seen),
                    created.disabled as i32,
                    created.version as i64,
                ],
            )
            .context("Failed to insert endpoint")?;

        if inserted == 0 {
            return Err(StoreError::Conflict(created.endpoint_id));
        }
        Ok(created)
    }

    pub fn update_endpoint(&self, record: &EndpointRecord) -> StoreResult<EndpointRecord> {
        let updated = self
            .conn
            .execute(
                "UPDATE endpoints SET
                    application_id = ?3, url = ?4, security_mode = ?5, security_policy = ?6,
                    credential = ?7, server_thumbprint = ?8, security_level = ?9,
                    last_seen = ?10, disabled = ?11, version = version + 1
                 WHERE endpoint_id = ?1 AND version = ?2",
                params![
                    &record.endpoint_id,
                    record.version as i64,
                    &record.application_id,
                    &record.url,
                    record.security_mode.as_str(),
                    &record.security_policy,
                    to_json(&record.credential)?,
                    &record.server_thumbprint,
                    record.security_level,
                    timestamp(&record.last_seen),
                    record.disabled as i32,
                ],
            )
            .context("Failed to update endpoint")?;

        if updated == 0 {
            return Err(self.miss("endpoints", "endpoint_id", &record.endpoint_id));
        }
        Ok(EndpointRecord {
            version: record.version + 1,
            ..record.clone()
        })
    }

    pub fn delete_endpoint(&self, id: &str, version: u64) -> StoreResult<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM endpoints WHERE endpoint_id = ?1 AND version = ?2",
                params![id, version as i64],
            )
            .context("Failed to delete endpoint")?;

        if deleted == 0 {
            return Err(self.miss("endpoints", "endpoint_id", id));
        }
        Ok(())
    }

    pub fn query_endpoints(
        &self,
        filter: &EndpointQuery,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EndpointRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut bind = |clause: &str, value: Value| {
            values.push(value);
            clauses.push(clause.replace('?', &format!("?{}", values.len())));
        };

        if let Some(application_id) = &filter.application_id {
            bind("application_id = ?", Value::Text(application_id.clone()));
        }
        if let Some(url) = &filter.url {
            bind("url = ?", Value::Text(url.clone()));
        }
        if let Some(mode) = filter.security_mode {
            bind("security_mode = ?", Value::Text(mode.as_str().to_string()));
        }
        if let Some(policy) = &filter.security_policy {
            bind("security_policy = ?", Value::Text(policy.clone()));
        }
        if let Some(after) = after {
            bind("endpoint_id > ?", Value::Text(after.to_string()));
        }
        if !filter.include_disabled {
            clauses.push("disabled = 0".to_string());
        }
        values.push(Value::Integer(limit.min(i64::MAX as usize) as i64));

        let sql = format!(
            "SELECT {} FROM endpoints {} ORDER BY endpoint_id LIMIT ?{}",
            ENDPOINT_COLUMNS,
            where_clause(&clauses),
            values.len()
        );
        self.select(&sql, values, Self::row_to_endpoint)
    }

    pub fn disabled_applications_before(
        &self,
        cutoff: &DateTime<Utc>,
    ) -> StoreResult<Vec<ApplicationRecord>> {
        let sql = format!(
            "SELECT {} FROM applications WHERE disabled = 1 AND last_seen < ?1 ORDER BY application_id",
            APPLICATION_COLUMNS
        );
        self.select(&sql, vec![Value::Text(timestamp(cutoff))], Self::row_to_application)
    }

    pub fn disabled_endpoints_before(
        &self,
        cutoff: &DateTime<Utc>,
    ) -> StoreResult<Vec<EndpointRecord>> {
        let sql = format!(
            "SELECT {} FROM endpoints WHERE disabled = 1 AND last_seen < ?1 ORDER BY endpoint_id",
            ENDPOINT_COLUMNS
        );
        self.select(&sql, vec![Value::Text(timestamp(cutoff))], Self::row_to_endpoint)
    }

    /// Every application, disabled ones included
    pub fn all_applications(&self) -> StoreResult<Vec<ApplicationRecord>> {
        let sql = format!("SELECT {} FROM applications", APPLICATION_COLUMNS);
        self.select(&sql, Vec::new(), Self::row_to_application)
    }

    /// Every endpoint, disabled ones included
    pub fn all_endpoints(&self) -> StoreResult<Vec<EndpointRecord>> {
        let sql = format!("SELECT {} FROM endpoints", ENDPOINT_COLUMNS);
        self.select(&sql, Vec::new(), Self::row_to_endpoint)
    }

    fn select<T>(
        &self,
        sql: &str,
        values: Vec<Value>,
        map: fn(&rusqlite::Row) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), map)
            .context("Failed to run query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect rows")?;
        Ok(rows)
    }

    /// Classify a write that matched no row
    fn miss(&self, table: &str, key: &str, id: &str) -> StoreError {
        let exists = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE {} = ?1", table, key),
                params![id],
                |_| Ok(()),
            )
            .optional();
        match exists {
            Ok(Some(())) => StoreError::Conflict(id.to_string()),
            Ok(None) => StoreError::NotFound(id.to_string()),
            Err(e) => StoreError::Backend(anyhow::Error::new(e).context("Failed to check record")),
        }
    }

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<ApplicationRecord> {
        let application_type: String = row.get(5)?;
        let application_type = ApplicationType::parse(&application_type)
            .ok_or_else(|| conversion_error(5, format!("unknown application type {}", application_type)))?;

        Ok(ApplicationRecord {
            application_id: row.get(0)?,
            application_uri: row.get(1)?,
            supervisor_id: row.get(2)?,
            site_id: row.get(3)?,
            application_name: row.get(4)?,
            application_type,
            product_uri: row.get(6)?,
            discovery_urls: from_json(row, 7)?,
            capabilities: from_json(row, 8)?,
            host_addresses: from_json(row, 9)?,
            created: parse_timestamp(row, 10)?,
            last_seen: parse_timestamp(row, 11)?,
            disabled: row.get::<_, i32>(12)? != 0,
            version: row.get::<_, i64>(13)? as u64,
        })
    }

    fn row_to_endpoint(row: &rusqlite::Row) -> rusqlite::Result<EndpointRecord> {
        let security_mode: String = row.get(3)?;
        let security_mode = SecurityMode::parse(&security_mode)
            .ok_or_else(|| conversion_error(3, format!("unknown security mode {}", security_mode)))?;

        Ok(EndpointRecord {
            endpoint_id: row.get(0)?,
            application_id: row.get(1)?,
            url: row.get(2)?,
            security_mode,
            security_policy: row.get(4)?,
            credential: from_json(row, 5)?,
            server_thumbprint: row.get(6)?,
            security_level: row.get(7)?,
            last_seen: parse_timestamp(row, 8)?,
            disabled: row.get::<_, i32>(9)? != 0,
            version: row.get::<_, i64>(10)? as u64,
        })
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// Fixed width UTC text so stored timestamps sort chronologically
fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column")
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn from_json<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let json: String = row.get(idx)?;
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use shared::types::Credential;

    fn application(id: &str, supervisor: &str) -> ApplicationRecord {
        let now = Utc::now();
        ApplicationRecord {
            application_id: id.to_string(),
            application_uri: format!("urn:{}", id),
            supervisor_id: supervisor.to_string(),
            site_id: Some("plant-1".to_string()),
            application_name: Some("Press line".to_string()),
            application_type: ApplicationType::Server,
            product_uri: None,
            discovery_urls: BTreeSet::from(["opc.tcp://10.0.0.7:4840".to_string()]),
            capabilities: BTreeSet::from(["DA".to_string()]),
            host_addresses: BTreeSet::new(),
            created: now,
            last_seen: now,
            disabled: false,
            version: 0,
        }
    }

    fn endpoint(id: &str, application_id: &str) -> EndpointRecord {
        EndpointRecord {
            endpoint_id: id.to_string(),
            application_id: application_id.to_string(),
            url: "opc.tcp://10.0.0.7:4840".to_string(),
            security_mode: SecurityMode::SignAndEncrypt,
            security_policy: Some("Basic256Sha256".to_string()),
            credential: Credential::UserName {
                user: "op".to_string(),
                password: "pw".to_string(),
            },
            server_thumbprint: None,
            security_level: Some(3),
            last_seen: Utc::now(),
            disabled: false,
            version: 0,
        }
    }

    #[test]
    fn test_create_and_get() {
        let db = RegistryDb::open(":memory:").unwrap();

        let created = db.create_application(&application("app1", "sup")).unwrap();
        assert_eq!(created.version, 1);

        let stored = db.get_application("app1").unwrap().unwrap();
        assert_eq!(stored, created);

        db.create_endpoint(&endpoint("ep1", "app1")).unwrap();
        let stored = db.get_endpoint("ep1").unwrap().unwrap();
        assert_eq!(stored.security_mode, SecurityMode::SignAndEncrypt);
        assert_eq!(stored.credential.credential_type().as_str(), "user_name");
    }

    #[test]
    fn test_duplicate_create_conflicts() {
        let db = RegistryDb::open(":memory:").unwrap();
        db.create_application(&application("app1", "sup")).unwrap();

        let result = db.create_application(&application("app1", "sup"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_endpoint_requires_application() {
        let db = RegistryDb::open(":memory:").unwrap();
        let result = db.create_endpoint(&endpoint("ep1", "missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_stale_version_update_conflicts() {
        let db = RegistryDb::open(":memory:").unwrap();
        let v1 = db.create_application(&application("app1", "sup")).unwrap();

        let mut first = v1.clone();
        first.application_name = Some("first".to_string());
        let v2 = db.update_application(&first).unwrap();
        assert_eq!(v2.version, 2);

        let mut second = v1;
        second.application_name = Some("second".to_string());
        assert!(matches!(
            db.update_application(&second),
            Err(StoreError::Conflict(_))
        ));

        let stored = db.get_application("app1").unwrap().unwrap();
        assert_eq!(stored.application_name.as_deref(), Some("first"));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let db = RegistryDb::open(":memory:").unwrap();
        let result = db.update_application(&application("ghost", "sup"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_application_cascades() {
        let db = RegistryDb::open(":memory:").unwrap();
        let app = db.create_application(&application("app1", "sup")).unwrap();
        db.create_endpoint(&endpoint("ep1", "app1")).unwrap();
        db.create_endpoint(&endpoint("ep2", "app1")).unwrap();

        assert!(matches!(
            db.delete_application("app1", app.version + 1),
            Err(StoreError::Conflict(_))
        ));
        db.delete_application("app1", app.version).unwrap();

        assert!(db.get_application("app1").unwrap().is_none());
        assert!(db.all_endpoints().unwrap().is_empty());
    }

    #[test]
    fn test_query_filters_and_keyset() {
        let db = RegistryDb::open(":memory:").unwrap();
        for id in ["a", "b", "c", "d"] {
            db.create_application(&application(id, "sup-1")).unwrap();
        }
        let mut other = application("e", "sup-2");
        other.capabilities = BTreeSet::from(["HD".to_string()]);
        db.create_application(&other).unwrap();

        let mut disabled = db.get_application("d").unwrap().unwrap();
        disabled.disabled = true;
        db.update_application(&disabled).unwrap();

        let filter = ApplicationQuery {
            supervisor_id: Some("sup-1".to_string()),
            ..Default::default()
        };
        let page = db.query_applications(&filter, None, 2).unwrap();
        let ids: Vec<_> = page.iter().map(|a| a.application_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let page = db.query_applications(&filter, Some("b"), 2).unwrap();
        let ids: Vec<_> = page.iter().map(|a| a.application_id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);

        let with_disabled = ApplicationQuery {
            include_disabled: true,
            ..filter
        };
        assert_eq!(db.query_applications(&with_disabled, None, 10).unwrap().len(), 4);

        let by_capability = ApplicationQuery {
            capability: Some("HD".to_string()),
            ..Default::default()
        };
        let found = db.query_applications(&by_capability, None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].application_id, "e");

        let by_uri = ApplicationQuery {
            application_uri: Some("URN:A".to_string()),
            ..Default::default()
        };
        assert_eq!(db.query_applications(&by_uri, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_before_cutoff() {
        let db = RegistryDb::open(":memory:").unwrap();
        let mut old = application("old", "sup");
        old.last_seen = Utc::now() - chrono::Duration::days(10);
        old.disabled = true;
        db.create_application(&old).unwrap();

        let mut recent = application("recent", "sup");
        recent.disabled = true;
        db.create_application(&recent).unwrap();

        db.create_application(&application("alive", "sup")).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(1);
        let stale = db.disabled_applications_before(&cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].application_id, "old");
    }
}
