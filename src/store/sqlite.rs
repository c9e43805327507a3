//! SQLite-backed store.
//!
//! `(owner_id, subject_owner, subject_name, git_ref, feature, version)` is
//! UNIQUE, and inserts use `ON CONFLICT DO NOTHING RETURNING` so a lost race
//! comes back as zero rows rather than a constraint error. All statements run
//! on the blocking pool.

use super::{InsertOutcome, RecordStore, UsageSink};
use crate::error::StoreError;
use crate::model::{
    AnalysisRecord, GroupKey, NewRecord, UsageEvent, UsageTotals, Version, VersionSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS analysis_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        subject_owner TEXT NOT NULL,
        subject_name TEXT NOT NULL,
        git_ref TEXT NOT NULL,
        feature TEXT NOT NULL,
        version INTEGER NOT NULL CHECK (version > 0),
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (owner_id, subject_owner, subject_name, git_ref, feature, version)
    );

    CREATE TABLE IF NOT EXISTS usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        feature TEXT NOT NULL,
        version INTEGER NOT NULL,
        input_units INTEGER NOT NULL,
        output_units INTEGER NOT NULL,
        total_units INTEGER NOT NULL,
        credentials TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_usage_subject ON usage_events(subject_id);
"#;

const GROUP_FILTER: &str = "owner_id = ?1 AND subject_owner = ?2 AND subject_name = ?3 \
     AND git_ref = ?4 AND feature = ?5";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Worker("connection mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await?
    }
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_payload(idx: usize, raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn max_version(&self, group: &GroupKey) -> Result<Version, StoreError> {
        let group = group.clone();
        self.with_conn(move |conn| {
            let max: Option<Version> = conn.query_row(
                &format!("SELECT MAX(version) FROM analysis_records WHERE {}", GROUP_FILTER),
                params![
                    group.owner_id,
                    group.subject.owner,
                    group.subject.name,
                    group.subject.git_ref,
                    group.feature
                ],
                |row| row.get(0),
            )?;
            Ok(max.unwrap_or(0))
        })
        .await
    }

    async fn insert_version(&self, record: NewRecord) -> Result<InsertOutcome, StoreError> {
        self.with_conn(move |conn| {
            let payload = serde_json::to_string(&record.payload)?;
            let id: Option<i64> = conn
                .query_row(
                    r#"
                    INSERT INTO analysis_records
                        (owner_id, subject_owner, subject_name, git_ref, feature, version, payload, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT DO NOTHING
                    RETURNING id
                    "#,
                    params![
                        record.group.owner_id,
                        record.group.subject.owner,
                        record.group.subject.name,
                        record.group.subject.git_ref,
                        record.group.feature,
                        record.version,
                        payload,
                        record.created_at.to_rfc3339(),
                    ],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(match id {
                Some(id) => InsertOutcome::Committed(AnalysisRecord {
                    id,
                    group: record.group,
                    version: record.version,
                    payload: record.payload,
                    created_at: record.created_at,
                }),
                None => InsertOutcome::Conflict,
            })
        })
        .await
    }

    async fn list_versions(&self, group: &GroupKey) -> Result<Vec<VersionSummary>, StoreError> {
        let group = group.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT version, created_at FROM analysis_records WHERE {} ORDER BY version DESC",
                GROUP_FILTER
            ))?;
            let rows = stmt.query_map(
                params![
                    group.owner_id,
                    group.subject.owner,
                    group.subject.name,
                    group.subject.git_ref,
                    group.feature
                ],
                |row| {
                    Ok(VersionSummary {
                        version: row.get(0)?,
                        created_at: parse_timestamp(1, row.get(1)?)?,
                    })
                },
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_version(
        &self,
        group: &GroupKey,
        version: Option<Version>,
    ) -> Result<Option<AnalysisRecord>, StoreError> {
        let group = group.clone();
        self.with_conn(move |conn| {
            let sql = match version {
                Some(_) => format!(
                    "SELECT id, version, payload, created_at FROM analysis_records \
                     WHERE {} AND version = ?6",
                    GROUP_FILTER
                ),
                None => format!(
                    "SELECT id, version, payload, created_at FROM analysis_records \
                     WHERE {} ORDER BY version DESC LIMIT 1",
                    GROUP_FILTER
                ),
            };
            let map_row = |row: &rusqlite::Row<'_>| {
                Ok(AnalysisRecord {
                    id: row.get(0)?,
                    group: group.clone(),
                    version: row.get(1)?,
                    payload: parse_payload(2, row.get(2)?)?,
                    created_at: parse_timestamp(3, row.get(3)?)?,
                })
            };
            let record = match version {
                Some(v) => conn
                    .query_row(
                        &sql,
                        params![
                            group.owner_id,
                            group.subject.owner,
                            group.subject.name,
                            group.subject.git_ref,
                            group.feature,
                            v
                        ],
                        map_row,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        &sql,
                        params![
                            group.owner_id,
                            group.subject.owner,
                            group.subject.name,
                            group.subject.git_ref,
                            group.feature
                        ],
                        map_row,
                    )
                    .optional()?,
            };
            Ok(record)
        })
        .await
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn record_usage(&self, event: &UsageEvent) -> Result<(), StoreError> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO usage_events
                    (owner_id, subject_id, feature, version, input_units, output_units,
                     total_units, credentials, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    event.owner_id,
                    event.subject_id,
                    event.feature,
                    event.version,
                    event.usage.input_units as i64,
                    event.usage.output_units as i64,
                    event.usage.total_units as i64,
                    event.credentials.as_str(),
                    event.recorded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn usage_totals(&self, subject_id: &str) -> Result<UsageTotals, StoreError> {
        let subject_id = subject_id.to_string();
        self.with_conn(move |conn| {
            let totals = conn.query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(input_units), 0),
                       COALESCE(SUM(output_units), 0),
                       COALESCE(SUM(total_units), 0)
                FROM usage_events WHERE subject_id = ?1
                "#,
                params![subject_id],
                |row| {
                    Ok(UsageTotals {
                        runs: row.get::<_, i64>(0)? as u64,
                        input_units: row.get::<_, i64>(1)? as u64,
                        output_units: row.get::<_, i64>(2)? as u64,
                        total_units: row.get::<_, i64>(3)? as u64,
                    })
                },
            )?;
            Ok(totals)
        })
        .await
    }
}
