//! Evolution ledger.
//!
//! The ledger is the audit trail of applied evolutions. Every record keeps
//! the project signature as it was right after the evolution, so the next
//! run knows which signature to replay from.
//!
//! [`SqliteLedger`] stores two tables: `oxide_evolution_versions` holds one
//! signature snapshot per change and `oxide_evolutions` holds one row per
//! applied `(app, label)`, pointing at the snapshot it produced.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

use crate::error::{EvolutionError, Result};
use crate::evolution::Evolution;
use crate::mutations::MutationSpec;
use crate::signature::ProjectSignature;

/// SQL to create the signature snapshot table (SQLite).
pub const CREATE_VERSIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_evolution_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    signature TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the applied evolutions table (SQLite).
pub const CREATE_EVOLUTIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS oxide_evolutions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id INTEGER NOT NULL REFERENCES oxide_evolution_versions (id),
    app TEXT NOT NULL,
    label TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    UNIQUE(app, label)
)
"#;

/// An applied evolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvolutionRecord {
    /// Position in the ledger; increases with application time.
    pub id: i64,
    /// Application name.
    pub app: String,
    /// Evolution label.
    pub label: String,
    /// Project signature right after the evolution.
    pub signature: ProjectSignature,
    /// When the evolution was applied.
    pub applied_at: DateTime<Utc>,
}

/// Permission to purge the history of one application.
///
/// Only obtainable from mutations that delete that application, so history
/// is never removed without the schema it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeAuthorization {
    app: String,
}

impl PurgeAuthorization {
    /// Authorizes purging `app` if `mutations` contain its `DeleteApplication`.
    pub fn from_mutations(app: &str, mutations: &[MutationSpec]) -> Result<Self> {
        let deletes = mutations
            .iter()
            .any(|m| matches!(m, MutationSpec::DeleteApplication { app: a } if a == app));
        if deletes {
            Ok(Self {
                app: app.to_string(),
            })
        } else {
            Err(EvolutionError::PurgeNotPermitted(app.to_string()))
        }
    }

    /// Authorizes purging `app` if `evolution` deletes it.
    pub fn from_evolution(app: &str, evolution: &Evolution) -> Result<Self> {
        Self::from_mutations(app, &evolution.mutations)
    }

    /// Returns the application whose history may be purged.
    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }
}

/// Storage for applied evolutions.
#[allow(async_fn_in_trait)]
pub trait Ledger {
    /// Creates the ledger storage if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Returns the signature recorded by the last evolution of `app`.
    async fn last_signature(&self, app: &str) -> Result<Option<ProjectSignature>>;

    /// Returns the most recently stored project signature.
    async fn latest_signature(&self) -> Result<Option<ProjectSignature>>;

    /// Returns true if `label` has been applied to `app`.
    async fn is_applied(&self, app: &str, label: &str) -> Result<bool>;

    /// Records an applied evolution.
    ///
    /// Returns false, writing nothing, when the pair is already recorded.
    async fn record(&self, app: &str, label: &str, signature: &ProjectSignature) -> Result<bool>;

    /// Returns the records of `app` (all applications when `None`), oldest
    /// first.
    async fn records(&self, app: Option<&str>) -> Result<Vec<EvolutionRecord>>;

    /// Removes the history of an application and stores `signature` as the
    /// latest snapshot. Returns the number of records removed.
    async fn purge(&self, authorization: &PurgeAuthorization, signature: &ProjectSignature) -> Result<u64>;
}

/// Ledger stored in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

type RecordRow = (i64, String, String, String, String);

const SELECT_RECORDS_SQL: &str = "SELECT e.id, e.app, e.label, v.signature, e.applied_at \
     FROM oxide_evolutions e JOIN oxide_evolution_versions v ON v.id = e.version_id";

impl SqliteLedger {
    /// Creates a ledger on `pool`.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn to_record(row: RecordRow) -> Result<EvolutionRecord> {
        let (id, app, label, signature, applied_at) = row;
        Ok(EvolutionRecord {
            id,
            app,
            label,
            signature: ProjectSignature::from_json(&signature)?,
            applied_at: parse_timestamp(&applied_at),
        })
    }
}

impl Ledger for SqliteLedger {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_VERSIONS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_EVOLUTIONS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_signature(&self, app: &str) -> Result<Option<ProjectSignature>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT v.signature FROM oxide_evolutions e \
             JOIN oxide_evolution_versions v ON v.id = e.version_id \
             WHERE e.app = ? ORDER BY e.id DESC LIMIT 1",
        )
        .bind(app)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(json,)| ProjectSignature::from_json(&json))
            .transpose()
    }

    async fn latest_signature(&self) -> Result<Option<ProjectSignature>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT signature FROM oxide_evolution_versions ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| ProjectSignature::from_json(&json))
            .transpose()
    }

    async fn is_applied(&self, app: &str, label: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM oxide_evolutions WHERE app = ? AND label = ?")
                .bind(app)
                .bind(label)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    async fn record(&self, app: &str, label: &str, signature: &ProjectSignature) -> Result<bool> {
        let json = signature.to_json()?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM oxide_evolutions WHERE app = ? AND label = ?")
                .bind(app)
                .bind(label)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            debug!(app = %app, label = %label, "Evolution already recorded");
            return Ok(false);
        }

        let version = sqlx::query("INSERT INTO oxide_evolution_versions (signature, created_at) VALUES (?, ?)")
            .bind(&json)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO oxide_evolutions (version_id, app, label, applied_at) VALUES (?, ?, ?, ?)",
        )
        .bind(version.last_insert_rowid())
        .bind(app)
        .bind(label)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(app = %app, label = %label, "Recorded evolution");
        Ok(true)
    }

    async fn records(&self, app: Option<&str>) -> Result<Vec<EvolutionRecord>> {
        let rows: Vec<RecordRow> = match app {
            Some(app) => {
                sqlx::query_as(&format!("{SELECT_RECORDS_SQL} WHERE e.app = ? ORDER BY e.id"))
                    .bind(app)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as(&format!("{SELECT_RECORDS_SQL} ORDER BY e.id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(Self::to_record).collect()
    }

    async fn purge(&self, authorization: &PurgeAuthorization, signature: &ProjectSignature) -> Result<u64> {
        let json = signature.to_json()?;
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM oxide_evolutions WHERE app = ?")
            .bind(authorization.app())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("INSERT INTO oxide_evolution_versions (signature, created_at) VALUES (?, ?)")
            .bind(&json)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(app = %authorization.app(), removed, "Purged evolution history");
        Ok(removed)
    }
}

/// Parses a stored timestamp, accepting RFC 3339 and SQLite's `datetime()`
/// format.
fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_default()
        })
}

#[derive(Debug, Default)]
struct MemoryState {
    versions: Vec<ProjectSignature>,
    records: Vec<EvolutionRecord>,
    next_id: i64,
}

/// Ledger kept in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl Ledger for MemoryLedger {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn last_signature(&self, app: &str) -> Result<Option<ProjectSignature>> {
        Ok(self.with_state(|s| {
            s.records
                .iter()
                .rev()
                .find(|r| r.app == app)
                .map(|r| r.signature.clone())
        }))
    }

    async fn latest_signature(&self) -> Result<Option<ProjectSignature>> {
        Ok(self.with_state(|s| s.versions.last().cloned()))
    }

    async fn is_applied(&self, app: &str, label: &str) -> Result<bool> {
        Ok(self.with_state(|s| s.records.iter().any(|r| r.app == app && r.label == label)))
    }

    async fn record(&self, app: &str, label: &str, signature: &ProjectSignature) -> Result<bool> {
        Ok(self.with_state(|s| {
            if s.records.iter().any(|r| r.app == app && r.label == label) {
                return false;
            }
            s.next_id += 1;
            s.versions.push(signature.clone());
            s.records.push(EvolutionRecord {
                id: s.next_id,
                app: app.to_string(),
                label: label.to_string(),
                signature: signature.clone(),
                applied_at: Utc::now(),
            });
            true
        }))
    }

    async fn records(&self, app: Option<&str>) -> Result<Vec<EvolutionRecord>> {
        Ok(self.with_state(|s| {
            s.records
                .iter()
                .filter(|r| app.map_or(true, |a| r.app == a))
                .cloned()
                .collect()
        }))
    }

    async fn purge(&self, authorization: &PurgeAuthorization, signature: &ProjectSignature) -> Result<u64> {
        Ok(self.with_state(|s| {
            let before = s.records.len();
            s.records.retain(|r| r.app != authorization.app());
            s.versions.push(signature.clone());
            (before - s.records.len()) as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{ApplicationSignature, FieldSignature, FieldType, ModelSignature};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    async fn sqlite_ledger() -> SqliteLedger {
        let ledger = SqliteLedger::new(create_test_pool().await);
        ledger.ensure_schema().await.unwrap();
        ledger
    }

    fn signature(apps: &[&str]) -> ProjectSignature {
        apps.iter().fold(ProjectSignature::new(), |sig, app| {
            sig.app(
                ApplicationSignature::new(*app).model(
                    ModelSignature::new("Item")
                        .field(FieldSignature::new("id", FieldType::Auto).primary_key()),
                ),
            )
        })
    }

    async fn exercise_record_once(ledger: &impl Ledger) {
        assert!(!ledger.is_applied("blog", "0001_initial").await.unwrap());
        assert!(ledger.last_signature("blog").await.unwrap().is_none());

        let sig = signature(&["blog"]);
        assert!(ledger.record("blog", "0001_initial", &sig).await.unwrap());
        assert!(!ledger.record("blog", "0001_initial", &signature(&[])).await.unwrap());

        assert!(ledger.is_applied("blog", "0001_initial").await.unwrap());
        assert_eq!(ledger.last_signature("blog").await.unwrap(), Some(sig.clone()));
        assert_eq!(ledger.latest_signature().await.unwrap(), Some(sig));
        assert_eq!(ledger.records(None).await.unwrap().len(), 1);
    }

    async fn exercise_ordering_and_purge(ledger: &impl Ledger) {
        ledger.record("blog", "0001_initial", &signature(&["blog"])).await.unwrap();
        ledger.record("shop", "0001_initial", &signature(&["blog", "shop"])).await.unwrap();
        ledger.record("blog", "0002_more", &signature(&["blog", "shop"])).await.unwrap();

        let labels: Vec<String> = ledger
            .records(Some("blog"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.label)
            .collect();
        assert_eq!(labels, vec!["0001_initial", "0002_more"]);

        let all = ledger.records(None).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let auth = PurgeAuthorization::from_mutations("blog", &[MutationSpec::delete_application("blog")]).unwrap();
        let remaining = signature(&["shop"]);
        assert_eq!(ledger.purge(&auth, &remaining).await.unwrap(), 2);
        assert!(ledger.records(Some("blog")).await.unwrap().is_empty());
        assert_eq!(ledger.records(Some("shop")).await.unwrap().len(), 1);
        assert_eq!(ledger.latest_signature().await.unwrap(), Some(remaining));
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let ledger = sqlite_ledger().await;
        ledger.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_record_once() {
        exercise_record_once(&sqlite_ledger().await).await;
    }

    #[tokio::test]
    async fn test_memory_record_once() {
        exercise_record_once(&MemoryLedger::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_ordering_and_purge() {
        exercise_ordering_and_purge(&sqlite_ledger().await).await;
    }

    #[tokio::test]
    async fn test_memory_ordering_and_purge() {
        exercise_ordering_and_purge(&MemoryLedger::new()).await;
    }

    #[test]
    fn test_purge_requires_delete_application() {
        let err = PurgeAuthorization::from_mutations("blog", &[MutationSpec::delete_model("blog", "Post")])
            .unwrap_err();
        assert!(matches!(err, EvolutionError::PurgeNotPermitted(app) if app == "blog"));

        let evolution = Evolution::new("0003_remove").mutation(MutationSpec::delete_application("shop"));
        assert!(PurgeAuthorization::from_evolution("blog", &evolution).is_err());
        assert_eq!(PurgeAuthorization::from_evolution("shop", &evolution).unwrap().app(), "shop");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2024-05-01T10:00:00+00:00");
        let sqlite = parse_timestamp("2024-05-01 10:00:00");
        assert_eq!(rfc, sqlite);
    }
}
