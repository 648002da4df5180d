//! SQLite-backed state store.
//!
//! Holds one row per tracked resource (desired spec, last committed observed
//! state, revision) and the append-only reconciliation log. Everything
//! `status` and `list` print comes from here, so it is readable after a
//! restart without asking any external system.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DesiredState;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    DesiredSpec, ObservedState, Outcome, ReconciliationRecord, Resource, ResourceHealth,
    ResourceKey, ResourceKind,
};

pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (or create) `state.db` in `data_dir`.
    pub async fn open(data_dir: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(data_dir.join("state.db"))
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                desired_json TEXT NOT NULL,
                observed_json TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_detail TEXT,
                forced INTEGER NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_resource ON reconciliation_records (kind, resource_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        // Records are append-only.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS records_no_update
            BEFORE UPDATE ON reconciliation_records
            BEGIN
                SELECT RAISE(ABORT, 'reconciliation records are append-only');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS records_no_delete
            BEFORE DELETE ON reconciliation_records
            BEGIN
                SELECT RAISE(ABORT, 'reconciliation records are append-only');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // === Resource operations ===

    /// Track a resource, or replace its desired spec wholesale.
    ///
    /// Observed state and revision are left untouched for existing rows.
    pub async fn register(&self, id: &str, desired: &DesiredSpec) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO resources (kind, id, desired_json, observed_json, revision, updated_at)
            VALUES (?, ?, ?, NULL, 0, ?)
            ON CONFLICT (kind, id) DO UPDATE SET
                desired_json = excluded.desired_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(desired.kind().as_str())
        .bind(id)
        .bind(serde_json::to_string(desired)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Register every valid resource of `state` and untrack the ones it no
    /// longer names. Rejected resources keep whatever was tracked before.
    ///
    /// Returns the untracked keys.
    pub async fn sync(&self, state: &DesiredState) -> StoreResult<Vec<ResourceKey>> {
        for (key, desired) in &state.resources {
            self.register(&key.id, desired).await?;
        }
        let keep: Vec<ResourceKey> = state.keys().cloned().collect();
        self.retain(&keep).await
    }

    /// Stop tracking resources not in `keep`. Their records are kept.
    pub async fn retain(&self, keep: &[ResourceKey]) -> StoreResult<Vec<ResourceKey>> {
        let mut removed = Vec::new();
        for resource in self.list().await? {
            let key = resource.key();
            if keep.contains(&key) {
                continue;
            }
            sqlx::query("DELETE FROM resources WHERE kind = ? AND id = ?")
                .bind(key.kind.as_str())
                .bind(&key.id)
                .execute(&self.pool)
                .await?;
            info!(resource = %key, "No longer tracked");
            removed.push(key);
        }
        Ok(removed)
    }

    pub async fn load(&self, key: &ResourceKey) -> StoreResult<Resource> {
        let row = sqlx::query(
            r#"
            SELECT id, desired_json, observed_json, revision
            FROM resources WHERE kind = ? AND id = ?
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_resource(row),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Keys of every tracked resource with this id, across kinds.
    pub async fn find(&self, id: &str) -> StoreResult<Vec<ResourceKey>> {
        let rows = sqlx::query("SELECT kind, id FROM resources WHERE id = ? ORDER BY kind")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let kind: String = r.get("kind");
                let kind = kind.parse::<ResourceKind>().map_err(StoreError::Corrupt)?;
                Ok(ResourceKey::new(kind, r.get::<String, _>("id")))
            })
            .collect()
    }

    pub async fn list(&self) -> StoreResult<Vec<Resource>> {
        let rows = sqlx::query(
            r#"
            SELECT id, desired_json, observed_json, revision
            FROM resources ORDER BY kind, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_resource).collect()
    }

    pub async fn list_keys(&self, kind: ResourceKind) -> StoreResult<Vec<ResourceKey>> {
        let rows = sqlx::query("SELECT id FROM resources WHERE kind = ? ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| ResourceKey::new(kind, r.get::<String, _>("id")))
            .collect())
    }

    /// Commit observed state if the stored revision is still `expected_revision`.
    ///
    /// Returns the new revision. The desired spec column is not written, so a
    /// concurrent re-registration is never reverted by a commit.
    pub async fn save(&self, resource: &Resource, expected_revision: u64) -> StoreResult<u64> {
        let key = resource.key();
        let observed = resource
            .observed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let next = expected_revision + 1;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE resources SET observed_json = ?, revision = ?, updated_at = ?
            WHERE kind = ? AND id = ? AND revision = ?
            "#,
        )
        .bind(&observed)
        .bind(next as i64)
        .bind(&now)
        .bind(key.kind.as_str())
        .bind(&key.id)
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(resource = %key, revision = next, "Committed");
            return Ok(next);
        }

        let actual = sqlx::query("SELECT revision FROM resources WHERE kind = ? AND id = ?")
            .bind(key.kind.as_str())
            .bind(&key.id)
            .fetch_optional(&self.pool)
            .await?;

        match actual {
            Some(row) => Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                actual: row.get::<i64, _>("revision") as u64,
            }),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    // === Reconciliation log ===

    pub async fn append_record(&self, record: &ReconciliationRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_records
                (record_id, kind, resource_id, started_at, finished_at, outcome, error_detail, forced, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.resource.kind.as_str())
        .bind(&record.resource.id)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.to_rfc3339())
        .bind(record.outcome.as_str())
        .bind(&record.error_detail)
        .bind(record.forced)
        .bind(record.revision as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent records for a resource, newest first.
    pub async fn records(
        &self,
        key: &ResourceKey,
        limit: u32,
    ) -> StoreResult<Vec<ReconciliationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, kind, resource_id, started_at, finished_at, outcome, error_detail, forced, revision
            FROM reconciliation_records
            WHERE kind = ? AND resource_id = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn last_record(&self, key: &ResourceKey) -> StoreResult<Option<ReconciliationRecord>> {
        Ok(self.records(key, 1).await?.into_iter().next())
    }

    /// Failed outcomes since the last non-failed one.
    pub async fn consecutive_failures(&self, key: &ResourceKey) -> StoreResult<u32> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS failures FROM reconciliation_records
            WHERE kind = ?1 AND resource_id = ?2 AND outcome = 'failed'
              AND seq > COALESCE(
                  (SELECT MAX(seq) FROM reconciliation_records
                   WHERE kind = ?1 AND resource_id = ?2 AND outcome != 'failed'),
                  0)
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("failures") as u32)
    }

    pub async fn health(&self, key: &ResourceKey, threshold: u32) -> StoreResult<ResourceHealth> {
        let last = self.last_record(key).await?.map(|r| r.outcome);
        let failures = self.consecutive_failures(key).await?;
        Ok(ResourceHealth::evaluate(last, failures, threshold))
    }
}

fn row_to_resource(row: SqliteRow) -> StoreResult<Resource> {
    let desired: DesiredSpec = serde_json::from_str(row.get("desired_json"))?;
    let observed: Option<ObservedState> = row
        .get::<Option<String>, _>("observed_json")
        .map(|json| serde_json::from_str(&json))
        .transpose()?;

    Ok(Resource {
        id: row.get("id"),
        desired,
        observed,
        last_applied_revision: row.get::<i64, _>("revision") as u64,
    })
}

fn row_to_record(row: SqliteRow) -> StoreResult<ReconciliationRecord> {
    let kind: String = row.get("kind");
    let outcome: String = row.get("outcome");
    let record_id: String = row.get("record_id");

    Ok(ReconciliationRecord {
        id: Uuid::parse_str(&record_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        resource: ResourceKey::new(
            kind.parse().map_err(StoreError::Corrupt)?,
            row.get::<String, _>("resource_id"),
        ),
        started_at: parse_timestamp(row.get("started_at"))?,
        finished_at: parse_timestamp(row.get("finished_at"))?,
        outcome: outcome.parse().map_err(StoreError::Corrupt)?,
        error_detail: row.get("error_detail"),
        forced: row.get("forced"),
        revision: row.get::<i64, _>("revision") as u64,
    })
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}
