//! SQLite-backed [`SnapshotStore`].
//!
//! One `snapshots` table, indexed by `(project_id, snapshot_type)` and
//! `(project_id, source_path)`. Every statement carries a `project_id`
//! predicate except the aggregates behind [`SnapshotStore::system_metrics`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{ensure_scoped, sort_records, zero_counts, ProjectManifest, SnapshotStore, SystemMetrics};
use crate::config::Config;
use crate::db;
use crate::error::{Result, SnapError};
use crate::migrate;
use crate::models::{Fields, ProjectId, SnapshotFilter, SnapshotRecord, SnapshotType};

pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_all(
        tx: &mut Transaction<'_, Sqlite>,
        records: &[SnapshotRecord],
    ) -> Result<u64> {
        let mut inserted = 0;
        for r in records {
            let fields_json = serde_json::to_string(&r.fields)?;
            sqlx::query(
                r#"
                INSERT INTO snapshots (id, project_id, snapshot_type, source_path, fields_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.id)
            .bind(r.project_id.as_str())
            .bind(r.snapshot_type.as_str())
            .bind(&r.source_path)
            .bind(fields_json)
            .bind(r.created_at.timestamp_millis())
            .execute(&mut **tx)
            .await?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SnapError::Persistence(format!("stored timestamp out of range: {}", ms)))
}

fn parse_type(raw: &str) -> Result<SnapshotType> {
    raw.parse()
        .map_err(|_| SnapError::Persistence(format!("unknown stored snapshot type '{}'", raw)))
}

fn decode(row: &SqliteRow) -> Result<SnapshotRecord> {
    let project: String = row.try_get("project_id")?;
    let snapshot_type: String = row.try_get("snapshot_type")?;
    let fields_json: String = row.try_get("fields_json")?;
    let fields: Fields = serde_json::from_str(&fields_json)?;
    Ok(SnapshotRecord {
        id: row.try_get("id")?,
        project_id: ProjectId::parse(&project)
            .map_err(|e| SnapError::Persistence(format!("stored project id: {}", e)))?,
        snapshot_type: parse_type(&snapshot_type)?,
        source_path: row.try_get("source_path")?,
        fields,
        created_at: millis_to_utc(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save_many(&self, project: &ProjectId, records: &[SnapshotRecord]) -> Result<u64> {
        ensure_scoped(project, records)?;
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_all(&mut tx, records).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn replace_project(
        &self,
        project: &ProjectId,
        records: &[SnapshotRecord],
    ) -> Result<(u64, u64)> {
        ensure_scoped(project, records)?;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM snapshots WHERE project_id = ?")
            .bind(project.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = Self::insert_all(&mut tx, records).await?;
        tx.commit().await?;
        Ok((removed, inserted))
    }

    async fn query(
        &self,
        project: &ProjectId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<SnapshotRecord>> {
        let snapshot_type = filter.snapshot_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, snapshot_type, source_path, fields_json, created_at
            FROM snapshots
            WHERE project_id = ?
              AND (? IS NULL OR snapshot_type = ?)
              AND (? IS NULL OR source_path = ?)
            "#,
        )
        .bind(project.as_str())
        .bind(snapshot_type)
        .bind(snapshot_type)
        .bind(filter.source_path.as_deref())
        .bind(filter.source_path.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows.iter().map(decode).collect::<Result<Vec<_>>>()?;
        if let Some(stray) = records.iter().find(|r| &r.project_id != project) {
            return Err(SnapError::IsolationViolation(format!(
                "query for '{}' returned record {} of '{}'",
                project, stray.id, stray.project_id
            )));
        }
        sort_records(&mut records);
        Ok(records)
    }

    async fn manifest(&self, project: &ProjectId) -> Result<ProjectManifest> {
        let mut manifest = ProjectManifest::empty(project);

        let rows = sqlx::query(
            "SELECT snapshot_type, COUNT(*) AS n FROM snapshots WHERE project_id = ? GROUP BY snapshot_type",
        )
        .bind(project.as_str())
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let t = parse_type(&row.try_get::<String, _>("snapshot_type")?)?;
            let n: i64 = row.try_get("n")?;
            manifest.counts_by_type.insert(t, n as u64);
            manifest.total_snapshots += n as u64;
        }

        let file_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT source_path) FROM snapshots WHERE project_id = ? AND snapshot_type != ?",
        )
        .bind(project.as_str())
        .bind(SnapshotType::RepoMetadata.as_str())
        .fetch_one(&self.pool)
        .await?;
        manifest.file_count = file_count as u64;

        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at) FROM snapshots WHERE project_id = ?")
                .bind(project.as_str())
                .fetch_one(&self.pool)
                .await?;
        manifest.last_processed_at = last.map(millis_to_utc).transpose()?;

        Ok(manifest)
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM snapshots WHERE project_id = ?")
            .bind(project.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    async fn system_metrics(&self) -> Result<SystemMetrics> {
        let totals = sqlx::query(
            "SELECT COUNT(DISTINCT project_id) AS projects, COUNT(*) AS total, MAX(created_at) AS last FROM snapshots",
        )
        .fetch_one(&self.pool)
        .await?;
        let last: Option<i64> = totals.try_get("last")?;

        let mut counts_by_type = zero_counts();
        let rows =
            sqlx::query("SELECT snapshot_type, COUNT(*) AS n FROM snapshots GROUP BY snapshot_type")
                .fetch_all(&self.pool)
                .await?;
        for row in &rows {
            let t = parse_type(&row.try_get::<String, _>("snapshot_type")?)?;
            counts_by_type.insert(t, row.try_get::<i64, _>("n")? as u64);
        }

        Ok(SystemMetrics {
            project_count: totals.try_get::<i64, _>("projects")? as u64,
            total_snapshots: totals.try_get::<i64, _>("total")? as u64,
            counts_by_type,
            last_processed_at: last.map(millis_to_utc).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{exercise_contract, pid, record};
    use super::*;

    async fn store() -> SqliteSnapshotStore {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteSnapshotStore::new(pool)
    }

    #[tokio::test]
    async fn satisfies_store_contract() {
        exercise_contract(&store().await).await;
    }

    #[tokio::test]
    async fn fields_round_trip_through_json_column() {
        let s = store().await;
        let p = pid("proj_a");
        let mut r = record("proj_a", SnapshotType::CsvSchema, "data/x.csv");
        r.fields.insert("columns".into(), serde_json::json!([{"name": "id", "type": "integer"}]));
        s.save_many(&p, std::slice::from_ref(&r)).await.unwrap();
        let back = s.query(&p, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(back[0].fields, r.fields);
        assert_eq!(back[0].id, r.id);
        assert_eq!(
            back[0].created_at.timestamp_millis(),
            r.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_writes() {
        let s = store().await;
        let p = pid("proj_a");
        let first = record("proj_a", SnapshotType::Functions, "a.py");
        s.save_many(&p, std::slice::from_ref(&first)).await.unwrap();

        // Second batch collides on the primary key halfway through.
        let batch = vec![record("proj_a", SnapshotType::Imports, "b.py"), first.clone()];
        assert!(s.save_many(&p, &batch).await.is_err());
        let all = s.query(&p, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, first.id);
    }
}
