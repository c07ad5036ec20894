//! Snapshot Repository: the only persistence boundary.
//!
//! Every operation except [`SnapshotStore::system_metrics`] takes a
//! [`ProjectId`], so an unscoped read or write cannot be expressed. Batches
//! are all-or-nothing, and records whose `project_id` differs from the scope
//! they are written under are refused before anything is touched.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`save_many`](SnapshotStore::save_many) | Atomically insert a batch |
//! | [`replace_project`](SnapshotStore::replace_project) | Atomically clear a project and insert its new batch |
//! | [`query`](SnapshotStore::query) | Records of one project, optionally by type and path |
//! | [`manifest`](SnapshotStore::manifest) | Per-project counts and last-processed time |
//! | [`delete_project`](SnapshotStore::delete_project) | Remove every record of a project |
//! | [`system_metrics`](SnapshotStore::system_metrics) | Cross-project aggregates only |

pub mod memory;
pub mod sqlite;

pub use memory::InMemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SnapError};
use crate::models::{ProjectId, SnapshotFilter, SnapshotRecord, SnapshotType};

/// Aggregate view of one project's stored snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectManifest {
    pub project_id: ProjectId,
    /// Every snapshot type, zero when absent.
    pub counts_by_type: BTreeMap<SnapshotType, u64>,
    pub total_snapshots: u64,
    /// Distinct source files, project-level records excluded.
    pub file_count: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl ProjectManifest {
    pub fn empty(project: &ProjectId) -> Self {
        Self {
            project_id: project.clone(),
            counts_by_type: zero_counts(),
            total_snapshots: 0,
            file_count: 0,
            last_processed_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_snapshots == 0
    }
}

/// Cross-project aggregates. Carries no record content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub project_count: u64,
    pub total_snapshots: u64,
    pub counts_by_type: BTreeMap<SnapshotType, u64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert a batch atomically. Returns the number of records written.
    async fn save_many(&self, project: &ProjectId, records: &[SnapshotRecord]) -> Result<u64>;

    /// Delete all of a project's records and insert `records` in one
    /// transaction. Returns `(removed, inserted)`.
    async fn replace_project(
        &self,
        project: &ProjectId,
        records: &[SnapshotRecord],
    ) -> Result<(u64, u64)>;

    /// Records of `project` matching `filter`, ordered by source path, type, id.
    async fn query(
        &self,
        project: &ProjectId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<SnapshotRecord>>;

    async fn manifest(&self, project: &ProjectId) -> Result<ProjectManifest>;

    /// Remove every record of `project`. Returns the number removed.
    async fn delete_project(&self, project: &ProjectId) -> Result<u64>;

    async fn system_metrics(&self) -> Result<SystemMetrics>;
}

pub(crate) fn zero_counts() -> BTreeMap<SnapshotType, u64> {
    SnapshotType::ALL.iter().map(|t| (*t, 0)).collect()
}

/// Refuse a batch if any record belongs to another project.
pub(crate) fn ensure_scoped(project: &ProjectId, records: &[SnapshotRecord]) -> Result<()> {
    if let Some(stray) = records.iter().find(|r| &r.project_id != project) {
        return Err(SnapError::IsolationViolation(format!(
            "record {} belongs to project '{}', not '{}'",
            stray.id, stray.project_id, project
        )));
    }
    let mut seen = BTreeSet::new();
    if let Some(dup) = records.iter().find(|r| !seen.insert(r.id.as_str())) {
        return Err(SnapError::Persistence(format!(
            "duplicate record id {} in batch",
            dup.id
        )));
    }
    Ok(())
}

pub(crate) fn sort_records(records: &mut [SnapshotRecord]) {
    records.sort_by(|a, b| {
        a.source_path
            .cmp(&b.source_path)
            .then(a.snapshot_type.cmp(&b.snapshot_type))
            .then(a.id.cmp(&b.id))
    });
}

/// Manifest computed from a project's full record set.
pub(crate) fn summarize(project: &ProjectId, records: &[SnapshotRecord]) -> ProjectManifest {
    let mut manifest = ProjectManifest::empty(project);
    let mut files = BTreeSet::new();
    for r in records {
        *manifest.counts_by_type.entry(r.snapshot_type).or_default() += 1;
        if !r.snapshot_type.is_project_level() {
            files.insert(r.source_path.as_str());
        }
        manifest.last_processed_at = manifest.last_processed_at.max(Some(r.created_at));
    }
    manifest.total_snapshots = records.len() as u64;
    manifest.file_count = files.len() as u64;
    manifest
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the backend test suites.

    use super::*;
    use crate::models::Fields;
    use serde_json::json;

    pub fn record(project: &str, t: SnapshotType, path: &str) -> SnapshotRecord {
        let mut fields = Fields::new();
        fields.insert("marker".into(), json!(format!("{}:{}", project, path)));
        SnapshotRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: ProjectId::parse(project).unwrap(),
            snapshot_type: t,
            source_path: path.into(),
            fields,
            created_at: Utc::now(),
        }
    }

    pub fn pid(s: &str) -> ProjectId {
        ProjectId::parse(s).unwrap()
    }

    /// Contract every backend must satisfy.
    pub async fn exercise_contract(store: &dyn SnapshotStore) {
        let (a, b) = (pid("proj_a"), pid("proj_b"));
        let a_batch = vec![
            record("proj_a", SnapshotType::Functions, "src/lib.rs"),
            record("proj_a", SnapshotType::Imports, "src/lib.rs"),
            record("proj_a", SnapshotType::CsvData, "data.csv"),
            record("proj_a", SnapshotType::RepoMetadata, "."),
        ];
        let b_batch = vec![record("proj_b", SnapshotType::Functions, "src/lib.rs")];
        assert_eq!(store.save_many(&a, &a_batch).await.unwrap(), 4);
        assert_eq!(store.save_many(&b, &b_batch).await.unwrap(), 1);

        // Isolation: same path and type in another project never leaks.
        let hits = store
            .query(&a, &SnapshotFilter::by_type(SnapshotType::Functions))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits.iter().all(|r| r.project_id == a));
        assert_eq!(hits[0].fields["marker"], json!("proj_a:src/lib.rs"));

        let by_path = store.query(&a, &SnapshotFilter::by_path("src/lib.rs")).await.unwrap();
        assert_eq!(by_path.len(), 2);
        assert_eq!(by_path[0].snapshot_type, SnapshotType::Imports);

        // Cross-project writes are refused and leave no trace.
        let stray = vec![
            record("proj_a", SnapshotType::Quality, "x.py"),
            record("proj_b", SnapshotType::Quality, "x.py"),
        ];
        assert!(matches!(
            store.save_many(&a, &stray).await,
            Err(SnapError::IsolationViolation(_))
        ));
        assert!(store
            .query(&a, &SnapshotFilter::by_path("x.py"))
            .await
            .unwrap()
            .is_empty());

        let m = store.manifest(&a).await.unwrap();
        assert_eq!(m.total_snapshots, 4);
        assert_eq!(m.file_count, 2);
        assert_eq!(m.counts_by_type[&SnapshotType::Functions], 1);
        assert_eq!(m.counts_by_type[&SnapshotType::Security], 0);
        assert_eq!(m.counts_by_type.len(), 14);
        assert!(m.last_processed_at.is_some());

        let metrics = store.system_metrics().await.unwrap();
        assert_eq!(metrics.project_count, 2);
        assert_eq!(metrics.total_snapshots, 5);
        assert_eq!(metrics.counts_by_type[&SnapshotType::Functions], 2);

        // Replacement is a full swap.
        let fresh = vec![record("proj_a", SnapshotType::Security, "src/lib.rs")];
        assert_eq!(store.replace_project(&a, &fresh).await.unwrap(), (4, 1));
        let all = store.query(&a, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].snapshot_type, SnapshotType::Security);

        // Cascading delete.
        assert_eq!(store.delete_project(&a).await.unwrap(), 1);
        assert!(store.query(&a, &SnapshotFilter::default()).await.unwrap().is_empty());
        let m = store.manifest(&a).await.unwrap();
        assert!(m.is_empty());
        assert!(m.counts_by_type.values().all(|c| *c == 0));
        assert_eq!(m.file_count, 0);
        assert_eq!(store.query(&b, &SnapshotFilter::default()).await.unwrap().len(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn summarize_excludes_project_level_from_file_count() {
        let p = pid("proj_a");
        let records = vec![
            record("proj_a", SnapshotType::Functions, "a.py"),
            record("proj_a", SnapshotType::Quality, "a.py"),
            record("proj_a", SnapshotType::RepoMetadata, "."),
        ];
        let m = summarize(&p, &records);
        assert_eq!(m.file_count, 1);
        assert_eq!(m.total_snapshots, 3);
    }

    #[test]
    fn duplicate_ids_in_a_batch_are_refused() {
        let p = pid("proj_a");
        let r = record("proj_a", SnapshotType::Functions, "a.py");
        assert!(ensure_scoped(&p, &[r.clone(), r]).is_err());
    }
}
