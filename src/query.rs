//! Read-side views over a project's snapshots.
//!
//! [`notebook`] gathers everything stored for one project into a single
//! document: per-type counts, the project-level `repo_metadata`, and one
//! section per source file keyed by snapshot type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{Fields, ProjectId, SnapshotFilter, SnapshotRecord, SnapshotType};
use crate::store::SnapshotStore;

/// Query response shape: the records plus how many matched.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub project_id: ProjectId,
    pub snapshot_type: Option<SnapshotType>,
    pub source_path: Option<String>,
    pub count: usize,
    pub snapshots: Vec<SnapshotRecord>,
}

pub async fn query_snapshots(
    store: &dyn SnapshotStore,
    project: &ProjectId,
    filter: SnapshotFilter,
) -> Result<QueryResponse> {
    let snapshots = store.query(project, &filter).await?;
    Ok(QueryResponse {
        project_id: project.clone(),
        snapshot_type: filter.snapshot_type,
        source_path: filter.source_path,
        count: snapshots.len(),
        snapshots,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSection {
    pub source_path: String,
    /// Types recorded for this file, with their fields. Types that occur
    /// more than once keep the first record.
    pub snapshots: BTreeMap<SnapshotType, Fields>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notebook {
    pub project_id: ProjectId,
    pub total_snapshots: usize,
    pub counts_by_type: BTreeMap<SnapshotType, u64>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub repo: Option<Fields>,
    pub files: Vec<FileSection>,
}

pub async fn notebook(store: &dyn SnapshotStore, project: &ProjectId) -> Result<Notebook> {
    let records = store.query(project, &SnapshotFilter::default()).await?;
    let manifest = store.manifest(project).await?;

    let mut repo = None;
    let mut files: BTreeMap<String, FileSection> = BTreeMap::new();
    for record in &records {
        if record.snapshot_type.is_project_level() {
            repo.get_or_insert_with(|| record.fields.clone());
            continue;
        }
        files
            .entry(record.source_path.clone())
            .or_insert_with(|| FileSection {
                source_path: record.source_path.clone(),
                snapshots: BTreeMap::new(),
            })
            .snapshots
            .entry(record.snapshot_type)
            .or_insert_with(|| record.fields.clone());
    }

    Ok(Notebook {
        project_id: project.clone(),
        total_snapshots: records.len(),
        counts_by_type: manifest.counts_by_type,
        last_processed_at: manifest.last_processed_at,
        repo,
        files: files.into_values().collect(),
    })
}
