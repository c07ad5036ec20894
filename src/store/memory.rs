//! In-memory [`SnapshotStore`] for tests and embedding.
//!
//! One `RwLock` guards the whole map, so every batch is applied under a
//! single write guard and readers never observe half a batch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    ensure_scoped, sort_records, summarize, zero_counts, ProjectManifest, SnapshotStore,
    SystemMetrics,
};
use crate::error::{Result, SnapError};
use crate::models::{ProjectId, SnapshotFilter, SnapshotRecord};

#[derive(Default)]
pub struct InMemorySnapshotStore {
    projects: RwLock<HashMap<ProjectId, Vec<SnapshotRecord>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ProjectId, Vec<SnapshotRecord>>>> {
        self.projects
            .read()
            .map_err(|_| SnapError::Persistence("snapshot store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ProjectId, Vec<SnapshotRecord>>>> {
        self.projects
            .write()
            .map_err(|_| SnapError::Persistence("snapshot store lock poisoned".into()))
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_many(&self, project: &ProjectId, records: &[SnapshotRecord]) -> Result<u64> {
        ensure_scoped(project, records)?;
        let mut projects = self.write()?;
        let existing = projects.entry(project.clone()).or_default();
        if let Some(clash) = records
            .iter()
            .find(|r| existing.iter().any(|e| e.id == r.id))
        {
            return Err(SnapError::Persistence(format!(
                "record id {} already stored",
                clash.id
            )));
        }
        existing.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn replace_project(
        &self,
        project: &ProjectId,
        records: &[SnapshotRecord],
    ) -> Result<(u64, u64)> {
        ensure_scoped(project, records)?;
        let mut projects = self.write()?;
        let removed = projects
            .insert(project.clone(), records.to_vec())
            .map_or(0, |old| old.len() as u64);
        if records.is_empty() {
            projects.remove(project);
        }
        Ok((removed, records.len() as u64))
    }

    async fn query(
        &self,
        project: &ProjectId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<SnapshotRecord>> {
        let projects = self.read()?;
        let mut hits: Vec<SnapshotRecord> = projects
            .get(project)
            .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        sort_records(&mut hits);
        Ok(hits)
    }

    async fn manifest(&self, project: &ProjectId) -> Result<ProjectManifest> {
        let projects = self.read()?;
        Ok(match projects.get(project) {
            Some(records) => summarize(project, records),
            None => ProjectManifest::empty(project),
        })
    }

    async fn delete_project(&self, project: &ProjectId) -> Result<u64> {
        let mut projects = self.write()?;
        Ok(projects.remove(project).map_or(0, |r| r.len() as u64))
    }

    async fn system_metrics(&self) -> Result<SystemMetrics> {
        let projects = self.read()?;
        let mut metrics = SystemMetrics {
            project_count: 0,
            total_snapshots: 0,
            counts_by_type: zero_counts(),
            last_processed_at: None,
        };
        for records in projects.values().filter(|r| !r.is_empty()) {
            metrics.project_count += 1;
            metrics.total_snapshots += records.len() as u64;
            for r in records {
                *metrics.counts_by_type.entry(r.snapshot_type).or_default() += 1;
                metrics.last_processed_at = metrics.last_processed_at.max(Some(r.created_at));
            }
        }
        Ok(metrics)
    }
}
