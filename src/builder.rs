//! Snapshot Builder: identity, scope and timestamp for validated candidates.
//!
//! Identities are random (UUID v4), not derived from content. Re-processing
//! a project therefore replaces its records wholesale instead of diffing them.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::mapping::{Candidate, MappingTable};
use crate::models::{ProjectId, SnapshotRecord};

pub struct SnapshotBuilder {
    table: Arc<MappingTable>,
}

impl SnapshotBuilder {
    pub fn new(table: Arc<MappingTable>) -> Self {
        Self { table }
    }

    /// Finalize one candidate. On schema failure returns the warning to record;
    /// nothing of the candidate survives.
    pub fn build(
        &self,
        project: &ProjectId,
        candidate: Candidate,
    ) -> std::result::Result<SnapshotRecord, String> {
        let Candidate {
            snapshot_type,
            source_path,
            fields,
        } = candidate;

        if source_path.is_empty()
            || source_path.starts_with('/')
            || source_path.split('/').any(|c| c == "..")
        {
            return Err(format!(
                "{}: dropped {} record, invalid source path",
                source_path, snapshot_type
            ));
        }

        let Some(schema) = self.table.schema(snapshot_type) else {
            return Err(format!(
                "{}: dropped {} record, no schema for type",
                source_path, snapshot_type
            ));
        };
        let problems = schema.check(&fields);
        if !problems.is_empty() {
            return Err(format!(
                "{}: dropped {} record, {}",
                source_path,
                snapshot_type,
                problems.join("; ")
            ));
        }

        Ok(SnapshotRecord {
            id: Uuid::new_v4().to_string(),
            project_id: project.clone(),
            snapshot_type,
            source_path,
            fields,
            created_at: Utc::now(),
        })
    }

    /// Build every candidate, collecting one warning per dropped record.
    pub fn build_all(
        &self,
        project: &ProjectId,
        candidates: Vec<Candidate>,
    ) -> (Vec<SnapshotRecord>, Vec<String>) {
        let mut records = Vec::with_capacity(candidates.len());
        let mut warnings = Vec::new();
        for candidate in candidates {
            match self.build(project, candidate) {
                Ok(record) => records.push(record),
                Err(warning) => {
                    tracing::warn!(project_id = %project, "{}", warning);
                    warnings.push(warning);
                }
            }
        }
        (records, warnings)
    }
}
