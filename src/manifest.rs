//! Processing manifest: the per-run summary handed back to the caller.
//!
//! Built incrementally by [`RunRecorder`] as the orchestrator moves through
//! its states, then frozen into a [`ProcessingManifest`] once persistence
//! has committed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use crate::adapters::{CapabilityFailure, FailureKind};
use crate::models::{Capability, ProjectId, SnapshotRecord, SnapshotType, Verdict};
use crate::router::{Exclusion, Unrouted, WorkPlan};

/// Orchestrator state. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Acquiring,
    Routing,
    Parsing,
    Mapping,
    Building,
    Persisting,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Acquiring => "ACQUIRING",
            RunState::Routing => "ROUTING",
            RunState::Parsing => "PARSING",
            RunState::Mapping => "MAPPING",
            RunState::Building => "BUILDING",
            RunState::Persisting => "PERSISTING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed `(file, capability)` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub capability: Capability,
    pub kind: FailureKind,
    pub message: String,
}

/// A file kept out of parsing by the limit policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingManifest {
    pub run_id: String,
    pub project_id: ProjectId,
    pub vendor_id: Option<String>,
    pub source: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    pub files_seen: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_rejected: u64,
    pub files_unrouted: u64,
    pub files_excluded: u64,
    pub files_warned: u64,
    /// Routed files by category verdict.
    pub categories: BTreeMap<Verdict, u64>,
    /// Processed files by category verdict.
    pub processed_by_category: BTreeMap<Verdict, u64>,

    pub capability_failures: BTreeMap<Capability, u64>,
    pub failures: Vec<FileFailure>,
    pub rejections: Vec<Rejection>,
    pub excluded: Vec<Exclusion>,
    pub unrouted: Vec<Unrouted>,
    pub warnings: Vec<String>,

    pub snapshot_counts: BTreeMap<SnapshotType, u64>,
    pub total_snapshots: u64,
    /// Records of the previous generation removed by this run.
    pub records_replaced: u64,
}

impl ProcessingManifest {
    pub fn count(&self, snapshot_type: SnapshotType) -> u64 {
        self.snapshot_counts.get(&snapshot_type).copied().unwrap_or(0)
    }
}

/// Accumulates run outcomes while the orchestrator works.
pub struct RunRecorder {
    run_id: String,
    project_id: ProjectId,
    vendor_id: Option<String>,
    source: String,
    state: RunState,
    started_at: DateTime<Utc>,
    clock: Instant,

    files_seen: u64,
    files_processed: u64,
    files_failed: u64,
    files_warned: u64,
    categories: BTreeMap<Verdict, u64>,
    processed_by_category: BTreeMap<Verdict, u64>,
    capability_failures: BTreeMap<Capability, u64>,
    failures: Vec<FileFailure>,
    rejections: Vec<Rejection>,
    excluded: Vec<Exclusion>,
    unrouted: Vec<Unrouted>,
    warnings: Vec<String>,
}

impl RunRecorder {
    pub fn new(project_id: &ProjectId, vendor_id: Option<&str>, source: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            vendor_id: vendor_id.map(str::to_string),
            source: source.into(),
            state: RunState::Routing,
            started_at: Utc::now(),
            clock: Instant::now(),
            files_seen: 0,
            files_processed: 0,
            files_failed: 0,
            files_warned: 0,
            categories: BTreeMap::new(),
            processed_by_category: BTreeMap::new(),
            capability_failures: BTreeMap::new(),
            failures: Vec::new(),
            rejections: Vec::new(),
            excluded: Vec::new(),
            unrouted: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn enter(&mut self, state: RunState) {
        tracing::debug!(
            run_id = %self.run_id,
            project_id = %self.project_id,
            from = %self.state,
            to = %state,
            "run state"
        );
        self.state = state;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Take routing results: seen/excluded/unrouted files, categories, rejections.
    pub fn record_plan(&mut self, plan: &WorkPlan) {
        let files = plan.files();
        self.files_seen = plan.files_seen() as u64;
        for work in &files {
            *self.categories.entry(work.verdict).or_default() += 1;
            match work.verdict {
                Verdict::Rejected => self.rejections.push(Rejection {
                    path: work.file.rel_path.clone(),
                    reason: work.warnings.join("; "),
                }),
                Verdict::Large | Verdict::PotentialGod => {
                    self.files_warned += 1;
                    for w in &work.warnings {
                        self.warnings.push(format!("{}: {}", work.file.rel_path, w));
                    }
                }
                Verdict::Normal => {}
            }
        }
        self.excluded = plan.excluded.clone();
        self.unrouted = plan.unrouted.clone();
    }

    pub fn record_failure(&mut self, path: &str, capability: Capability, failure: &CapabilityFailure) {
        *self.capability_failures.entry(capability).or_default() += 1;
        self.failures.push(FileFailure {
            path: path.to_string(),
            capability,
            kind: failure.kind,
            message: failure.message.clone(),
        });
    }

    /// A dispatched file finished parsing; `failed` if any capability failed.
    pub fn record_file(&mut self, verdict: Verdict, failed: bool) {
        if failed {
            self.files_failed += 1;
        } else {
            self.files_processed += 1;
            *self.processed_by_category.entry(verdict).or_default() += 1;
        }
    }

    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.warnings.extend(warnings);
    }

    pub fn finish(mut self, records: &[SnapshotRecord], records_replaced: u64) -> ProcessingManifest {
        self.enter(RunState::Done);
        let mut snapshot_counts: BTreeMap<SnapshotType, u64> =
            SnapshotType::ALL.iter().map(|t| (*t, 0)).collect();
        for r in records {
            *snapshot_counts.entry(r.snapshot_type).or_default() += 1;
        }
        self.failures.sort_by(|a, b| {
            a.path.cmp(&b.path).then(a.capability.cmp(&b.capability))
        });

        ProcessingManifest {
            duration_ms: self.elapsed_ms(),
            run_id: self.run_id,
            project_id: self.project_id,
            vendor_id: self.vendor_id,
            source: self.source,
            state: self.state,
            started_at: self.started_at,
            finished_at: Utc::now(),
            files_seen: self.files_seen,
            files_processed: self.files_processed,
            files_failed: self.files_failed,
            files_rejected: self.rejections.len() as u64,
            files_unrouted: self.unrouted.len() as u64,
            files_excluded: self.excluded.len() as u64,
            files_warned: self.files_warned,
            categories: self.categories,
            processed_by_category: self.processed_by_category,
            capability_failures: self.capability_failures,
            failures: self.failures,
            rejections: self.rejections,
            excluded: self.excluded,
            unrouted: self.unrouted,
            warnings: self.warnings,
            total_snapshots: records.len() as u64,
            snapshot_counts,
            records_replaced,
        }
    }
}
