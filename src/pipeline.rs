//! Pipeline orchestration.
//!
//! Drives one processing run per project:
//!
//! ```text
//! (ACQUIRING) → ROUTING → PARSING → MAPPING → BUILDING → PERSISTING → DONE
//!                   └──────────┴─────────┴──────────┴──────────┴────→ FAILED
//! ```
//!
//! Per-file capability failures never fail the run; they are recorded in the
//! manifest and the file counts as failed. Storage errors, a missing staging
//! root, an oversized repository or a failed clone end the run with an error
//! and no manifest. Cancellation is checked after every file and again before
//! persisting; once PERSISTING starts the run is not interruptible.
//!
//! Persisting replaces the project's previous generation in one transaction,
//! so re-running over an unchanged tree converges on the same snapshot set.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};

use crate::acquire::Acquirer;
use crate::adapters::{
    invoke_with_timeout, AdapterRegistry, CapabilityFailure, InvokeResult, ParserAdapter,
};
use crate::builder::SnapshotBuilder;
use crate::config::Config;
use crate::error::{Result, SnapError};
use crate::limits::LimitPolicy;
use crate::manifest::{ProcessingManifest, RunRecorder, RunState};
use crate::mapping::{FileContext, MappingTable};
use crate::models::{Capability, FieldMapping, FileType, ProjectId, SnapshotRecord, StagedFile, Verdict};
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::router::{FileRouter, FileWork, WorkPlan};
use crate::staging::StagingArea;
use crate::store::{SnapshotStore, SqliteSnapshotStore};

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a run reads its files from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The project's staging root.
    Staged,
    /// A remote repository, shallow-cloned before routing.
    Clone { url: String, branch: Option<String> },
}

impl Source {
    pub fn describe(&self) -> String {
        match self {
            Source::Staged => "staging".to_string(),
            Source::Clone { url, .. } => url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub project_id: ProjectId,
    pub records_removed: u64,
    pub files_removed: u64,
}

/// Parser output for one dispatched file.
struct ParsedFile {
    index: usize,
    output: FieldMapping,
    failures: Vec<(Capability, CapabilityFailure)>,
}

/// Removes the project from the busy set when dropped.
struct ProjectClaim<'a> {
    busy: &'a Mutex<HashSet<ProjectId>>,
    project: ProjectId,
}

impl Drop for ProjectClaim<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project);
    }
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn SnapshotStore>,
    registry: AdapterRegistry,
    table: Arc<MappingTable>,
    policy: LimitPolicy,
    router: Arc<FileRouter>,
    staging: StagingArea,
    acquirer: Acquirer,
    progress: Arc<dyn RunProgressReporter>,
    busy: Mutex<HashSet<ProjectId>>,
}

impl Pipeline {
    /// Build a pipeline with the built-in adapters and the configured mapping table.
    pub fn new(config: Config, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let policy = LimitPolicy::new(config.limits.clone());
        let staging = StagingArea::new(&config)?;
        let router = Arc::new(FileRouter::new(
            policy.clone(),
            staging.ignore_policy().clone(),
        ));
        let table = Arc::new(MappingTable::from_config(config.pipeline.mapping.as_deref())?);
        Ok(Self {
            registry: AdapterRegistry::builtin(&policy),
            acquirer: Acquirer::new(&config.acquisition),
            progress: Arc::new(NoProgress),
            busy: Mutex::new(HashSet::new()),
            config,
            store,
            table,
            policy,
            router,
            staging,
        })
    }

    /// Open the configured SQLite store (creating the schema) and build a pipeline on it.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SqliteSnapshotStore::open(&config).await?;
        Self::new(config, Arc::new(store))
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_acquirer(mut self, acquirer: Acquirer) -> Self {
        self.acquirer = acquirer;
        self
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Run the full pipeline for `project` and return its manifest.
    pub async fn process(
        &self,
        project: &ProjectId,
        source: Source,
        vendor_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ProcessingManifest> {
        let vendor_id = vendor_id.map(validate_vendor_id).transpose()?;
        let _claim = self.claim(project)?;

        let mut run = RunRecorder::new(project, vendor_id, source.describe());
        tracing::info!(
            project_id = %project,
            run_id = %run.run_id(),
            vendor_id = vendor_id.unwrap_or("-"),
            source = %source.describe(),
            "processing run started"
        );

        match self.execute(project, &source, cancel, &mut run).await {
            Ok((records, replaced)) => {
                let manifest = run.finish(&records, replaced);
                tracing::info!(
                    project_id = %project,
                    run_id = %manifest.run_id,
                    files_seen = manifest.files_seen,
                    files_processed = manifest.files_processed,
                    files_failed = manifest.files_failed,
                    files_rejected = manifest.files_rejected,
                    snapshots = manifest.total_snapshots,
                    duration_ms = manifest.duration_ms,
                    "processing run complete"
                );
                self.report_state(project, RunState::Done);
                Ok(manifest)
            }
            Err(err) => {
                let failed_in = run.state();
                run.enter(RunState::Failed);
                self.report_state(project, RunState::Failed);
                if matches!(err, SnapError::Cancelled(_)) {
                    tracing::info!(project_id = %project, run_id = %run.run_id(), state = %failed_in, "processing run cancelled");
                } else {
                    tracing::error!(project_id = %project, run_id = %run.run_id(), state = %failed_in, error = %err, "processing run failed");
                }
                Err(err)
            }
        }
    }

    /// Remove the project's staged files. Returns how many were removed.
    pub fn clear_staging(&self, project: &ProjectId) -> Result<u64> {
        let _claim = self.claim(project)?;
        self.staging.clear(project)
    }

    /// Delete every record, staged file and clone of a project.
    pub async fn delete_project(&self, project: &ProjectId) -> Result<DeleteOutcome> {
        let _claim = self.claim(project)?;
        let records_removed = self.store.delete_project(project).await?;
        let files_removed = self.staging.purge(project)?;
        tracing::info!(project_id = %project, records_removed, files_removed, "project deleted");
        Ok(DeleteOutcome {
            project_id: project.clone(),
            records_removed,
            files_removed,
        })
    }

    fn claim(&self, project: &ProjectId) -> Result<ProjectClaim<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(project.clone()) {
            return Err(SnapError::ProjectBusy(project.to_string()));
        }
        Ok(ProjectClaim {
            busy: &self.busy,
            project: project.clone(),
        })
    }

    fn enter(&self, run: &mut RunRecorder, project: &ProjectId, state: RunState) {
        run.enter(state);
        self.report_state(project, state);
    }

    fn report_state(&self, project: &ProjectId, state: RunState) {
        self.progress.report(RunProgressEvent::State {
            project: project.to_string(),
            state,
        });
    }

    async fn execute(
        &self,
        project: &ProjectId,
        source: &Source,
        cancel: &CancelToken,
        run: &mut RunRecorder,
    ) -> Result<(Vec<SnapshotRecord>, u64)> {
        let root = self.resolve_root(project, source, cancel, run).await?;

        self.enter(run, project, RunState::Routing);
        let router = Arc::clone(&self.router);
        let plan_root = root.clone();
        let plan = tokio::task::spawn_blocking(move || router.plan(&plan_root))
            .await
            .map_err(|e| SnapError::io(&root, std::io::Error::other(e.to_string())))??;
        self.policy.check_repository(plan.total_bytes)?;
        // An empty staging tree must not replace the stored generation.
        if matches!(source, Source::Staged) && plan.files_seen() == 0 {
            return Err(SnapError::Validation(format!(
                "no files in staging area for project '{}'; stage files first",
                project
            )));
        }
        run.record_plan(&plan);
        checkpoint(cancel, project)?;

        let files = plan.files();
        self.enter(run, project, RunState::Parsing);
        let parsed = self.parse_all(project, &root, &files, cancel, run).await?;

        self.enter(run, project, RunState::Mapping);
        let mut candidates = Vec::new();
        for (work, parsed) in files.iter().zip(&parsed) {
            let Some(parsed) = parsed else { continue };
            let outcome = self
                .table
                .project(&parsed.output, &FileContext::for_file(&work.file, work.verdict));
            for warning in &outcome.warnings {
                tracing::warn!(project_id = %project, "{}", warning);
            }
            run.extend_warnings(outcome.warnings);
            candidates.extend(outcome.candidates);
            checkpoint(cancel, project)?;
        }
        let repo = repo_summary(project, source, &files, &plan);
        let outcome = self.table.project(&repo, &FileContext::project_level());
        run.extend_warnings(outcome.warnings);
        candidates.extend(outcome.candidates);

        self.enter(run, project, RunState::Building);
        let builder = SnapshotBuilder::new(Arc::clone(&self.table));
        let (records, warnings) = builder.build_all(project, candidates);
        run.extend_warnings(warnings);
        checkpoint(cancel, project)?;

        self.enter(run, project, RunState::Persisting);
        let (replaced, inserted) = self.store.replace_project(project, &records).await?;
        tracing::debug!(project_id = %project, replaced, inserted, "snapshot generation replaced");
        Ok((records, replaced))
    }

    async fn resolve_root(
        &self,
        project: &ProjectId,
        source: &Source,
        cancel: &CancelToken,
        run: &mut RunRecorder,
    ) -> Result<PathBuf> {
        match source {
            Source::Staged => {
                let root = self.staging.project_root(project);
                let meta = std::fs::symlink_metadata(&root).map_err(|_| {
                    SnapError::StagingMissing {
                        project: project.to_string(),
                        path: root.clone(),
                    }
                })?;
                if meta.file_type().is_symlink() {
                    return Err(SnapError::Security(format!(
                        "staging root is a symbolic link: {}",
                        root.display()
                    )));
                }
                if !meta.is_dir() {
                    return Err(SnapError::StagingMissing {
                        project: project.to_string(),
                        path: root,
                    });
                }
                Ok(root)
            }
            Source::Clone { url, branch } => {
                self.enter(run, project, RunState::Acquiring);
                let dest = self.staging.clone_root(project);
                self.acquirer
                    .acquire(project, url, branch.as_deref(), &dest, cancel)
                    .await
            }
        }
    }

    /// Invoke every capability of every dispatchable file on a bounded pool.
    /// Results come back indexed by position in `files`.
    async fn parse_all(
        &self,
        project: &ProjectId,
        root: &Path,
        files: &[FileWork],
        cancel: &CancelToken,
        run: &mut RunRecorder,
    ) -> Result<Vec<Option<ParsedFile>>> {
        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.workers.max(1)));
        let timeout = Duration::from_secs(self.config.pipeline.parser_timeout_secs);
        let mut set = JoinSet::new();

        for (index, work) in files.iter().enumerate() {
            if work.verdict == Verdict::Rejected {
                continue;
            }
            let file = Arc::clone(&work.file);
            let adapters: Vec<(Capability, Option<Arc<dyn ParserAdapter>>)> = work
                .capabilities
                .iter()
                .map(|c| (*c, self.registry.get(*c)))
                .collect();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let mut parsed = ParsedFile {
                    index,
                    output: FieldMapping::new(),
                    failures: Vec::new(),
                };
                for (capability, adapter) in adapters {
                    let result = match adapter {
                        Some(adapter) => {
                            invoke_isolated(adapter, Arc::clone(&file), capability, timeout).await
                        }
                        None => Err(CapabilityFailure::unsupported(format!(
                            "no adapter registered for {}",
                            capability
                        ))),
                    };
                    match result {
                        Ok(output) => parsed.output.extend(output),
                        Err(failure) => parsed.failures.push((capability, failure)),
                    }
                }
                parsed
            });
        }

        let total = set.len() as u64;
        let mut done = 0;
        let mut results: Vec<Option<ParsedFile>> = files.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let parsed = joined.map_err(|e| {
                SnapError::io(root, std::io::Error::other(format!("parser worker: {}", e)))
            })?;
            let work = &files[parsed.index];
            for (capability, failure) in &parsed.failures {
                tracing::warn!(
                    project_id = %project,
                    path = %work.file.rel_path,
                    capability = %capability,
                    kind = failure.kind.as_str(),
                    "{}",
                    failure.message
                );
                run.record_failure(&work.file.rel_path, *capability, failure);
            }
            run.record_file(work.verdict, !parsed.failures.is_empty());

            done += 1;
            self.progress.report(RunProgressEvent::Parsing {
                project: project.to_string(),
                n: done,
                total,
            });
            if cancel.is_cancelled() {
                set.abort_all();
                return Err(SnapError::Cancelled(project.to_string()));
            }
            let index = parsed.index;
            results[index] = Some(parsed);
        }
        Ok(results)
    }
}

/// Run one invocation on its own task so a panicking adapter becomes a
/// `parse_error` instead of taking the run down.
async fn invoke_isolated(
    adapter: Arc<dyn ParserAdapter>,
    file: Arc<StagedFile>,
    capability: Capability,
    timeout: Duration,
) -> InvokeResult {
    let name = adapter.name().to_string();
    let handle = tokio::spawn(async move {
        invoke_with_timeout(adapter.as_ref(), &file, capability, timeout).await
    });
    let _guard = AbortOnDrop(handle.abort_handle());
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(CapabilityFailure::parse_error(format!(
            "{} aborted: {}",
            name, e
        ))),
    }
}

/// Aborts the invocation task when its worker is dropped, e.g. by `abort_all`.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn checkpoint(cancel: &CancelToken, project: &ProjectId) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SnapError::Cancelled(project.to_string()));
    }
    Ok(())
}

fn validate_vendor_id(raw: &str) -> Result<&str> {
    let id = raw.trim();
    if id.is_empty() || id.chars().count() > 64 || id.chars().any(char::is_control) {
        return Err(SnapError::Validation(format!(
            "vendor_id must be 1-64 printable characters, got {:?}",
            raw
        )));
    }
    Ok(id)
}

/// `repo.*` namespace for the project-level `repo_metadata` record.
fn repo_summary(
    project: &ProjectId,
    source: &Source,
    files: &[FileWork],
    plan: &WorkPlan,
) -> FieldMapping {
    let name = match source {
        Source::Staged => project.to_string(),
        Source::Clone { url, .. } => url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(url)
            .trim_end_matches(".git")
            .to_string(),
    };

    let mut languages: BTreeMap<&str, u64> = BTreeMap::new();
    let mut categories: BTreeMap<&str, u64> = BTreeMap::new();
    let mut total_loc = 0u64;
    for work in files {
        *categories.entry(work.verdict.as_str()).or_default() += 1;
        if let FileType::Code(lang) = work.file.file_type {
            *languages.entry(lang.as_str()).or_default() += 1;
            total_loc += work.file.line_count;
        }
    }
    let to_object = |m: BTreeMap<&str, u64>| -> Value {
        Value::Object(m.into_iter().map(|(k, v)| (k.to_string(), json!(v))).collect::<Map<_, _>>())
    };

    let mut out = FieldMapping::new();
    out.insert("repo.name".into(), json!(name));
    out.insert("repo.source".into(), json!(source.describe()));
    out.insert("repo.file_count".into(), json!(files.len()));
    out.insert("repo.total_bytes".into(), json!(plan.total_bytes));
    out.insert("repo.total_loc".into(), json!(total_loc));
    out.insert("repo.languages".into(), to_object(languages));
    out.insert("repo.categories".into(), to_object(categories));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySnapshotStore;
    use tempfile::TempDir;

    fn pipeline(tmp: &TempDir) -> Pipeline {
        Pipeline::new(
            Config::minimal(tmp.path()),
            Arc::new(InMemorySnapshotStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn vendor_ids_are_bounded() {
        assert_eq!(validate_vendor_id(" acme ").unwrap(), "acme");
        assert!(validate_vendor_id("").is_err());
        assert!(validate_vendor_id(&"x".repeat(65)).is_err());
        assert!(validate_vendor_id("a\nb").is_err());
    }

    #[test]
    fn clone_source_names_the_repo() {
        let project = ProjectId::parse("alpha").unwrap();
        let source = Source::Clone {
            url: "https://github.com/acme/widgets.git".into(),
            branch: None,
        };
        let repo = repo_summary(&project, &source, &[], &WorkPlan::default());
        assert_eq!(repo["repo.name"], json!("widgets"));
        assert_eq!(repo["repo.source"], json!("https://github.com/acme/widgets.git"));
        assert_eq!(repo["repo.file_count"], json!(0));
    }

    #[tokio::test]
    async fn missing_staging_root_fails_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let project = ProjectId::parse("ghost").unwrap();
        let err = p
            .process(&project, Source::Staged, None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::StagingMissing { .. }));
    }

    #[tokio::test]
    async fn empty_staging_is_refused() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let project = ProjectId::parse("empty").unwrap();
        std::fs::create_dir_all(p.staging().project_root(&project)).unwrap();
        let err = p
            .process(&project, Source::Staged, None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::Validation(ref m) if m.contains("no files")));
        assert_eq!(p.store().manifest(&project).await.unwrap().total_snapshots, 0);
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_project_are_refused() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let project = ProjectId::parse("alpha").unwrap();
        let _held = p.claim(&project).unwrap();
        let err = p
            .process(&project, Source::Staged, None, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::ProjectBusy(_)));
        assert!(matches!(p.clear_staging(&project), Err(SnapError::ProjectBusy(_))));
    }

    #[tokio::test]
    async fn claim_is_released_after_a_run() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let project = ProjectId::parse("alpha").unwrap();
        let _ = p
            .process(&project, Source::Staged, None, &CancelToken::new())
            .await;
        assert!(p.claim(&project).is_ok());
    }
}
