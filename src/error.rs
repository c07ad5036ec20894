//! Error taxonomy for the snapshot pipeline.
//!
//! Run-level failures surface as [`SnapError`]. Per-file parser failures are
//! not errors at this level: they are [`CapabilityFailure`](crate::adapters::CapabilityFailure)
//! values recorded in the processing manifest while the run continues.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapError>;

#[derive(Error, Debug)]
pub enum SnapError {
    /// Bad input rejected before any work begins (project id, snapshot type, encoding, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Staging contract violation: traversal, symlinks, forbidden filenames.
    #[error("security violation: {0}")]
    Security(String),

    /// A record or request crossed a project boundary.
    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    /// Store unavailable or a transaction failed. Fatal to a run.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("staging root missing for project '{project}': {}", .path.display())]
    StagingMissing { project: String, path: PathBuf },

    #[error("repository size {total} bytes exceeds max_repo_bytes ({max})")]
    RepositoryTooLarge { total: u64, max: u64 },

    #[error("project '{0}' already has a processing run in progress")]
    ProjectBusy(String),

    #[error("run cancelled for project '{0}'")]
    Cancelled(String),

    /// Clone acquisition failed after the retry budget was spent.
    #[error("acquisition failed for {url}: {reason}")]
    Acquisition { url: String, reason: String },

    /// The declarative mapping table is malformed or inconsistent with the schemas.
    #[error("invalid mapping table: {0}")]
    Mapping(String),

    #[error("I/O error for path {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts a processing run (as opposed to input rejection).
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SnapError::Persistence(_)
                | SnapError::StagingMissing { .. }
                | SnapError::RepositoryTooLarge { .. }
                | SnapError::Acquisition { .. }
                | SnapError::Io { .. }
        )
    }
}

impl From<sqlx::Error> for SnapError {
    fn from(err: sqlx::Error) -> Self {
        SnapError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Persistence(format!("field encoding: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_is_run_fatal_but_validation_is_not() {
        assert!(SnapError::Persistence("down".into()).is_run_fatal());
        assert!(!SnapError::Validation("bad id".into()).is_run_fatal());
        assert!(!SnapError::IsolationViolation("x".into()).is_run_fatal());
    }

    #[test]
    fn staging_missing_message_names_project() {
        let err = SnapError::StagingMissing {
            project: "demo".into(),
            path: PathBuf::from("/tmp/staging/demo"),
        };
        let msg = err.to_string();
        assert!(msg.contains("demo"));
        assert!(msg.contains("/tmp/staging/demo"));
    }
}
