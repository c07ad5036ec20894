//! Clone acquisition for remote repository sources.
//!
//! A clone URL must be `https://`, point at an allow-listed host, and name an
//! owner and a repository. The checkout is a shallow `git clone` run as a
//! subprocess into `<clones_dir>/<project_id>`, bounded by a per-attempt
//! timeout and retried under a [`RetryPolicy`].

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

use crate::config::AcquisitionConfig;
use crate::error::{Result, SnapError};
use crate::models::ProjectId;
use crate::pipeline::CancelToken;

static CLONE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://([A-Za-z0-9.-]+)/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$")
        .unwrap()
});

static BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/-]{1,100}$").unwrap());

/// A clone URL that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    pub url: String,
    pub host: String,
    pub owner: String,
    pub repo: String,
}

pub fn validate_clone_url(raw: &str, allowed_hosts: &[String]) -> Result<RepoUrl> {
    let url = raw.trim();
    let caps = CLONE_URL.captures(url).ok_or_else(|| {
        SnapError::Validation(format!(
            "clone url must look like https://<host>/<owner>/<repo>, got {:?}",
            url
        ))
    })?;
    let host = caps[1].to_ascii_lowercase();
    if !allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)) {
        return Err(SnapError::Validation(format!(
            "host '{}' is not allowed (allowed: {})",
            host,
            allowed_hosts.join(", ")
        )));
    }
    let (owner, repo) = (caps[2].to_string(), caps[3].to_string());
    if [&owner, &repo].iter().any(|s| s.starts_with('.') || s.contains("..")) {
        return Err(SnapError::Validation(format!("invalid repository path in {:?}", url)));
    }
    Ok(RepoUrl {
        url: url.to_string(),
        host,
        owner,
        repo,
    })
}

pub fn validate_branch(branch: &str) -> Result<()> {
    if !BRANCH.is_match(branch) || branch.starts_with('-') || branch.contains("..") {
        return Err(SnapError::Validation(format!("invalid branch name {:?}", branch)));
    }
    Ok(())
}

/// Where the retry loop stands after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempt(u32),
    Backoff { next_attempt: u32, delay: Duration },
    GiveUp,
}

/// Bounded attempts with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn start(&self) -> RetryState {
        RetryState::Attempt(1)
    }

    /// Transition after `attempt` failed.
    pub fn on_failure(&self, attempt: u32) -> RetryState {
        if attempt >= self.max_attempts {
            return RetryState::GiveUp;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        RetryState::Backoff {
            next_attempt: attempt + 1,
            delay: self.base_backoff.saturating_mul(factor),
        }
    }
}

pub struct Acquirer {
    allowed_hosts: Vec<String>,
    attempt_timeout: Duration,
    retry: RetryPolicy,
    program: String,
}

impl Acquirer {
    pub fn new(config: &AcquisitionConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_backoff: Duration::from_millis(config.backoff_ms),
            },
            program: "git".to_string(),
        }
    }

    /// Use a different `git` executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Clone `url` into `dest`, replacing whatever was there. Returns `dest`.
    pub async fn acquire(
        &self,
        project: &ProjectId,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        let repo = validate_clone_url(url, &self.allowed_hosts)?;
        if let Some(b) = branch {
            validate_branch(b)?;
        }

        let mut state = self.retry.start();
        let mut last_error = String::new();
        loop {
            match state {
                RetryState::Attempt(attempt) => {
                    if cancel.is_cancelled() {
                        return Err(SnapError::Cancelled(project.to_string()));
                    }
                    remove_partial(dest)?;
                    tracing::info!(
                        project_id = %project,
                        url = %repo.url,
                        attempt,
                        "cloning repository"
                    );
                    match self.clone_once(&repo.url, branch, dest).await {
                        Ok(()) => return Ok(dest.to_path_buf()),
                        Err(reason) => {
                            tracing::warn!(
                                project_id = %project,
                                url = %repo.url,
                                attempt,
                                error = %reason,
                                "clone attempt failed"
                            );
                            last_error = reason;
                            state = self.retry.on_failure(attempt);
                        }
                    }
                }
                RetryState::Backoff {
                    next_attempt,
                    delay,
                } => {
                    tokio::time::sleep(delay).await;
                    state = RetryState::Attempt(next_attempt);
                }
                RetryState::GiveUp => {
                    remove_partial(dest)?;
                    return Err(SnapError::Acquisition {
                        url: repo.url,
                        reason: format!(
                            "{} attempt(s) failed, last error: {}",
                            self.retry.max_attempts, last_error
                        ),
                    });
                }
            }
        }
    }

    async fn clone_once(
        &self,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
    ) -> std::result::Result<(), String> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(b) = branch {
            cmd.args(["--branch", b]);
        }
        cmd.arg("--").arg(url).arg(dest);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.attempt_timeout, cmd.output())
            .await
            .map_err(|_| format!("timed out after {}s", self.attempt_timeout.as_secs()))?
            .map_err(|e| format!("failed to run '{}': {}", self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("git clone failed: {}", stderr.trim()));
        }
        Ok(())
    }
}

fn remove_partial(dest: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => Err(SnapError::Security(format!(
            "clone destination is a symbolic link: {}",
            dest.display()
        ))),
        Ok(_) => std::fs::remove_dir_all(dest).map_err(|e| SnapError::io(dest, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SnapError::io(dest, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["github.com".to_string()]
    }

    #[test]
    fn accepts_github_urls() {
        let r = validate_clone_url("https://github.com/rust-lang/regex.git", &hosts()).unwrap();
        assert_eq!(r.owner, "rust-lang");
        assert_eq!(r.repo, "regex");
        let r = validate_clone_url("https://GitHub.com/a/b/", &hosts()).unwrap();
        assert_eq!(r.host, "github.com");
        assert_eq!(r.repo, "b");
    }

    #[test]
    fn rejects_other_hosts_and_shapes() {
        for bad in [
            "http://github.com/a/b",
            "https://gitlab.com/a/b",
            "https://github.com/a",
            "https://github.com/a/b/c",
            "https://user@github.com/a/b",
            "https://github.com:8443/a/b",
            "git@github.com:a/b.git",
            "https://github.com/../b",
            "file:///etc",
        ] {
            assert!(validate_clone_url(bad, &hosts()).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn branch_names() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("release/1.2").is_ok());
        assert!(validate_branch("--upload-pack=x").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("").is_err());
    }

    #[test]
    fn retry_state_machine_backs_off_then_gives_up() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.start(), RetryState::Attempt(1));
        assert_eq!(
            policy.on_failure(1),
            RetryState::Backoff {
                next_attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.on_failure(2),
            RetryState::Backoff {
                next_attempt: 3,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.on_failure(3), RetryState::GiveUp);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_as_acquisition_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = AcquisitionConfig {
            max_attempts: 2,
            backoff_ms: 1,
            ..AcquisitionConfig::default()
        };
        let acquirer = Acquirer::new(&config).with_program("/nonexistent/snap-test-git");
        let project = ProjectId::parse("alpha").unwrap();
        let dest = tmp.path().join("clones").join("alpha");
        let err = acquirer
            .acquire(
                &project,
                "https://github.com/a/b",
                None,
                &dest,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            SnapError::Acquisition { url, reason } => {
                assert_eq!(url, "https://github.com/a/b");
                assert!(reason.starts_with("2 attempt(s) failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn disallowed_url_never_spawns() {
        let acquirer = Acquirer::new(&AcquisitionConfig::default());
        let project = ProjectId::parse("alpha").unwrap();
        let err = acquirer
            .acquire(
                &project,
                "https://evil.example/a/b",
                None,
                Path::new("/nonexistent"),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::Validation(_)));
    }
}
