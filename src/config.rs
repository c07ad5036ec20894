use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub staging: StagingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    pub root: PathBuf,
    /// Where clone sources are checked out. Defaults to a `clones` sibling of `root`.
    #[serde(default)]
    pub clones_dir: Option<PathBuf>,
    /// Extra ignore globs on top of the built-in policy.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl StagingConfig {
    pub fn clones_dir(&self) -> PathBuf {
        match &self.clones_dir {
            Some(dir) => dir.clone(),
            None => self
                .root
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("clones"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_soft_cap_loc")]
    pub soft_cap_loc: u64,
    #[serde(default = "default_god_loc")]
    pub god_loc: u64,
    #[serde(default = "default_hard_cap_loc")]
    pub hard_cap_loc: u64,
    #[serde(default = "default_max_code_file_bytes")]
    pub max_code_file_bytes: u64,
    #[serde(default = "default_max_doc_file_bytes")]
    pub max_doc_file_bytes: u64,
    #[serde(default = "default_max_repo_bytes")]
    pub max_repo_bytes: u64,
    #[serde(default = "default_max_csv_file_bytes")]
    pub max_csv_file_bytes: u64,
    #[serde(default = "default_max_csv_rows")]
    pub max_csv_rows: u64,
    #[serde(default = "default_max_csv_cell_chars")]
    pub max_csv_cell_chars: usize,
    #[serde(default = "default_max_doc_chars")]
    pub max_doc_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            soft_cap_loc: default_soft_cap_loc(),
            god_loc: default_god_loc(),
            hard_cap_loc: default_hard_cap_loc(),
            max_code_file_bytes: default_max_code_file_bytes(),
            max_doc_file_bytes: default_max_doc_file_bytes(),
            max_repo_bytes: default_max_repo_bytes(),
            max_csv_file_bytes: default_max_csv_file_bytes(),
            max_csv_rows: default_max_csv_rows(),
            max_csv_cell_chars: default_max_csv_cell_chars(),
            max_doc_chars: default_max_doc_chars(),
        }
    }
}

fn default_soft_cap_loc() -> u64 {
    1500
}
fn default_god_loc() -> u64 {
    4000
}
fn default_hard_cap_loc() -> u64 {
    5000
}
fn default_max_code_file_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_max_doc_file_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_max_repo_bytes() -> u64 {
    500 * 1024 * 1024
}
fn default_max_csv_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_csv_rows() -> u64 {
    100_000
}
fn default_max_csv_cell_chars() -> usize {
    10_000
}
fn default_max_doc_chars() -> usize {
    200_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_parser_timeout_secs")]
    pub parser_timeout_secs: u64,
    /// Replacement for the embedded mapping table.
    #[serde(default)]
    pub mapping: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            parser_timeout_secs: default_parser_timeout_secs(),
            mapping: None,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_parser_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionConfig {
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_clone_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: default_allowed_hosts(),
            timeout_secs: default_clone_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["github.com".to_string()]
}
fn default_clone_timeout_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

impl Config {
    /// All-defaults configuration rooted at `data_dir`.
    pub fn minimal(data_dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: data_dir.join("snap.sqlite"),
            },
            staging: StagingConfig {
                root: data_dir.join("staging"),
                clones_dir: None,
                exclude_globs: Vec::new(),
            },
            limits: LimitsConfig::default(),
            pipeline: PipelineConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let limits = &config.limits;
    if !(limits.soft_cap_loc < limits.god_loc && limits.god_loc < limits.hard_cap_loc) {
        anyhow::bail!(
            "limits must satisfy soft_cap_loc < god_loc < hard_cap_loc (got {} / {} / {})",
            limits.soft_cap_loc,
            limits.god_loc,
            limits.hard_cap_loc
        );
    }

    let byte_caps = [
        ("max_code_file_bytes", limits.max_code_file_bytes),
        ("max_doc_file_bytes", limits.max_doc_file_bytes),
        ("max_repo_bytes", limits.max_repo_bytes),
        ("max_csv_file_bytes", limits.max_csv_file_bytes),
        ("max_csv_rows", limits.max_csv_rows),
    ];
    for (name, value) in byte_caps {
        if value == 0 {
            anyhow::bail!("limits.{} must be > 0", name);
        }
    }
    if limits.max_csv_cell_chars == 0 || limits.max_doc_chars == 0 {
        anyhow::bail!("limits.max_csv_cell_chars and limits.max_doc_chars must be > 0");
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if config.pipeline.parser_timeout_secs == 0 {
        anyhow::bail!("pipeline.parser_timeout_secs must be >= 1");
    }

    if config.acquisition.max_attempts == 0 {
        anyhow::bail!("acquisition.max_attempts must be >= 1");
    }
    if config.acquisition.allowed_hosts.is_empty() {
        anyhow::bail!("acquisition.allowed_hosts must name at least one host");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/snap.sqlite"

            [staging]
            root = "/tmp/snap/staging"
            "#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.limits.soft_cap_loc, 1500);
        assert_eq!(cfg.limits.god_loc, 4000);
        assert_eq!(cfg.limits.hard_cap_loc, 5000);
        assert_eq!(cfg.pipeline.workers, 4);
        assert_eq!(cfg.acquisition.allowed_hosts, vec!["github.com"]);
        assert_eq!(
            cfg.staging.clones_dir(),
            PathBuf::from("/tmp/snap/clones")
        );
    }

    #[test]
    fn thresholds_must_ascend() {
        let mut cfg = Config::minimal(Path::new("/tmp/x"));
        cfg.limits.god_loc = cfg.limits.soft_cap_loc;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = Config::minimal(Path::new("/tmp/x"));
        cfg.pipeline.workers = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = toml::from_str(include_str!("../config/snap.example.toml")).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.staging.exclude_globs.len(), 2);
        assert!(cfg.pipeline.mapping.is_none());
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
