//! Project-scoped staging area.
//!
//! Each project owns `<staging.root>/<project_id>/`. Uploads land there after
//! filename validation; clone sources land in `<clones_dir>/<project_id>/`.
//! The pipeline only ever reads from these roots.

use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, SnapError};
use crate::models::{is_reserved_name, ProjectId};
use crate::router::IgnorePolicy;

static FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-][A-Za-z0-9._/-]{0,254}$").unwrap());

const FORBIDDEN_CHARS: &[char] = &['\0', '~', ':', '*', '?', '"', '<', '>', '|'];
const ALLOWED_DOTFILES: &[&str] = &[".gitignore", ".gitattributes"];

/// Content encoding of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Base64,
}

impl FromStr for Encoding {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "base64" => Ok(Encoding::Base64),
            other => Err(SnapError::Validation(format!(
                "unsupported encoding {:?}, expected utf-8 or base64",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedUpload {
    pub project_id: ProjectId,
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingEntry {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingInfo {
    pub project_id: ProjectId,
    pub exists: bool,
    pub file_count: u64,
    pub total_bytes: u64,
    pub files: Vec<StagingEntry>,
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    clones_dir: PathBuf,
    max_upload_bytes: u64,
    ignore: IgnorePolicy,
}

impl StagingArea {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.staging.root.clone(),
            clones_dir: config.staging.clones_dir(),
            max_upload_bytes: config.limits.max_code_file_bytes,
            ignore: IgnorePolicy::new(&config.staging.exclude_globs)?,
        })
    }

    pub fn project_root(&self, project: &ProjectId) -> PathBuf {
        self.root.join(project.as_str())
    }

    pub fn clone_root(&self, project: &ProjectId) -> PathBuf {
        self.clones_dir.join(project.as_str())
    }

    pub fn ignore_policy(&self) -> &IgnorePolicy {
        &self.ignore
    }

    /// Write one uploaded file into the project's staging root.
    pub fn stage_file(
        &self,
        project: &ProjectId,
        filename: &str,
        content: &str,
        encoding: Encoding,
    ) -> Result<StagedUpload> {
        let rel = validate_filename(filename, &self.ignore)?;

        let bytes = match encoding {
            Encoding::Utf8 => content.as_bytes().to_vec(),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(content.trim())
                .map_err(|e| SnapError::Validation(format!("invalid base64 content: {}", e)))?,
        };
        if bytes.len() as u64 > self.max_upload_bytes {
            return Err(SnapError::Validation(format!(
                "file {} is {} bytes, exceeds the {} byte upload limit",
                rel,
                bytes.len(),
                self.max_upload_bytes
            )));
        }

        let project_root = self.project_root(project);
        let target = project_root.join(&rel);
        if !target.starts_with(&project_root) {
            return Err(SnapError::Security(format!("path escapes staging root: {}", rel)));
        }
        reject_symlinked_ancestors(&self.root, &target)?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SnapError::io(parent, e))?;
        }
        // A concurrent writer could have planted a link between the check and here.
        reject_symlinked_ancestors(&self.root, &target)?;
        std::fs::write(&target, &bytes).map_err(|e| SnapError::io(&target, e))?;

        tracing::info!(project_id = %project, path = %rel, bytes = bytes.len(), "file staged");
        Ok(StagedUpload {
            project_id: project.clone(),
            path: rel,
            bytes: bytes.len() as u64,
        })
    }

    /// List regular files under the project's staging root. Links are skipped.
    pub fn staging_info(&self, project: &ProjectId) -> Result<StagingInfo> {
        let root = self.project_root(project);
        let mut info = StagingInfo {
            project_id: project.clone(),
            exists: root.is_dir(),
            file_count: 0,
            total_bytes: 0,
            files: Vec::new(),
        };
        if !info.exists {
            return Ok(info);
        }

        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&root).to_path_buf();
                SnapError::io(path, std::io::Error::other(e.to_string()))
            })?;
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                SnapError::io(entry.path(), std::io::Error::other(e.to_string()))
            })?;
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            info.file_count += 1;
            info.total_bytes += meta.len();
            info.files.push(StagingEntry {
                path: rel,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(info)
    }

    /// Remove the project's staged files. Returns how many were removed.
    pub fn clear(&self, project: &ProjectId) -> Result<u64> {
        let root = self.project_root(project);
        let removed = remove_tree(&root)?;
        tracing::info!(project_id = %project, removed, "staging cleared");
        Ok(removed)
    }

    /// Remove staged and cloned content for a project.
    pub fn purge(&self, project: &ProjectId) -> Result<u64> {
        let staged = remove_tree(&self.project_root(project))?;
        let cloned = remove_tree(&self.clone_root(project))?;
        Ok(staged + cloned)
    }
}

/// Count the entries under `root` (links included, never followed) and delete it.
fn remove_tree(root: &Path) -> Result<u64> {
    let meta = match std::fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SnapError::io(root, e)),
    };
    if meta.file_type().is_symlink() {
        return Err(SnapError::Security(format!(
            "refusing to clear symlinked root {}",
            root.display()
        )));
    }
    let count = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .count() as u64;
    std::fs::remove_dir_all(root).map_err(|e| SnapError::io(root, e))?;
    Ok(count)
}

fn reject_symlinked_ancestors(base: &Path, target: &Path) -> Result<()> {
    let rel = target.strip_prefix(base).map_err(|_| {
        SnapError::Security(format!("path escapes staging root: {}", target.display()))
    })?;
    let mut current = base.to_path_buf();
    for component in rel.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SnapError::Security(format!(
                    "symbolic link in staging path: {}",
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(SnapError::io(&current, e)),
        }
    }
    Ok(())
}

/// Normalise and check an upload filename. Returns the `/`-separated
/// relative path it will be staged under.
pub fn validate_filename(raw: &str, ignore: &IgnorePolicy) -> Result<String> {
    let normalised = raw.trim().replace('\\', "/");
    let name = normalised.trim_matches('/');
    let security = |why: &str| SnapError::Security(format!("filename {:?} rejected: {}", raw, why));

    if name.is_empty() {
        return Err(SnapError::Validation("filename is required".into()));
    }
    if name.contains("..") {
        return Err(security("contains '..'"));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(security(&format!("contains forbidden character {:?}", c)));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(security("empty path component"));
        }
        let stem = component.split('.').next().unwrap_or(component);
        if is_reserved_name(component) || (!stem.is_empty() && is_reserved_name(stem)) {
            return Err(security(&format!("reserved name {:?}", component)));
        }
        let hidden = component.starts_with('.') && !component[1..].contains('.');
        if hidden && !ALLOWED_DOTFILES.contains(&component) {
            return Err(security(&format!("hidden component {:?}", component)));
        }
    }
    if !FILENAME.is_match(name) {
        return Err(security("must match [A-Za-z0-9._-][A-Za-z0-9._/-]{0,254}"));
    }
    if ignore.is_ignored_file(name) {
        return Err(security("matches the credential and artifact ignore policy"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area(tmp: &TempDir) -> StagingArea {
        StagingArea::new(&Config::minimal(tmp.path())).unwrap()
    }

    fn pid(s: &str) -> ProjectId {
        ProjectId::parse(s).unwrap()
    }

    #[test]
    fn filenames_are_normalised() {
        let ignore = IgnorePolicy::new(&[]).unwrap();
        assert_eq!(validate_filename("src\\main.py", &ignore).unwrap(), "src/main.py");
        assert_eq!(validate_filename("/docs/a.md/", &ignore).unwrap(), "docs/a.md");
        assert_eq!(validate_filename(".gitignore", &ignore).unwrap(), ".gitignore");
        assert_eq!(
            validate_filename(".eslintrc.json", &ignore).unwrap(),
            ".eslintrc.json"
        );
    }

    #[test]
    fn dangerous_filenames_are_rejected() {
        let ignore = IgnorePolicy::new(&[]).unwrap();
        for bad in [
            "../etc/passwd",
            "a/../../b.py",
            "a\0b.py",
            "~/x.py",
            "c:/x.py",
            "a//b.py",
            "con",
            "aux.txt",
            "src/.git/config",
            ".env",
            "deploy/id_rsa",
            "keys/server.pem",
            "spaces are bad.py",
        ] {
            assert!(validate_filename(bad, &ignore).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn stage_and_inspect_files() {
        let tmp = TempDir::new().unwrap();
        let area = area(&tmp);
        let p = pid("alpha");
        area.stage_file(&p, "src/app.py", "print('hi')\n", Encoding::Utf8)
            .unwrap();
        let up = area
            .stage_file(&p, "data.csv", "YSxiCjEsMgo=", Encoding::Base64)
            .unwrap();
        assert_eq!(up.bytes, 8);
        assert_eq!(
            std::fs::read_to_string(area.project_root(&p).join("data.csv")).unwrap(),
            "a,b\n1,2\n"
        );

        let info = area.staging_info(&p).unwrap();
        assert!(info.exists);
        assert_eq!(info.file_count, 2);
        let paths: Vec<&str> = info.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["data.csv", "src/app.py"]);
        assert!(info.files[0].modified.is_some());
    }

    #[test]
    fn projects_are_kept_apart() {
        let tmp = TempDir::new().unwrap();
        let area = area(&tmp);
        area.stage_file(&pid("alpha"), "a.py", "x = 1\n", Encoding::Utf8)
            .unwrap();
        assert_eq!(area.staging_info(&pid("bravo")).unwrap().file_count, 0);
        assert!(!area.staging_info(&pid("bravo")).unwrap().exists);
    }

    #[test]
    fn oversized_and_bad_base64_uploads_are_refused() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.limits.max_code_file_bytes = 4;
        let area = StagingArea::new(&config).unwrap();
        let p = pid("alpha");
        assert!(matches!(
            area.stage_file(&p, "a.py", "too long", Encoding::Utf8),
            Err(SnapError::Validation(_))
        ));
        assert!(area.stage_file(&p, "a.py", "!!!", Encoding::Base64).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_written_through() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let area = area(&tmp);
        let p = pid("alpha");
        let root = area.project_root(&p);
        std::fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("linked")).unwrap();

        let err = area
            .stage_file(&p, "linked/evil.py", "x = 1\n", Encoding::Utf8)
            .unwrap_err();
        assert!(matches!(err, SnapError::Security(_)));
        assert!(!outside.path().join("evil.py").exists());
    }

    #[test]
    fn clear_counts_and_removes() {
        let tmp = TempDir::new().unwrap();
        let area = area(&tmp);
        let p = pid("alpha");
        for name in ["a.py", "b/c.md", "b/d.csv"] {
            area.stage_file(&p, name, "x\n", Encoding::Utf8).unwrap();
        }
        assert_eq!(area.clear(&p).unwrap(), 3);
        assert!(!area.project_root(&p).exists());
        assert_eq!(area.clear(&p).unwrap(), 0);
    }

    #[test]
    fn encoding_parses_loosely() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!(" base64 ".parse::<Encoding>().unwrap(), Encoding::Base64);
        assert!("latin1".parse::<Encoding>().is_err());
    }
}
