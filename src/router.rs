//! File routing: staged tree → ordered work plan.
//!
//! Walks a project's staging root without following links, drops anything
//! matched by the ignore policy, detects each file's type (extension first,
//! content sniffing when the extension is missing or ambiguous), assesses it
//! against the [`LimitPolicy`], and emits one [`WorkItem`] per
//! `(file, capability)` pair.
//!
//! The plan is sorted by `(path, capability)`, so the same tree always
//! yields the same plan.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{Result, SnapError};
use crate::limits::LimitPolicy;
use crate::models::{
    Capability, DocFormat, FileType, Language, StagedFile, TabularFormat, Verdict,
};

/// Bytes inspected when sniffing content.
const SNIFF_BYTES: usize = 8 * 1024;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "bower_components",
    "vendor",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".gradle",
    "dist",
    "build",
    "out",
    "coverage",
    ".next",
    ".cache",
    ".idea",
    ".vscode",
];

const IGNORED_FILES: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/*.pem",
    "**/*.key",
    "**/*.p12",
    "**/*.pfx",
    "**/*.jks",
    "**/*.keystore",
    "**/id_rsa",
    "**/id_rsa.*",
    "**/id_dsa*",
    "**/id_ecdsa*",
    "**/id_ed25519*",
    "**/.npmrc",
    "**/.pypirc",
    "**/.netrc",
    "**/.htpasswd",
    "**/credentials*",
    "**/secrets.*",
    "**/*.secret",
    "**/*.pyc",
    "**/*.class",
    "**/*.o",
    "**/*.so",
    "**/*.dll",
    "**/*.exe",
    "**/*.min.js",
    "**/.DS_Store",
];

/// Which paths never enter the pipeline: VCS, dependency, IDE and build
/// directories, plus credential-like and compiled-artifact filenames.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    dirs: GlobSet,
    files: GlobSet,
}

impl IgnorePolicy {
    pub fn new(extra_globs: &[String]) -> Result<Self> {
        let dir_patterns: Vec<String> = IGNORED_DIRS.iter().map(|d| format!("**/{}", d)).collect();
        let mut file_patterns: Vec<String> = IGNORED_FILES.iter().map(|p| p.to_string()).collect();
        file_patterns.extend(extra_globs.iter().cloned());
        Ok(Self {
            dirs: build_globset(&dir_patterns)?,
            files: build_globset(&file_patterns)?,
        })
    }

    pub fn is_ignored_dir(&self, rel_path: &str) -> bool {
        self.dirs.is_match(rel_path)
    }

    /// Matches the file itself or any ignored ancestor directory.
    pub fn is_ignored_file(&self, rel_path: &str) -> bool {
        if self.files.is_match(rel_path) {
            return true;
        }
        let mut prefix = String::new();
        for part in rel_path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if prefix.len() < rel_path.len() && self.dirs.is_match(&prefix) {
                return true;
            }
        }
        false
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SnapError::Validation(format!("bad glob {:?}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SnapError::Validation(format!("glob set: {}", e)))
}

/// An entry kept out of the pipeline entirely (security or ignore policy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub path: String,
    pub reason: String,
}

/// A regular file that no capability handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unrouted {
    pub path: String,
    pub reason: String,
}

/// One `(file, capability, verdict)` tuple of the work plan.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub file: Arc<StagedFile>,
    pub capability: Capability,
    pub verdict: Verdict,
    pub warnings: Vec<String>,
}

impl WorkItem {
    pub fn is_dispatchable(&self) -> bool {
        self.verdict != Verdict::Rejected
    }
}

/// All work items for a single file, in plan order.
#[derive(Debug, Clone)]
pub struct FileWork {
    pub file: Arc<StagedFile>,
    pub verdict: Verdict,
    pub warnings: Vec<String>,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    pub items: Vec<WorkItem>,
    pub unrouted: Vec<Unrouted>,
    pub excluded: Vec<Exclusion>,
    /// Sum of sizes of every regular file not excluded.
    pub total_bytes: u64,
}

impl WorkPlan {
    /// Group items by file, preserving plan order.
    pub fn files(&self) -> Vec<FileWork> {
        let mut out: Vec<FileWork> = Vec::new();
        for item in &self.items {
            match out.last_mut() {
                Some(last) if last.file.rel_path == item.file.rel_path => {
                    last.capabilities.push(item.capability);
                }
                _ => out.push(FileWork {
                    file: Arc::clone(&item.file),
                    verdict: item.verdict,
                    warnings: item.warnings.clone(),
                    capabilities: vec![item.capability],
                }),
            }
        }
        out
    }

    /// Files seen by routing: routed plus unrouted.
    pub fn files_seen(&self) -> usize {
        self.files().len() + self.unrouted.len()
    }
}

pub struct FileRouter {
    policy: LimitPolicy,
    ignore: IgnorePolicy,
}

impl FileRouter {
    pub fn new(policy: LimitPolicy, ignore: IgnorePolicy) -> Self {
        Self { policy, ignore }
    }

    pub fn plan(&self, root: &Path) -> Result<WorkPlan> {
        if !root.is_dir() {
            return Err(SnapError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "staging root is not a directory"),
            ));
        }

        let mut plan = WorkPlan::default();
        let mut walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|p| p.strip_prefix(root).ok())
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_default();
                    tracing::warn!(path = %path, error = %err, "unreadable staging entry");
                    plan.excluded.push(Exclusion {
                        path,
                        reason: format!("unreadable entry: {}", err),
                    });
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let rel_str = match relative_path_str(relative) {
                Ok(s) => s,
                Err(reason) => {
                    plan.excluded.push(Exclusion {
                        path: relative.to_string_lossy().to_string(),
                        reason,
                    });
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    continue;
                }
            };

            if entry.path_is_symlink() {
                tracing::warn!(path = %rel_str, "symbolic link rejected");
                plan.excluded.push(Exclusion {
                    path: rel_str,
                    reason: "symbolic link".to_string(),
                });
                continue;
            }

            if entry.file_type().is_dir() {
                if self.ignore.is_ignored_dir(&rel_str) {
                    tracing::debug!(path = %rel_str, "ignored directory");
                    plan.excluded.push(Exclusion {
                        path: rel_str,
                        reason: "ignored directory".to_string(),
                    });
                    walker.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                plan.excluded.push(Exclusion {
                    path: rel_str,
                    reason: "not a regular file".to_string(),
                });
                continue;
            }

            if self.ignore.is_ignored_file(&rel_str) {
                tracing::debug!(path = %rel_str, "ignored file");
                plan.excluded.push(Exclusion {
                    path: rel_str,
                    reason: "matches ignore policy".to_string(),
                });
                continue;
            }

            self.route_file(entry.path(), rel_str, &mut plan);
        }

        plan.items.sort_by(|a, b| {
            a.file
                .rel_path
                .cmp(&b.file.rel_path)
                .then(a.capability.cmp(&b.capability))
        });
        plan.unrouted.sort_by(|a, b| a.path.cmp(&b.path));
        plan.excluded.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(plan)
    }

    fn route_file(&self, path: &Path, rel_str: String, plan: &mut WorkPlan) {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) => return exclude_unreadable(plan, rel_str, &err),
        };

        let by_extension = detect_by_extension(path);

        // Oversized files are never read; they are rejected on size alone.
        if size > self.policy.max_file_bytes() {
            plan.total_bytes += size;
            match by_extension.and_then(|d| d.resolved()) {
                Some(file_type) => {
                    let assessment = self.policy.assess(file_type, size, 0);
                    let file = Arc::new(StagedFile {
                        rel_path: rel_str,
                        abs_path: path.to_path_buf(),
                        size,
                        line_count: 0,
                        file_type,
                        sha256: String::new(),
                    });
                    push_items(plan, file, assessment.verdict, assessment.warnings);
                }
                None => plan.unrouted.push(Unrouted {
                    path: rel_str,
                    reason: format!("{} bytes, too large to sniff", size),
                }),
            }
            return;
        }

        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(err) => return exclude_unreadable(plan, rel_str, &err),
        };
        plan.total_bytes += size;
        let head = &content[..content.len().min(SNIFF_BYTES)];

        let file_type = match by_extension {
            Some(Detection::Known(t)) => Some(t),
            Some(Detection::CFamilyHeader) => Some(FileType::Code(sniff_header(head))),
            None => sniff_content(head),
        };
        let file_type = match file_type {
            Some(t) => t,
            None => {
                plan.unrouted.push(Unrouted {
                    path: rel_str,
                    reason: "no parser capability for this file type".to_string(),
                });
                return;
            }
        };

        let is_binary_container =
            matches!(file_type, FileType::Document(fmt) if fmt.is_binary());
        if !is_binary_container && head.contains(&0u8) {
            plan.unrouted.push(Unrouted {
                path: rel_str,
                reason: "binary content".to_string(),
            });
            return;
        }

        let line_count = if is_binary_container {
            0
        } else {
            count_lines(&content)
        };
        let sha256 = format!("{:x}", Sha256::digest(&content));
        let assessment = self.policy.assess(file_type, size, line_count);

        let file = Arc::new(StagedFile {
            rel_path: rel_str,
            abs_path: path.to_path_buf(),
            size,
            line_count,
            file_type,
            sha256,
        });
        push_items(plan, file, assessment.verdict, assessment.warnings);
    }
}

fn exclude_unreadable(plan: &mut WorkPlan, path: String, err: &std::io::Error) {
    tracing::warn!(path = %path, error = %err, "unreadable staging entry");
    plan.excluded.push(Exclusion {
        path,
        reason: format!("unreadable entry: {}", err),
    });
}

fn push_items(plan: &mut WorkPlan, file: Arc<StagedFile>, verdict: Verdict, warnings: Vec<String>) {
    for capability in capabilities_for(file.file_type) {
        plan.items.push(WorkItem {
            file: Arc::clone(&file),
            capability,
            verdict,
            warnings: warnings.clone(),
        });
    }
}

/// Capabilities a file type routes to. Source files go to both the
/// structural parser (when a grammar exists) and the analysis scanner.
pub fn capabilities_for(file_type: FileType) -> Vec<Capability> {
    match file_type {
        FileType::Code(lang) if lang.has_structural_grammar() => {
            vec![Capability::Structural, Capability::Analysis]
        }
        FileType::Code(_) => vec![Capability::Analysis],
        FileType::Document(_) => vec![Capability::Document],
        FileType::Tabular(_) => vec![Capability::Tabular],
    }
}

fn relative_path_str(relative: &Path) -> std::result::Result<String, String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| "non-UTF-8 path".to_string())?;
                if part.contains('\0') {
                    return Err("null byte in path".to_string());
                }
                parts.push(part);
            }
            Component::ParentDir => return Err("path escapes staging root".to_string()),
            _ => return Err("unexpected path component".to_string()),
        }
    }
    Ok(parts.join("/"))
}

enum Detection {
    Known(FileType),
    /// `.h` could be C or C++; decided by content.
    CFamilyHeader,
}

impl Detection {
    fn resolved(&self) -> Option<FileType> {
        match self {
            Detection::Known(t) => Some(*t),
            Detection::CFamilyHeader => Some(FileType::Code(Language::C)),
        }
    }
}

fn detect_by_extension(path: &Path) -> Option<Detection> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let code = |lang| Some(Detection::Known(FileType::Code(lang)));
    let doc = |fmt| Some(Detection::Known(FileType::Document(fmt)));
    match ext.as_str() {
        "py" | "pyi" => code(Language::Python),
        "rs" => code(Language::Rust),
        "js" | "mjs" | "cjs" | "jsx" => code(Language::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => code(Language::TypeScript),
        "go" => code(Language::Go),
        "java" => code(Language::Java),
        "c" => code(Language::C),
        "h" => Some(Detection::CFamilyHeader),
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => code(Language::Cpp),
        "cs" => code(Language::CSharp),
        "rb" => code(Language::Ruby),
        "php" => code(Language::Php),
        "kt" | "kts" => code(Language::Kotlin),
        "swift" => code(Language::Swift),
        "sh" | "bash" | "zsh" => code(Language::Shell),
        "md" | "markdown" => doc(DocFormat::Markdown),
        "txt" => doc(DocFormat::PlainText),
        "rst" => doc(DocFormat::Rst),
        "html" | "htm" => doc(DocFormat::Html),
        "pdf" => doc(DocFormat::Pdf),
        "docx" => doc(DocFormat::Docx),
        "pptx" => doc(DocFormat::Pptx),
        "xlsx" => doc(DocFormat::Xlsx),
        "csv" => Some(Detection::Known(FileType::Tabular(TabularFormat::Csv))),
        "tsv" => Some(Detection::Known(FileType::Tabular(TabularFormat::Tsv))),
        _ => None,
    }
}

fn sniff_header(head: &[u8]) -> Language {
    let text = String::from_utf8_lossy(head);
    let cpp_markers = ["class ", "namespace ", "template<", "template <", "std::", "public:"];
    if cpp_markers.iter().any(|m| text.contains(m)) {
        Language::Cpp
    } else {
        Language::C
    }
}

/// Content sniffing for files without a recognised extension.
fn sniff_content(head: &[u8]) -> Option<FileType> {
    if head.starts_with(b"%PDF-") {
        return Some(FileType::Document(DocFormat::Pdf));
    }
    if !head.starts_with(b"#!") {
        return None;
    }
    let first_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    let shebang = String::from_utf8_lossy(first_line);
    let lang = if shebang.contains("python") {
        Language::Python
    } else if shebang.contains("node") || shebang.contains("deno") {
        Language::JavaScript
    } else if shebang.contains("ruby") {
        Language::Ruby
    } else if shebang.contains("php") {
        Language::Php
    } else if shebang.contains("sh") {
        Language::Shell
    } else {
        return None;
    };
    Some(FileType::Code(lang))
}

fn count_lines(content: &[u8]) -> u64 {
    if content.is_empty() {
        return 0;
    }
    let newlines = content.iter().filter(|b| **b == b'\n').count() as u64;
    if content.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}
