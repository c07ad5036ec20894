//! Core data types shared by every pipeline stage.
//!
//! A [`ProjectId`] scopes everything. Staged files are described by
//! [`StagedFile`], parsers return a flat [`FieldMapping`], and the unit of
//! persistence is the [`SnapshotRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SnapError;

/// Flat namespaced parser output: dot-path keys (`code.functions[].name`) to values.
pub type FieldMapping = BTreeMap<String, serde_json::Value>;

/// Schema-validated fields of one snapshot record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

pub(crate) fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

/// Validated project identifier.
///
/// 3-64 characters from `[A-Za-z0-9_-]`, not starting with `-`, and not a
/// reserved device name. Every repository operation takes one, so an
/// unscoped query cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(raw: &str) -> Result<Self, SnapError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(SnapError::Validation("project_id is required".into()));
        }
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_chars || id.len() < 3 || id.len() > 64 {
            return Err(SnapError::Validation(format!(
                "invalid project_id: must be 3-64 alphanumeric characters, underscores, or hyphens, got {:?}",
                id
            )));
        }
        if id.starts_with('-') {
            return Err(SnapError::Validation(format!(
                "project_id cannot start with '-', got {:?}",
                id
            )));
        }
        if is_reserved_name(id) {
            return Err(SnapError::Validation(format!(
                "project_id cannot be a reserved name, got {:?}",
                id
            )));
        }
        Ok(ProjectId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectId::parse(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = SnapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProjectId::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

/// The four families the snapshot types are grouped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFamily {
    CodeStructure,
    CodeAnalysis,
    Document,
    Tabular,
}

/// One of the 14 canonical snapshot types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    FileMetadata,
    Imports,
    Exports,
    Functions,
    Classes,
    Connections,
    RepoMetadata,
    Security,
    Quality,
    DocMetadata,
    DocContent,
    DocAnalysis,
    CsvData,
    CsvSchema,
}

impl SnapshotType {
    pub const ALL: [SnapshotType; 14] = [
        SnapshotType::FileMetadata,
        SnapshotType::Imports,
        SnapshotType::Exports,
        SnapshotType::Functions,
        SnapshotType::Classes,
        SnapshotType::Connections,
        SnapshotType::RepoMetadata,
        SnapshotType::Security,
        SnapshotType::Quality,
        SnapshotType::DocMetadata,
        SnapshotType::DocContent,
        SnapshotType::DocAnalysis,
        SnapshotType::CsvData,
        SnapshotType::CsvSchema,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::FileMetadata => "file_metadata",
            SnapshotType::Imports => "imports",
            SnapshotType::Exports => "exports",
            SnapshotType::Functions => "functions",
            SnapshotType::Classes => "classes",
            SnapshotType::Connections => "connections",
            SnapshotType::RepoMetadata => "repo_metadata",
            SnapshotType::Security => "security",
            SnapshotType::Quality => "quality",
            SnapshotType::DocMetadata => "doc_metadata",
            SnapshotType::DocContent => "doc_content",
            SnapshotType::DocAnalysis => "doc_analysis",
            SnapshotType::CsvData => "csv_data",
            SnapshotType::CsvSchema => "csv_schema",
        }
    }

    pub fn family(&self) -> SnapshotFamily {
        match self {
            SnapshotType::FileMetadata
            | SnapshotType::Imports
            | SnapshotType::Exports
            | SnapshotType::Functions
            | SnapshotType::Classes
            | SnapshotType::Connections
            | SnapshotType::RepoMetadata => SnapshotFamily::CodeStructure,
            SnapshotType::Security | SnapshotType::Quality => SnapshotFamily::CodeAnalysis,
            SnapshotType::DocMetadata | SnapshotType::DocContent | SnapshotType::DocAnalysis => {
                SnapshotFamily::Document
            }
            SnapshotType::CsvData | SnapshotType::CsvSchema => SnapshotFamily::Tabular,
        }
    }

    /// Project-level types hold one record per project per run.
    pub fn is_project_level(&self) -> bool {
        matches!(self, SnapshotType::RepoMetadata)
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotType {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SnapshotType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| {
                let valid: Vec<&str> = SnapshotType::ALL.iter().map(|t| t.as_str()).collect();
                SnapError::Validation(format!(
                    "invalid snapshot_type {:?}, must be one of: {}",
                    s.trim(),
                    valid.join(", ")
                ))
            })
    }
}

/// Size-based classification of a staged file.
///
/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Normal,
    Large,
    PotentialGod,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Normal => "normal",
            Verdict::Large => "large",
            Verdict::PotentialGod => "potential_god",
            Verdict::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External parsing backend a file can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// AST-level structure: imports, exports, functions, classes, connections.
    Structural,
    /// Security and quality scanner.
    Analysis,
    /// Document text extraction.
    Document,
    /// Tabular data parser.
    Tabular,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Structural,
        Capability::Analysis,
        Capability::Document,
        Capability::Tabular,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Structural => "structural",
            Capability::Analysis => "analysis",
            Capability::Document => "document",
            Capability::Tabular => "tabular",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Kotlin,
    Swift,
    Shell,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Kotlin => "kotlin",
            Language::Swift => "swift",
            Language::Shell => "shell",
        }
    }

    /// Languages the structural parser has a grammar for.
    pub fn has_structural_grammar(&self) -> bool {
        matches!(
            self,
            Language::Python
                | Language::Rust
                | Language::JavaScript
                | Language::TypeScript
                | Language::Go
                | Language::Java
        )
    }

    /// Line-comment prefixes used by the quality scanner.
    pub fn comment_prefixes(&self) -> &'static [&'static str] {
        match self {
            Language::Python | Language::Ruby | Language::Shell => &["#"],
            Language::Php => &["//", "#", "/*", "*"],
            _ => &["//", "/*", "*"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocFormat {
    Markdown,
    PlainText,
    Rst,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl DocFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocFormat::Markdown => "markdown",
            DocFormat::PlainText => "text",
            DocFormat::Rst => "rst",
            DocFormat::Html => "html",
            DocFormat::Pdf => "pdf",
            DocFormat::Docx => "docx",
            DocFormat::Pptx => "pptx",
            DocFormat::Xlsx => "xlsx",
        }
    }

    /// Binary container formats that need text extraction.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            DocFormat::Pdf | DocFormat::Docx | DocFormat::Pptx | DocFormat::Xlsx
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabularFormat {
    Csv,
    Tsv,
}

/// What the router decided a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "format", rename_all = "snake_case")]
pub enum FileType {
    Code(Language),
    Document(DocFormat),
    Tabular(TabularFormat),
}

impl FileType {
    pub fn label(&self) -> &'static str {
        match self {
            FileType::Code(lang) => lang.as_str(),
            FileType::Document(fmt) => fmt.as_str(),
            FileType::Tabular(TabularFormat::Csv) => "csv",
            FileType::Tabular(TabularFormat::Tsv) => "tsv",
        }
    }
}

/// A regular file discovered under a project's staging root.
///
/// Read-only for the whole pipeline; adapters receive it by reference.
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Path relative to the staging root, `/`-separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub line_count: u64,
    pub file_type: FileType,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

/// The atomic persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub project_id: ProjectId,
    pub snapshot_type: SnapshotType,
    pub source_path: String,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
}

/// Optional narrowing for a project-scoped query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub snapshot_type: Option<SnapshotType>,
    pub source_path: Option<String>,
}

impl SnapshotFilter {
    pub fn by_type(snapshot_type: SnapshotType) -> Self {
        Self {
            snapshot_type: Some(snapshot_type),
            source_path: None,
        }
    }

    pub fn by_path(source_path: impl Into<String>) -> Self {
        Self {
            snapshot_type: None,
            source_path: Some(source_path.into()),
        }
    }

    pub fn matches(&self, record: &SnapshotRecord) -> bool {
        self.snapshot_type
            .map_or(true, |t| t == record.snapshot_type)
            && self
                .source_path
                .as_deref()
                .map_or(true, |p| p == record.source_path)
    }
}
