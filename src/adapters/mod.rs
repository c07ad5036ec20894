//! Parser capabilities behind a single `invoke` interface.
//!
//! The orchestrator only ever talks to [`ParserAdapter`] trait objects held
//! in an [`AdapterRegistry`]. Four built-in backends cover the closed set of
//! [`Capability`] variants:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   AdapterRegistry                    │
//! │ ┌────────────┐ ┌──────────┐ ┌──────────┐ ┌─────────┐ │
//! │ │ structural │ │ analysis │ │ document │ │ tabular │ │
//! │ │ code.*     │ │ analysis.│ │ doc.*    │ │ csv.*   │ │
//! │ └────────────┘ └──────────┘ └──────────┘ └─────────┘ │
//! └──────────────────────────┬───────────────────────────┘
//!                            ▼
//!              FieldMapping | CapabilityFailure
//! ```
//!
//! Adapters never write to the staging area and never panic outward: every
//! problem comes back as a [`CapabilityFailure`].

pub mod analysis;
pub mod document;
pub mod structural;
pub mod tabular;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::limits::LimitPolicy;
use crate::models::{Capability, FieldMapping, StagedFile};

// ═══════════════════════════════════════════════════════════════════════
// Failure values
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unsupported,
    ParseError,
    Timeout,
    ResourceExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unsupported => "unsupported",
            FailureKind::ParseError => "parse_error",
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExceeded => "resource_exceeded",
        }
    }
}

/// Typed failure scoped to one file and one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unsupported, message)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseError, message)
    }

    pub fn resource_exceeded(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ResourceExceeded, message)
    }
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

pub type InvokeResult = Result<FieldMapping, CapabilityFailure>;

// ═══════════════════════════════════════════════════════════════════════
// Adapter trait
// ═══════════════════════════════════════════════════════════════════════

/// A parsing backend.
///
/// Implementations read the staged file (never modify it) and return a flat
/// namespaced field mapping. They are treated as pure functions by the
/// orchestrator: no adapter depends on another adapter's output.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use snapshot_harness::adapters::{InvokeResult, ParserAdapter};
/// use snapshot_harness::models::{Capability, FieldMapping, StagedFile};
///
/// struct LineCounter;
///
/// #[async_trait]
/// impl ParserAdapter for LineCounter {
///     fn name(&self) -> &str { "line-counter" }
///
///     async fn invoke(&self, file: &StagedFile, _capability: Capability) -> InvokeResult {
///         let mut out = FieldMapping::new();
///         out.insert("analysis.quality.loc".into(), file.line_count.into());
///         Ok(out)
///     }
/// }
/// ```
#[async_trait]
pub trait ParserAdapter: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Parse `file` for `capability`.
    async fn invoke(&self, file: &StagedFile, capability: Capability) -> InvokeResult;
}

/// Invoke with a deadline. Elapsed deadlines become `timeout` failures.
///
/// Blocking work already handed to the runtime's blocking pool is not
/// interrupted; its result is discarded.
pub async fn invoke_with_timeout(
    adapter: &dyn ParserAdapter,
    file: &StagedFile,
    capability: Capability,
    timeout: Duration,
) -> InvokeResult {
    match tokio::time::timeout(timeout, adapter.invoke(file, capability)).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityFailure::new(
            FailureKind::Timeout,
            format!(
                "{} did not finish within {}s",
                adapter.name(),
                timeout.as_secs_f64()
            ),
        )),
    }
}

/// Run synchronous parser work on the blocking pool, reading the file first.
pub(crate) async fn run_blocking<F>(file: &StagedFile, parse: F) -> InvokeResult
where
    F: FnOnce(&StagedFile, Vec<u8>) -> InvokeResult + Send + 'static,
{
    let file = file.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&file.abs_path).map_err(|e| {
            CapabilityFailure::parse_error(format!("cannot read {}: {}", file.rel_path, e))
        })?;
        parse(&file, bytes)
    });
    match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(CapabilityFailure::parse_error(format!(
            "parser task aborted: {}",
            join_err
        ))),
    }
}

/// Column-oriented builder for repeated records.
///
/// Rows pushed under prefix `code.functions` with columns `name, line`
/// become the keys `code.functions[].name` and `code.functions[].line`, each
/// holding one array entry per row. Columns are always emitted, so an empty
/// set still marks the namespace as present.
pub(crate) struct Rows {
    prefix: &'static str,
    columns: Vec<(&'static str, Vec<serde_json::Value>)>,
}

impl Rows {
    pub(crate) fn new(prefix: &'static str, names: &[&'static str]) -> Self {
        Self {
            prefix,
            columns: names.iter().map(|n| (*n, Vec::new())).collect(),
        }
    }

    /// Append one row; values are given in column order.
    pub(crate) fn push(&mut self, values: Vec<serde_json::Value>) {
        debug_assert_eq!(values.len(), self.columns.len());
        for ((_, column), value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
    }

    pub(crate) fn write_into(self, out: &mut FieldMapping) {
        for (name, column) in self.columns {
            out.insert(
                format!("{}[].{}", self.prefix, name),
                serde_json::Value::Array(column),
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Capability → adapter lookup.
///
/// Use [`AdapterRegistry::builtin`] for the stock backends and
/// [`register`](AdapterRegistry::register) to replace any of them.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Capability, Arc<dyn ParserAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin(policy: &LimitPolicy) -> Self {
        let mut registry = Self::new();
        registry.register(Capability::Structural, Arc::new(structural::StructuralParser));
        registry.register(Capability::Analysis, Arc::new(analysis::AnalysisScanner));
        registry.register(
            Capability::Document,
            Arc::new(document::DocumentExtractor::new(
                policy.limits().max_doc_chars,
            )),
        );
        registry.register(
            Capability::Tabular,
            Arc::new(tabular::TabularParser::new(policy.clone())),
        );
        registry
    }

    /// Register (or replace) the adapter for a capability.
    pub fn register(&mut self, capability: Capability, adapter: Arc<dyn ParserAdapter>) {
        self.adapters.insert(capability, adapter);
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn ParserAdapter>> {
        self.adapters.get(&capability).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
