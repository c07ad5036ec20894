//! Field Mapper: projects namespaced parser output onto the 14 snapshot types.
//!
//! The projection is data, not code. A [`MappingTable`] is loaded from TOML
//! (the built-in table ships in `mapping/default.toml`) and validated once at
//! load time against the type schemas. After that, [`MappingTable::project`]
//! is a pure function: the same input always yields the same candidates in
//! the same order.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, SnapError};
use crate::models::{FieldMapping, Fields, SnapshotFamily, SnapshotType, StagedFile, Verdict};

const BUILTIN_TABLE: &str = include_str!("../mapping/default.toml");

/// Top-level namespaces the parsers and the orchestrator emit.
const KNOWN_ROOTS: &[&str] = &["code", "analysis", "doc", "csv", "repo"];

// ═══════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    /// Fill value for a missing optional field.
    pub fn default_value(&self) -> Value {
        match self {
            FieldKind::Array => json!([]),
            FieldKind::Integer => json!(0),
            FieldKind::Number => json!(0.0),
            FieldKind::Boolean => json!(false),
            FieldKind::String | FieldKind::Object | FieldKind::Any => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct TypeSchema {
    pub family: SnapshotFamily,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl TypeSchema {
    /// Presence and type check. Returns one message per problem.
    pub fn check(&self, fields: &Fields) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, spec) in &self.fields {
            match fields.get(name) {
                None | Some(Value::Null) if spec.required => {
                    problems.push(format!("missing required field {:?}", name))
                }
                None | Some(Value::Null) => {}
                Some(v) if !spec.kind.accepts(v) => problems.push(format!(
                    "field {:?} should be {}, got {}",
                    name,
                    spec.kind.as_str(),
                    json_type(v)
                )),
                Some(_) => {}
            }
        }
        for name in fields.keys() {
            if !self.fields.contains_key(name) {
                problems.push(format!("unknown field {:?}", name));
            }
        }
        problems
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    SourcePath,
    Category,
    ContentHash,
    Language,
    Bytes,
    LineCount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Projection {
    Copy {
        from: String,
        to: String,
    },
    Count {
        from: String,
        to: String,
    },
    Zip {
        from: BTreeMap<String, String>,
        to: String,
    },
    Context {
        field: ContextField,
        to: String,
    },
    Const {
        value: Value,
        to: String,
    },
}

impl Projection {
    fn target(&self) -> &str {
        match self {
            Projection::Copy { to, .. }
            | Projection::Count { to, .. }
            | Projection::Zip { to, .. }
            | Projection::Context { to, .. }
            | Projection::Const { to, .. } => to,
        }
    }

    fn sources(&self) -> Vec<&str> {
        match self {
            Projection::Copy { from, .. } | Projection::Count { from, .. } => vec![from.as_str()],
            Projection::Zip { from, .. } => from.values().map(String::as_str).collect(),
            Projection::Context { .. } | Projection::Const { .. } => Vec::new(),
        }
    }

    fn apply(&self, input: &FieldMapping, ctx: &FileContext) -> Option<Value> {
        match self {
            Projection::Copy { from, .. } => input.get(from).filter(|v| !v.is_null()).cloned(),
            Projection::Count { from, .. } => match input.get(from)? {
                Value::Array(items) => Some(json!(items.len())),
                Value::Null => None,
                _ => Some(json!(1)),
            },
            Projection::Zip { from, .. } => {
                let columns: Vec<(&String, &Vec<Value>)> = from
                    .iter()
                    .filter_map(|(field, key)| match input.get(key) {
                        Some(Value::Array(values)) => Some((field, values)),
                        _ => None,
                    })
                    .collect();
                if columns.is_empty() {
                    return None;
                }
                let rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
                let zipped: Vec<Value> = (0..rows)
                    .map(|i| {
                        let row: serde_json::Map<String, Value> = columns
                            .iter()
                            .map(|(field, values)| {
                                ((*field).clone(), values.get(i).cloned().unwrap_or(Value::Null))
                            })
                            .collect();
                        Value::Object(row)
                    })
                    .collect();
                Some(Value::Array(zipped))
            }
            Projection::Context { field, .. } => Some(ctx.value(*field)),
            Projection::Const { value, .. } => Some(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingRule {
    pub namespace: String,
    pub target: String,
    pub projections: Vec<Projection>,
}

impl MappingRule {
    fn fires_on(&self, input: &FieldMapping) -> bool {
        let ns = self.namespace.as_str();
        input
            .range(ns.to_string()..)
            .take_while(|(k, _)| k.starts_with(ns))
            .any(|(k, _)| {
                let rest = &k[ns.len()..];
                rest.is_empty() || rest.starts_with('.') || rest.starts_with('[')
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Mapper input / output
// ═══════════════════════════════════════════════════════════════════════

/// File-level facts available to `context` projections.
#[derive(Debug, Clone)]
pub struct FileContext {
    pub source_path: String,
    pub category: Verdict,
    pub content_hash: String,
    pub language: String,
    pub bytes: u64,
    pub line_count: u64,
}

impl FileContext {
    pub fn for_file(file: &StagedFile, category: Verdict) -> Self {
        Self {
            source_path: file.rel_path.clone(),
            category,
            content_hash: file.sha256.clone(),
            language: file.file_type.label().to_string(),
            bytes: file.size,
            line_count: file.line_count,
        }
    }

    /// Context for project-level records such as `repo_metadata`.
    pub fn project_level() -> Self {
        Self {
            source_path: ".".to_string(),
            category: Verdict::Normal,
            content_hash: String::new(),
            language: String::new(),
            bytes: 0,
            line_count: 0,
        }
    }

    fn value(&self, field: ContextField) -> Value {
        match field {
            ContextField::SourcePath => json!(self.source_path),
            ContextField::Category => json!(self.category.as_str()),
            ContextField::ContentHash => json!(self.content_hash),
            ContextField::Language => json!(self.language),
            ContextField::Bytes => json!(self.bytes),
            ContextField::LineCount => json!(self.line_count),
        }
    }
}

/// A projected, default-filled record awaiting identity assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub snapshot_type: SnapshotType,
    pub source_path: String,
    pub fields: Fields,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MapOutcome {
    pub candidates: Vec<Candidate>,
    /// One entry per dropped candidate.
    pub warnings: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Table
// ═══════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct RawTypeSchema {
    family: SnapshotFamily,
    #[serde(default)]
    fields: BTreeMap<String, FieldSpec>,
}

#[derive(Deserialize)]
struct RawTable {
    types: BTreeMap<String, RawTypeSchema>,
    #[serde(default)]
    rules: Vec<MappingRule>,
}

#[derive(Debug, Clone)]
pub struct MappingTable {
    types: BTreeMap<SnapshotType, TypeSchema>,
    rules: Vec<(SnapshotType, MappingRule)>,
}

impl MappingTable {
    /// The table embedded at build time.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_TABLE)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SnapError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Table from config: `[pipeline] mapping` when set, built-in otherwise.
    pub fn from_config(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(text)
            .map_err(|e| SnapError::Mapping(format!("TOML: {}", e)))?;

        let mut types = BTreeMap::new();
        for (name, schema) in raw.types {
            let t = SnapshotType::from_str(&name)
                .map_err(|_| SnapError::Mapping(format!("unknown snapshot type {:?}", name)))?;
            if schema.family != t.family() {
                return Err(SnapError::Mapping(format!(
                    "type {} declared in family {:?}, expected {:?}",
                    t,
                    schema.family,
                    t.family()
                )));
            }
            if schema.fields.is_empty() {
                return Err(SnapError::Mapping(format!("type {} has no fields", t)));
            }
            types.insert(
                t,
                TypeSchema {
                    family: schema.family,
                    fields: schema.fields,
                },
            );
        }
        for t in SnapshotType::ALL {
            if !types.contains_key(&t) {
                return Err(SnapError::Mapping(format!("missing schema for type {}", t)));
            }
        }

        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in raw.rules {
            let target = SnapshotType::from_str(&rule.target).map_err(|_| {
                SnapError::Mapping(format!(
                    "rule {:?} targets unknown type {:?}",
                    rule.namespace, rule.target
                ))
            })?;
            validate_rule(&rule, target, &types[&target])?;
            rules.push((target, rule));
        }
        for t in SnapshotType::ALL {
            if !rules.iter().any(|(target, _)| *target == t) {
                return Err(SnapError::Mapping(format!("no rule produces type {}", t)));
            }
        }

        Ok(Self { types, rules })
    }

    pub fn schema(&self, snapshot_type: SnapshotType) -> Option<&TypeSchema> {
        self.types.get(&snapshot_type)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Project one file's merged parser output into candidate records.
    ///
    /// Rules targeting the same type merge into one candidate; the first rule
    /// to set a field wins. Missing optional fields get their kind's default;
    /// a candidate missing a required field is dropped with one warning.
    pub fn project(&self, input: &FieldMapping, ctx: &FileContext) -> MapOutcome {
        let mut drafts: BTreeMap<SnapshotType, Fields> = BTreeMap::new();
        for (target, rule) in &self.rules {
            if !rule.fires_on(input) {
                continue;
            }
            let draft = drafts.entry(*target).or_default();
            for projection in &rule.projections {
                if draft.contains_key(projection.target()) {
                    continue;
                }
                if let Some(value) = projection.apply(input, ctx) {
                    draft.insert(projection.target().to_string(), value);
                }
            }
        }

        let mut outcome = MapOutcome::default();
        for (snapshot_type, mut fields) in drafts {
            let schema = &self.types[&snapshot_type];
            let missing: Vec<&str> = schema
                .fields
                .iter()
                .filter(|(name, spec)| spec.required && !fields.contains_key(*name))
                .map(|(name, _)| name.as_str())
                .collect();
            if !missing.is_empty() {
                outcome.warnings.push(format!(
                    "{}: dropped {} record, missing required field(s): {}",
                    ctx.source_path,
                    snapshot_type,
                    missing.join(", ")
                ));
                continue;
            }
            for (name, spec) in &schema.fields {
                if !fields.contains_key(name) {
                    fields.insert(name.clone(), spec.kind.default_value());
                }
            }
            outcome.candidates.push(Candidate {
                snapshot_type,
                source_path: ctx.source_path.clone(),
                fields,
            });
        }
        outcome
    }
}

fn validate_rule(rule: &MappingRule, target: SnapshotType, schema: &TypeSchema) -> Result<()> {
    let ns = rule.namespace.as_str();
    let root = ns.split('.').next().unwrap_or_default();
    if !KNOWN_ROOTS.contains(&root) {
        return Err(SnapError::Mapping(format!(
            "rule namespace {:?} is outside the known roots ({})",
            ns,
            KNOWN_ROOTS.join(", ")
        )));
    }
    if rule.projections.is_empty() {
        return Err(SnapError::Mapping(format!("rule {:?} has no projections", ns)));
    }
    for projection in &rule.projections {
        let to = projection.target();
        let Some(spec) = schema.fields.get(to) else {
            return Err(SnapError::Mapping(format!(
                "rule {:?} writes {:?}, which is not a field of {}",
                ns, to, target
            )));
        };
        for source in projection.sources() {
            let rest = source.strip_prefix(ns).unwrap_or("!");
            if !(rest.starts_with('.') || rest.starts_with('[')) {
                return Err(SnapError::Mapping(format!(
                    "rule {:?} reads {:?} from outside its namespace",
                    ns, source
                )));
            }
        }
        let compatible = match projection {
            Projection::Count { .. } => {
                matches!(spec.kind, FieldKind::Integer | FieldKind::Number | FieldKind::Any)
            }
            Projection::Zip { .. } => matches!(spec.kind, FieldKind::Array | FieldKind::Any),
            Projection::Const { value, .. } => spec.kind.accepts(value),
            _ => true,
        };
        if !compatible {
            return Err(SnapError::Mapping(format!(
                "rule {:?} projection into {}.{} does not fit a {} field",
                ns,
                target,
                to,
                spec.kind.as_str()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::structural::parse_source;
    use crate::models::Language;

    fn ctx(path: &str) -> FileContext {
        FileContext {
            source_path: path.into(),
            category: Verdict::Normal,
            content_hash: "abc".into(),
            language: "python".into(),
            bytes: 42,
            line_count: 3,
        }
    }

    fn types_of(outcome: &MapOutcome) -> Vec<SnapshotType> {
        outcome.candidates.iter().map(|c| c.snapshot_type).collect()
    }

    #[test]
    fn builtin_table_is_valid() {
        let table = MappingTable::builtin().unwrap();
        for t in SnapshotType::ALL {
            assert!(table.schema(t).is_some());
        }
        assert!(table.rule_count() >= 14);
    }

    #[test]
    fn structural_output_yields_one_candidate_per_type() {
        let table = MappingTable::builtin().unwrap();
        let src = "import os\n\ndef run(a):\n    pass\n";
        let input = parse_source("app.py", Language::Python, src).unwrap();
        let outcome = table.project(&input, &ctx("app.py"));
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        assert_eq!(
            types_of(&outcome),
            vec![
                SnapshotType::FileMetadata,
                SnapshotType::Imports,
                SnapshotType::Exports,
                SnapshotType::Functions,
                SnapshotType::Classes,
                SnapshotType::Connections,
            ]
        );
        let functions = &outcome.candidates[3].fields;
        assert_eq!(functions["function_count"], json!(1));
        assert_eq!(functions["functions"][0]["name"], json!("run"));
        assert_eq!(functions["functions"][0]["params"], json!(1));
        let meta = &outcome.candidates[0].fields;
        assert_eq!(meta["path"], json!("app.py"));
        assert_eq!(meta["category"], json!("normal"));
        assert_eq!(meta["content_hash"], json!("abc"));
    }

    #[test]
    fn projection_is_deterministic() {
        let table = MappingTable::builtin().unwrap();
        let input = parse_source("m.rs", Language::Rust, "pub fn a() {}\nfn b(x: u8) {}\n").unwrap();
        let first = table.project(&input, &ctx("m.rs"));
        let second = table.project(&input, &ctx("m.rs"));
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.candidates[3].fields).unwrap(),
            serde_json::to_string(&second.candidates[3].fields).unwrap()
        );
    }

    #[test]
    fn missing_required_field_drops_with_exactly_one_warning() {
        let table = MappingTable::builtin().unwrap();
        let mut input = FieldMapping::new();
        input.insert("doc.metadata.format".into(), json!("markdown"));
        let outcome = table.project(&input, &ctx("README.md"));
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("doc_metadata"));
        assert!(outcome.warnings[0].contains("title"));
        assert!(outcome.warnings[0].contains("bytes"));
    }

    #[test]
    fn optional_fields_get_defaults() {
        let table = MappingTable::builtin().unwrap();
        let mut input = FieldMapping::new();
        input.insert("csv.data.row_count".into(), json!(3));
        input.insert("csv.data.column_count".into(), json!(2));
        let outcome = table.project(&input, &ctx("t.csv"));
        let fields = &outcome.candidates[0].fields;
        assert_eq!(fields["sample_rows"], json!([]));
        assert_eq!(fields["empty_cells"], json!(0));
        assert!(table
            .schema(SnapshotType::CsvData)
            .unwrap()
            .check(fields)
            .is_empty());
    }

    #[test]
    fn unrelated_namespaces_do_not_fire() {
        let table = MappingTable::builtin().unwrap();
        let mut input = FieldMapping::new();
        input.insert("code.filetype".into(), json!("x"));
        let outcome = table.project(&input, &ctx("x"));
        assert!(outcome.candidates.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn repo_namespace_maps_to_project_level_record() {
        let table = MappingTable::builtin().unwrap();
        let mut input = FieldMapping::new();
        input.insert("repo.name".into(), json!("demo"));
        input.insert("repo.source".into(), json!("staging"));
        input.insert("repo.file_count".into(), json!(2));
        input.insert("repo.total_bytes".into(), json!(10));
        let outcome = table.project(&input, &FileContext::project_level());
        assert_eq!(types_of(&outcome), vec![SnapshotType::RepoMetadata]);
        assert_eq!(outcome.candidates[0].source_path, ".");
        assert_eq!(outcome.candidates[0].fields["languages"], Value::Null);
    }

    #[test]
    fn schema_check_reports_type_mismatch_and_unknown_fields() {
        let table = MappingTable::builtin().unwrap();
        let schema = table.schema(SnapshotType::CsvSchema).unwrap();
        let mut fields = Fields::new();
        fields.insert("columns".into(), json!("not an array"));
        fields.insert("column_count".into(), json!(1));
        fields.insert("bogus".into(), json!(true));
        let problems = schema.check(&fields);
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn rejects_projection_outside_schema() {
        let bad = BUILTIN_TABLE.replace("to = \"import_count\"", "to = \"imported\"");
        let err = MappingTable::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, SnapError::Mapping(_)));
    }

    #[test]
    fn rejects_reads_outside_namespace() {
        let bad = BUILTIN_TABLE.replace(
            "{ op = \"count\", from = \"code.imports[].module\"",
            "{ op = \"count\", from = \"code.functions[].name\"",
        );
        assert!(MappingTable::from_toml_str(&bad).is_err());
    }

    #[test]
    fn rejects_missing_type_schema() {
        let bad = BUILTIN_TABLE.replace("[types.csv_schema]", "[types.csv_schemas]");
        assert!(MappingTable::from_toml_str(&bad).is_err());
    }
}
