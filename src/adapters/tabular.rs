//! CSV / TSV parser: inferred column schema plus row statistics and a sample.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{run_blocking, CapabilityFailure, InvokeResult, ParserAdapter, Rows};
use crate::limits::LimitPolicy;
use crate::models::{Capability, FieldMapping, FileType, StagedFile, TabularFormat};

const SAMPLE_ROWS: usize = 5;
const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

pub struct TabularParser {
    policy: LimitPolicy,
}

impl TabularParser {
    pub fn new(policy: LimitPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ParserAdapter for TabularParser {
    fn name(&self) -> &str {
        "tabular"
    }

    async fn invoke(&self, file: &StagedFile, capability: Capability) -> InvokeResult {
        if capability != Capability::Tabular {
            return Err(CapabilityFailure::unsupported(format!(
                "tabular parser cannot serve {}",
                capability
            )));
        }
        let FileType::Tabular(format) = file.file_type else {
            return Err(CapabilityFailure::unsupported(format!(
                "not tabular data: {}",
                file.file_type.label()
            )));
        };
        let policy = self.policy.clone();
        run_blocking(file, move |_, bytes| parse_table(&policy, format, &bytes)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Empty,
    Boolean,
    Integer,
    Number,
    Date,
    String,
}

impl ColumnType {
    fn as_str(&self) -> &'static str {
        match self {
            // A column with no values at all is reported as string.
            ColumnType::Empty | ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
        }
    }

    fn of(cell: &str) -> ColumnType {
        if cell.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else if cell.parse::<f64>().is_ok_and(f64::is_finite) {
            ColumnType::Number
        } else if matches!(cell.to_ascii_lowercase().as_str(), "true" | "false") {
            ColumnType::Boolean
        } else if chrono::NaiveDate::parse_from_str(cell, "%Y-%m-%d").is_ok() {
            ColumnType::Date
        } else {
            ColumnType::String
        }
    }

    fn merge(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (Empty, t) | (t, Empty) => t,
            (a, b) if a == b => a,
            (Integer, Number) | (Number, Integer) => Number,
            _ => String,
        }
    }
}

struct Column {
    name: String,
    kind: ColumnType,
    nullable: bool,
}

/// Pick the delimiter that splits the header line into the most fields.
fn sniff_delimiter(format: TabularFormat, bytes: &[u8]) -> u8 {
    if format == TabularFormat::Tsv {
        return b'\t';
    }
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .max_by_key(|d| {
            let count = header.iter().filter(|b| *b == d).count();
            // Ties favour the earlier candidate.
            (count, std::cmp::Reverse(CANDIDATE_DELIMITERS.iter().position(|c| c == d)))
        })
        .filter(|d| header.contains(d))
        .unwrap_or(b',')
}

/// Parse table bytes into `csv.schema.*` and `csv.data.*` fields.
pub fn parse_table(policy: &LimitPolicy, format: TabularFormat, bytes: &[u8]) -> InvokeResult {
    let delimiter = sniff_delimiter(format, bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| CapabilityFailure::parse_error(format!("unreadable header: {}", e)))?
        .clone();
    let mut columns: Vec<Column> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let name = h.trim();
            Column {
                name: if name.is_empty() {
                    format!("column_{}", i + 1)
                } else {
                    name.to_string()
                },
                kind: ColumnType::Empty,
                nullable: false,
            }
        })
        .collect();
    for (i, name) in headers.iter().enumerate() {
        policy
            .check_cell(name.chars().count())
            .map_err(|e| CapabilityFailure::resource_exceeded(format!("header {}: {}", i + 1, e)))?;
    }

    let mut row_count = 0u64;
    let mut empty_cells = 0u64;
    let mut samples: Vec<Value> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| CapabilityFailure::parse_error(e.to_string()))?;
        row_count += 1;
        policy
            .check_rows(row_count)
            .map_err(CapabilityFailure::resource_exceeded)?;

        // Ragged rows grow the schema with unnamed columns.
        while columns.len() < record.len() {
            columns.push(Column {
                name: format!("column_{}", columns.len() + 1),
                kind: ColumnType::Empty,
                nullable: true,
            });
        }

        for (idx, column) in columns.iter_mut().enumerate() {
            let cell = record.get(idx).map(str::trim).unwrap_or("");
            policy.check_cell(cell.chars().count()).map_err(|e| {
                CapabilityFailure::resource_exceeded(format!(
                    "row {} column {:?}: {}",
                    row_count, column.name, e
                ))
            })?;
            if cell.is_empty() {
                column.nullable = true;
                empty_cells += 1;
            } else {
                column.kind = column.kind.merge(ColumnType::of(cell));
            }
        }

        if samples.len() < SAMPLE_ROWS {
            let row: Map<String, Value> = columns
                .iter()
                .enumerate()
                .map(|(idx, c)| (c.name.clone(), json!(record.get(idx).unwrap_or(""))))
                .collect();
            samples.push(Value::Object(row));
        }
    }

    let mut schema = Rows::new("csv.schema.columns", &["name", "type", "nullable"]);
    for c in &columns {
        schema.push(vec![json!(c.name), json!(c.kind.as_str()), json!(c.nullable)]);
    }
    let delimiter_label = match delimiter {
        b'\t' => "\\t".to_string(),
        d => (d as char).to_string(),
    };

    let mut out = FieldMapping::new();
    schema.write_into(&mut out);
    out.insert("csv.schema.delimiter".into(), json!(delimiter_label));
    out.insert("csv.data.row_count".into(), json!(row_count));
    out.insert("csv.data.column_count".into(), json!(columns.len()));
    out.insert("csv.data.sample_rows".into(), Value::Array(samples));
    out.insert("csv.data.empty_cells".into(), json!(empty_cells));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FailureKind;
    use crate::config::LimitsConfig;

    fn policy() -> LimitPolicy {
        LimitPolicy::new(LimitsConfig::default())
    }

    #[test]
    fn infers_column_types() {
        let data = b"id,price,active,joined,name\n1,9.5,true,2024-01-02,Ann\n2,10,false,2024-02-03,\n";
        let out = parse_table(&policy(), TabularFormat::Csv, data).unwrap();
        assert_eq!(
            out["csv.schema.columns[].type"],
            json!(["integer", "number", "boolean", "date", "string"])
        );
        assert_eq!(
            out["csv.schema.columns[].nullable"],
            json!([false, false, false, false, true])
        );
        assert_eq!(out["csv.data.row_count"], json!(2));
        assert_eq!(out["csv.data.column_count"], json!(5));
        assert_eq!(out["csv.data.empty_cells"], json!(1));
        assert_eq!(out["csv.data.sample_rows"][0]["name"], json!("Ann"));
    }

    #[test]
    fn sniffs_semicolons() {
        let out = parse_table(&policy(), TabularFormat::Csv, b"a;b\n1;2\n").unwrap();
        assert_eq!(out["csv.schema.delimiter"], json!(";"));
        assert_eq!(out["csv.schema.columns[].name"], json!(["a", "b"]));
    }

    #[test]
    fn tsv_uses_tabs() {
        let out = parse_table(&policy(), TabularFormat::Tsv, b"a,b\tc\n1\t2\n").unwrap();
        assert_eq!(out["csv.schema.columns[].name"], json!(["a,b", "c"]));
    }

    #[test]
    fn oversized_cell_is_resource_exceeded() {
        let mut limits = LimitsConfig::default();
        limits.max_csv_cell_chars = 4;
        let err = parse_table(&LimitPolicy::new(limits), TabularFormat::Csv, b"a\nhello\n")
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ResourceExceeded);
    }

    #[test]
    fn row_cap_is_resource_exceeded() {
        let mut limits = LimitsConfig::default();
        limits.max_csv_rows = 2;
        let err = parse_table(&LimitPolicy::new(limits), TabularFormat::Csv, b"a\n1\n2\n3\n")
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ResourceExceeded);
    }

    #[test]
    fn header_only_table() {
        let out = parse_table(&policy(), TabularFormat::Csv, b"x,y\n").unwrap();
        assert_eq!(out["csv.data.row_count"], json!(0));
        assert_eq!(out["csv.schema.columns[].type"], json!(["string", "string"]));
    }
}
