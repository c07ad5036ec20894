//! Structural parser: imports, exports, functions, classes and outbound
//! connections for the languages with a grammar.
//!
//! Grammars are line-oriented regular expressions. They trade precision for
//! having no native toolchain dependency; multi-line signatures are cut at
//! the first line.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use super::{run_blocking, CapabilityFailure, InvokeResult, ParserAdapter, Rows};
use crate::models::{Capability, FieldMapping, FileType, Language, StagedFile};

pub struct StructuralParser;

#[async_trait]
impl ParserAdapter for StructuralParser {
    fn name(&self) -> &str {
        "structural"
    }

    async fn invoke(&self, file: &StagedFile, capability: Capability) -> InvokeResult {
        if capability != Capability::Structural {
            return Err(CapabilityFailure::unsupported(format!(
                "structural parser cannot serve {}",
                capability
            )));
        }
        let language = match file.file_type {
            FileType::Code(lang) if lang.has_structural_grammar() => lang,
            other => {
                return Err(CapabilityFailure::unsupported(format!(
                    "no structural grammar for {}",
                    other.label()
                )))
            }
        };
        run_blocking(file, move |file, bytes| {
            let source = String::from_utf8(bytes)
                .map_err(|_| CapabilityFailure::parse_error("source is not valid UTF-8"))?;
            parse_source(&file.rel_path, language, &source)
        })
        .await
    }
}

struct Grammar {
    imports: Vec<Regex>,
    /// Go-style `import ( ... )` blocks: opener, per-line entry.
    import_block: Option<(Regex, Regex)>,
    functions: Vec<Regex>,
    classes: Vec<Regex>,
    exports: Vec<Regex>,
    block_comments: bool,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in grammar pattern compiles")
}

static PYTHON: LazyLock<Grammar> = LazyLock::new(|| Grammar {
    imports: vec![
        re(r"^\s*import\s+(?P<module>[\w.]+)"),
        re(r"^\s*from\s+(?P<module>\.*[\w.]*)\s+import\b"),
    ],
    import_block: None,
    functions: vec![re(
        r"^(?P<indent>\s*)(?P<async>async\s+)?def\s+(?P<name>\w+)\s*\((?P<params>[^)]*)",
    )],
    classes: vec![re(r"^(?P<indent>\s*)class\s+(?P<name>\w+)")],
    exports: Vec::new(),
    block_comments: false,
});

static RUST: LazyLock<Grammar> = LazyLock::new(|| Grammar {
    imports: vec![
        re(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(?P<module>[\w:]+)"),
        re(r"^\s*extern\s+crate\s+(?P<module>\w+)"),
    ],
    import_block: None,
    functions: vec![re(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?P<async>async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(?P<name>\w+)\s*(?:<[^>]*>)?\s*\((?P<params>[^)]*)"#,
    )],
    classes: vec![re(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?P<kind>struct|enum|trait|union)\s+(?P<name>\w+)",
    )],
    exports: vec![re(
        r"^pub\s+(?:async\s+)?(?:unsafe\s+)?(?:const\s+)?(?P<kind>fn|struct|enum|trait|mod|const|static|type|union)\s+(?P<name>\w+)",
    )],
    block_comments: true,
});

static ECMASCRIPT: LazyLock<Grammar> = LazyLock::new(|| Grammar {
    imports: vec![
        re(r#"^\s*import\s+(?:type\s+)?(?:[^'"]*?\s+from\s+)?['"](?P<module>[^'"]+)['"]"#),
        re(r#"^\s*export\s+[^'"]*?\s+from\s+['"](?P<module>[^'"]+)['"]"#),
        re(r#"\brequire\(\s*['"](?P<module>[^'"]+)['"]\s*\)"#),
    ],
    import_block: None,
    functions: vec![
        re(
            r"^\s*(?:export\s+)?(?:default\s+)?(?P<async>async\s+)?function\s*\*?\s*(?P<name>\w+)\s*(?:<[^>]*>)?\s*\((?P<params>[^)]*)",
        ),
        re(
            r"^\s*(?:export\s+)?(?:const|let|var)\s+(?P<name>\w+)\s*(?::[^=]+)?=\s*(?P<async>async\s+)?\((?P<params>[^)]*)\)\s*(?::[^=]+)?=>",
        ),
    ],
    classes: vec![re(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?P<kind>class|interface|enum)\s+(?P<name>\w+)",
    )],
    exports: vec![
        re(
            r"^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?P<kind>function|class|const|let|var|interface|type|enum)\*?\s+(?P<name>\w+)",
        ),
        re(r"^\s*(?:module\.)?exports\.(?P<name>\w+)\s*="),
    ],
    block_comments: true,
});

static GO: LazyLock<Grammar> = LazyLock::new(|| Grammar {
    imports: vec![re(r#"^\s*import\s+(?:[\w.]+\s+)?"(?P<module>[^"]+)""#)],
    import_block: Some((
        re(r"^\s*import\s*\(\s*$"),
        re(r#"^\s*(?:[\w.]+\s+)?"(?P<module>[^"]+)""#),
    )),
    functions: vec![re(
        r"^func\s+(?:\([^)]*\)\s*)?(?P<name>\w+)\s*(?:\[[^\]]*\])?\s*\((?P<params>[^)]*)",
    )],
    classes: vec![re(r"^type\s+(?P<name>\w+)\s+(?P<kind>struct|interface)\b")],
    exports: Vec::new(),
    block_comments: true,
});

static JAVA: LazyLock<Grammar> = LazyLock::new(|| Grammar {
    imports: vec![re(r"^\s*import\s+(?:static\s+)?(?P<module>[\w.]+(?:\.\*)?)\s*;")],
    import_block: None,
    functions: vec![re(
        r"^\s*(?:(?:public|protected|private|static|final|abstract|synchronized|native|default)\s+)*(?:<[^>]+>\s+)?(?P<ret>[\w<>\[\],.?]+)\s+(?P<name>\w+)\s*\((?P<params>[^)]*)\)\s*(?:throws\s+[\w.,\s]+)?\{?\s*$",
    )],
    classes: vec![re(
        r"^\s*(?:(?:public|protected|private|static|final|abstract|sealed)\s+)*(?P<kind>class|interface|enum|record)\s+(?P<name>\w+)",
    )],
    exports: vec![re(
        r"^\s*public\s+(?:(?:static|final|abstract|sealed)\s+)*(?P<kind>class|interface|enum|record)\s+(?P<name>\w+)",
    )],
    block_comments: true,
});

static HTTP_URL: LazyLock<Regex> = LazyLock::new(|| re(r#"https?://[^\s"'<>()`]+"#));

const JAVA_NON_METHODS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "new", "else", "throw", "synchronized",
];

fn grammar(language: Language) -> Option<&'static Grammar> {
    match language {
        Language::Python => Some(&*PYTHON),
        Language::Rust => Some(&*RUST),
        Language::JavaScript | Language::TypeScript => Some(&*ECMASCRIPT),
        Language::Go => Some(&*GO),
        Language::Java => Some(&*JAVA),
        _ => None,
    }
}

/// Parse source text into `code.*` fields.
pub fn parse_source(path: &str, language: Language, source: &str) -> InvokeResult {
    let g = grammar(language).ok_or_else(|| {
        CapabilityFailure::unsupported(format!("no structural grammar for {}", language.as_str()))
    })?;

    let mut imports = Rows::new("code.imports", &["module", "line"]);
    let mut exports = Rows::new("code.exports", &["name", "kind"]);
    let mut functions = Rows::new("code.functions", &["name", "line", "params", "is_async"]);
    let mut classes = Rows::new("code.classes", &["name", "line", "kind"]);
    let mut connections = Rows::new("code.connections", &["target", "kind", "line"]);

    let mut loc = 0u64;
    let mut blank = 0u64;
    let mut comments = 0u64;
    let mut in_block_comment = false;
    let mut in_import_block = false;

    for (idx, raw) in source.lines().enumerate() {
        loc += 1;
        let line_no = idx as u64 + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            blank += 1;
            continue;
        }
        if g.block_comments {
            if in_block_comment {
                comments += 1;
                if trimmed.contains("*/") {
                    in_block_comment = false;
                }
                continue;
            }
            if trimmed.starts_with("/*") {
                comments += 1;
                in_block_comment = !trimmed.contains("*/");
                continue;
            }
        }
        if language
            .comment_prefixes()
            .iter()
            .any(|p| trimmed.starts_with(p))
        {
            comments += 1;
            continue;
        }

        let mut line_modules: Vec<String> = Vec::new();
        if let Some((opener, entry)) = &g.import_block {
            if in_import_block {
                if trimmed.starts_with(')') {
                    in_import_block = false;
                } else if let Some(m) = entry.captures(raw).and_then(|c| c.name("module")) {
                    line_modules.push(m.as_str().to_string());
                }
                record_imports(language, &line_modules, line_no, &mut imports, &mut connections);
                continue;
            }
            if opener.is_match(raw) {
                in_import_block = true;
                continue;
            }
        }
        for pattern in &g.imports {
            for caps in pattern.captures_iter(raw) {
                if let Some(m) = caps.name("module") {
                    if !m.as_str().is_empty() {
                        line_modules.push(m.as_str().to_string());
                    }
                }
            }
        }
        record_imports(language, &line_modules, line_no, &mut imports, &mut connections);

        if let Some(caps) = g.functions.iter().find_map(|p| p.captures(raw)) {
            let name = caps.name("name").map_or("", |m| m.as_str());
            let is_method_shape = language != Language::Java
                || (!JAVA_NON_METHODS.contains(&name)
                    && !caps
                        .name("ret")
                        .is_some_and(|r| JAVA_NON_METHODS.contains(&r.as_str())));
            if !name.is_empty() && is_method_shape {
                let params = caps.name("params").map_or("", |m| m.as_str());
                functions.push(vec![
                    json!(name),
                    json!(line_no),
                    json!(count_params(language, params)),
                    json!(caps.name("async").is_some()),
                ]);
                let top_level = caps.name("indent").map_or(true, |m| m.as_str().is_empty());
                if let Some(kind) = derived_export(language, name, top_level, "function") {
                    exports.push(vec![json!(name), json!(kind)]);
                }
            }
        }

        if let Some(caps) = g.classes.iter().find_map(|p| p.captures(raw)) {
            let name = caps.name("name").map_or("", |m| m.as_str());
            let kind = caps.name("kind").map_or("class", |m| m.as_str());
            classes.push(vec![json!(name), json!(line_no), json!(kind)]);
            let top_level = caps.name("indent").map_or(true, |m| m.as_str().is_empty());
            let export_kind = if language == Language::Go { "type" } else { "class" };
            if let Some(kind) = derived_export(language, name, top_level, export_kind) {
                exports.push(vec![json!(name), json!(kind)]);
            }
        }

        for pattern in &g.exports {
            if let Some(caps) = pattern.captures(raw) {
                if let Some(name) = caps.name("name") {
                    let kind = caps.name("kind").map_or("value", |m| m.as_str());
                    exports.push(vec![json!(name.as_str()), json!(kind)]);
                }
                break;
            }
        }

        for url in HTTP_URL.find_iter(raw) {
            connections.push(vec![json!(url.as_str()), json!("http"), json!(line_no)]);
        }
    }

    let mut out = FieldMapping::new();
    out.insert("code.file.path".into(), json!(path));
    out.insert("code.file.language".into(), json!(language.as_str()));
    out.insert("code.file.loc".into(), json!(loc));
    out.insert("code.file.bytes".into(), json!(source.len()));
    out.insert("code.file.blank_lines".into(), json!(blank));
    out.insert("code.file.comment_lines".into(), json!(comments));
    imports.write_into(&mut out);
    exports.write_into(&mut out);
    functions.write_into(&mut out);
    classes.write_into(&mut out);
    connections.write_into(&mut out);
    Ok(out)
}

fn record_imports(
    language: Language,
    modules: &[String],
    line_no: u64,
    imports: &mut Rows,
    connections: &mut Rows,
) {
    for module in modules {
        imports.push(vec![json!(module), json!(line_no)]);
        let kind = if is_internal_module(language, module) {
            "internal_import"
        } else {
            "external_import"
        };
        connections.push(vec![json!(module), json!(kind), json!(line_no)]);
    }
}

fn is_internal_module(language: Language, module: &str) -> bool {
    match language {
        Language::Python => module.starts_with('.'),
        Language::Rust => {
            module == "crate"
                || module.starts_with("crate::")
                || module.starts_with("self::")
                || module.starts_with("super::")
        }
        Language::JavaScript | Language::TypeScript => {
            module.starts_with("./")
                || module.starts_with("../")
                || module.starts_with("@/")
                || module.starts_with("~/")
        }
        Language::Go => module.starts_with("./") || module.starts_with("../"),
        _ => false,
    }
}

/// Python and Go have no export keyword; visibility follows naming.
fn derived_export(
    language: Language,
    name: &str,
    top_level: bool,
    kind: &'static str,
) -> Option<&'static str> {
    match language {
        Language::Python if top_level && !name.starts_with('_') => Some(kind),
        Language::Go if name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) => Some(kind),
        _ => None,
    }
}

fn count_params(language: Language, params: &str) -> usize {
    params
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| match language {
            Language::Python => *p != "self" && *p != "cls",
            Language::Rust => !matches!(*p, "self" | "&self" | "&mut self" | "mut self"),
            _ => true,
        })
        .count()
}

/// Names in the `name` column for a repeated namespace, for tests and callers
/// that only need the identifiers.
pub fn names(mapping: &FieldMapping, prefix: &str) -> Vec<String> {
    match mapping.get(&format!("{}[].name", prefix)) {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_functions_classes_and_exports() {
        let src = "import os\nfrom .models import User\n\n# helper\nclass Service:\n    def run(self, job):\n        pass\n\nasync def fetch(url, timeout):\n    return 'https://api.example.com/v1'\n\ndef _private():\n    pass\n";
        let out = parse_source("svc.py", Language::Python, src).unwrap();
        assert_eq!(names(&out, "code.functions"), vec!["run", "fetch", "_private"]);
        assert_eq!(names(&out, "code.classes"), vec!["Service"]);
        assert_eq!(names(&out, "code.exports"), vec!["Service", "fetch"]);
        assert_eq!(out["code.functions[].params"], json!([1, 2, 0]));
        assert_eq!(out["code.functions[].is_async"], json!([false, true, false]));
        assert_eq!(out["code.imports[].module"], json!(["os", ".models"]));
        assert_eq!(
            out["code.connections[].kind"],
            json!(["external_import", "internal_import", "http"])
        );
        assert_eq!(out["code.file.comment_lines"], json!(1));
        assert_eq!(out["code.file.blank_lines"], json!(3));
    }

    #[test]
    fn rust_items_and_visibility() {
        let src = "use std::fmt;\nuse crate::models::Thing;\n\n/* block\n   comment */\npub struct Store;\nenum Mode { A }\n\npub async fn open(path: &str, n: usize) -> Store { Store }\nimpl Store {\n    pub fn get(&self, key: &str) {}\n}\n";
        let out = parse_source("lib.rs", Language::Rust, src).unwrap();
        assert_eq!(names(&out, "code.functions"), vec!["open", "get"]);
        assert_eq!(out["code.functions[].params"], json!([2, 1]));
        assert_eq!(names(&out, "code.classes"), vec!["Store", "Mode"]);
        assert_eq!(out["code.classes[].kind"], json!(["struct", "enum"]));
        assert_eq!(names(&out, "code.exports"), vec!["Store", "open"]);
        assert_eq!(out["code.file.comment_lines"], json!(2));
        assert_eq!(
            out["code.connections[].kind"],
            json!(["external_import", "internal_import"])
        );
    }

    #[test]
    fn javascript_imports_and_arrow_functions() {
        let src = "import React from 'react';\nconst util = require('./util');\nexport const add = (a, b) => a + b;\nexport default class App {}\n";
        let out = parse_source("app.js", Language::JavaScript, src).unwrap();
        assert_eq!(out["code.imports[].module"], json!(["react", "./util"]));
        assert_eq!(names(&out, "code.functions"), vec!["add"]);
        assert_eq!(names(&out, "code.exports"), vec!["add", "App"]);
    }

    #[test]
    fn go_import_blocks_and_capitalised_exports() {
        let src = "package main\n\nimport (\n    \"fmt\"\n    log \"github.com/sirupsen/logrus\"\n)\n\ntype Server struct {}\n\nfunc (s *Server) Start(port int) error { return nil }\nfunc helper() {}\n";
        let out = parse_source("main.go", Language::Go, src).unwrap();
        assert_eq!(
            out["code.imports[].module"],
            json!(["fmt", "github.com/sirupsen/logrus"])
        );
        assert_eq!(names(&out, "code.functions"), vec!["Start", "helper"]);
        assert_eq!(names(&out, "code.exports"), vec!["Server", "Start"]);
    }

    #[test]
    fn java_skips_control_flow() {
        let src = "import java.util.List;\npublic class Repo {\n    public Repo(int size) {\n    }\n    private List<String> find(String q, int limit) {\n        if (q.isEmpty()) {\n        }\n    }\n}\n";
        let out = parse_source("Repo.java", Language::Java, src).unwrap();
        assert_eq!(names(&out, "code.functions"), vec!["Repo", "find"]);
        assert_eq!(names(&out, "code.exports"), vec!["Repo"]);
    }

    #[test]
    fn empty_sections_are_still_present() {
        let out = parse_source("empty.py", Language::Python, "").unwrap();
        assert_eq!(out["code.functions[].name"], json!([]));
        assert_eq!(out["code.file.loc"], json!(0));
    }

    #[test]
    fn languages_without_grammar_are_unsupported() {
        let err = parse_source("x.rb", Language::Ruby, "puts 1").unwrap_err();
        assert_eq!(err.kind, super::super::FailureKind::Unsupported);
    }
}
