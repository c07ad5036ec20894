//! Document text extraction: plain-text formats plus PDF and OOXML containers.
//!
//! Binary containers are opened with bounded reads so a crafted archive can
//! not balloon memory. Extracted text is truncated to the configured
//! character budget before it is emitted as `doc.content.text`.

use async_trait::async_trait;
use quick_xml::events::Event;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use super::{run_blocking, CapabilityFailure, FailureKind, InvokeResult, ParserAdapter, Rows};
use crate::models::{Capability, DocFormat, FieldMapping, FileType, StagedFile};

/// Maximum sheets to read from a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes for one archive entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const TOP_TERMS: usize = 10;
const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("archive entry {0} exceeds the size limit")]
    EntryTooLarge(String),
}

impl From<ExtractError> for CapabilityFailure {
    fn from(err: ExtractError) -> Self {
        let kind = match err {
            ExtractError::EntryTooLarge(_) => FailureKind::ResourceExceeded,
            _ => FailureKind::ParseError,
        };
        CapabilityFailure::new(kind, err.to_string())
    }
}

pub struct DocumentExtractor {
    max_chars: usize,
}

impl DocumentExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ParserAdapter for DocumentExtractor {
    fn name(&self) -> &str {
        "document"
    }

    async fn invoke(&self, file: &StagedFile, capability: Capability) -> InvokeResult {
        if capability != Capability::Document {
            return Err(CapabilityFailure::unsupported(format!(
                "document extractor cannot serve {}",
                capability
            )));
        }
        let FileType::Document(format) = file.file_type else {
            return Err(CapabilityFailure::unsupported(format!(
                "not a document: {}",
                file.file_type.label()
            )));
        };
        let max_chars = self.max_chars;
        run_blocking(file, move |file, bytes| {
            let doc = extract(format, &bytes)?;
            Ok(describe(&file.rel_path, format, bytes.len() as u64, &doc, max_chars))
        })
        .await
    }
}

/// Text plus whatever structure the format exposes.
#[derive(Debug, Default)]
pub struct ExtractedDoc {
    pub text: String,
    pub headings: Vec<(String, u8)>,
    pub title: Option<String>,
    pub pages: Option<usize>,
}

pub fn extract(format: DocFormat, bytes: &[u8]) -> Result<ExtractedDoc, ExtractError> {
    match format {
        DocFormat::Markdown => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            Ok(ExtractedDoc {
                headings: markdown_headings(&text),
                text,
                ..Default::default()
            })
        }
        DocFormat::Rst => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            Ok(ExtractedDoc {
                headings: rst_headings(&text),
                text,
                ..Default::default()
            })
        }
        DocFormat::PlainText => Ok(ExtractedDoc {
            text: String::from_utf8_lossy(bytes).into_owned(),
            ..Default::default()
        }),
        DocFormat::Html => Ok(extract_html(&String::from_utf8_lossy(bytes))),
        DocFormat::Pdf => Ok(ExtractedDoc {
            text: pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| ExtractError::Pdf(e.to_string()))?,
            ..Default::default()
        }),
        DocFormat::Docx => extract_docx(bytes),
        DocFormat::Pptx => extract_pptx(bytes),
        DocFormat::Xlsx => extract_xlsx(bytes),
    }
}

// ── Text formats ─────────────────────────────────────────────────────────

static MD_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").expect("heading pattern"));
static HTML_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<!--.*?-->")
        .expect("script pattern")
});
static HTML_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]>").expect("h pattern"));
static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("title pattern"));
static HTML_BLOCK_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(?:p|div|h[1-6]|li|tr|br)>|<br\s*/?>").expect("block pattern")
});
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w[\w'-]*").expect("word pattern"));
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s|$)").expect("sentence pattern"));
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\(([^)\s]+)[^)]*\)").expect("link pattern"));
static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("href pattern")
});
static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s)>\]"']+"#).expect("url pattern"));

fn markdown_headings(text: &str) -> Vec<(String, u8)> {
    let mut in_fence = false;
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = MD_HEADING.captures(line) {
            out.push((caps[2].to_string(), caps[1].len() as u8));
        }
    }
    out
}

/// reStructuredText section titles: a line underlined with a repeated
/// punctuation character. Levels follow order of first appearance.
fn rst_headings(text: &str) -> Vec<(String, u8)> {
    let lines: Vec<&str> = text.lines().collect();
    let mut levels: Vec<char> = Vec::new();
    let mut out = Vec::new();
    for pair in lines.windows(2) {
        let (title, underline) = (pair[0].trim_end(), pair[1].trim_end());
        let Some(mark) = underline.chars().next() else {
            continue;
        };
        let is_underline = "=-~^\"'`#*+".contains(mark)
            && underline.chars().all(|c| c == mark)
            && !title.trim().is_empty()
            && underline.chars().count() >= title.chars().count();
        if !is_underline || title.chars().all(|c| c == mark) {
            continue;
        }
        let level = match levels.iter().position(|&c| c == mark) {
            Some(i) => i + 1,
            None => {
                levels.push(mark);
                levels.len()
            }
        };
        out.push((title.trim().to_string(), level.min(6) as u8));
    }
    out
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn strip_tags(html: &str) -> String {
    let text = HTML_TAG.replace_all(html, " ");
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn extract_html(html: &str) -> ExtractedDoc {
    let cleaned = HTML_SCRIPT.replace_all(html, " ");
    let headings = HTML_HEADING
        .captures_iter(&cleaned)
        .filter_map(|c| {
            let level = c[1].parse::<u8>().ok()?;
            let text = strip_tags(&c[2]);
            (!text.is_empty()).then_some((text, level))
        })
        .collect();
    let title = HTML_TITLE
        .captures(&cleaned)
        .map(|c| strip_tags(&c[1]))
        .filter(|t| !t.is_empty());
    let body = HTML_TITLE.replace(&cleaned, " ");
    let with_breaks = HTML_BLOCK_END.replace_all(&body, "\n");
    let text = with_breaks
        .lines()
        .map(strip_tags)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    ExtractedDoc {
        text,
        headings,
        title,
        pages: None,
    }
}

// ── OOXML containers ─────────────────────────────────────────────────────

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::EntryTooLarge(name.to_string()));
    }
    Ok(out)
}

/// Entry names with `prefix<N>.xml`, sorted by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(String::from)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

struct Paragraph {
    style: Option<String>,
    text: String,
}

/// Paragraphs (`p`) with their text runs (`t`) and paragraph style, namespace-agnostic.
fn paragraphs(xml: &[u8]) -> Result<Vec<Paragraph>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<Paragraph> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    current = Some(Paragraph {
                        style: None,
                        text: String::new(),
                    })
                }
                b"t" => in_text = true,
                b"pStyle" => set_style(&mut current, &e),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => set_style(&mut current, &e),
                b"tab" | b"br" => {
                    if let Some(p) = current.as_mut() {
                        p.text.push(' ');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(p) = current.as_mut() {
                    p.text
                        .push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(p) = current.take() {
                        if !p.text.trim().is_empty() {
                            out.push(p);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn set_style(current: &mut Option<Paragraph>, e: &quick_xml::events::BytesStart<'_>) {
    let Some(p) = current.as_mut() else { return };
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"val" {
            if let Ok(v) = attr.unescape_value() {
                p.style = Some(v.into_owned());
            }
        }
    }
}

/// `Heading1`..`Heading6` and `Title` paragraph styles.
fn heading_level(style: &str) -> Option<u8> {
    if style.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let lower = style.to_ascii_lowercase();
    let n = lower.strip_prefix("heading")?;
    n.trim().parse::<u8>().ok().filter(|l| (1..=6).contains(l))
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedDoc, ExtractError> {
    let mut archive = open_archive(bytes)?;
    if archive.index_for_name("word/document.xml").is_none() {
        return Err(ExtractError::Ooxml("word/document.xml not found".into()));
    }
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    let paras = paragraphs(&xml)?;
    let mut doc = ExtractedDoc::default();
    for p in &paras {
        if let Some(style) = p.style.as_deref() {
            if style.eq_ignore_ascii_case("title") && doc.title.is_none() {
                doc.title = Some(p.text.trim().to_string());
            }
            if let Some(level) = heading_level(style) {
                doc.headings.push((p.text.trim().to_string(), level));
            }
        }
    }
    doc.text = paras
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Ok(doc)
}

fn extract_pptx(bytes: &[u8]) -> Result<ExtractedDoc, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut blocks = Vec::new();
    for name in &slides {
        let xml = read_entry_bounded(&mut archive, name)?;
        let text = paragraphs(&xml)?
            .into_iter()
            .map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            blocks.push(text);
        }
    }
    Ok(ExtractedDoc {
        text: blocks.join("\n\n"),
        pages: Some(slides.len()),
        ..Default::default()
    })
}

fn extract_xlsx(bytes: &[u8]) -> Result<ExtractedDoc, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        let xml = read_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut blocks = Vec::new();
    for name in sheets.iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry_bounded(&mut archive, name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            blocks.push(cells.join(" "));
        }
    }
    Ok(ExtractedDoc {
        text: blocks.join("\n"),
        pages: Some(sheets.len().min(XLSX_MAX_SHEETS)),
        ..Default::default()
    })
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut cells = Vec::new();
    let mut in_value = false;
    let mut is_shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    is_shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    })
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if is_shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => is_shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

// ── Field output ─────────────────────────────────────────────────────────

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "who", "this", "that",
    "with", "from", "they", "will", "would", "there", "their", "what", "about", "which",
    "when", "were", "been", "into", "than", "then", "them", "these", "those", "also", "such",
];

/// Build `doc.*` fields from extracted text.
pub fn describe(
    path: &str,
    format: DocFormat,
    bytes: u64,
    doc: &ExtractedDoc,
    max_chars: usize,
) -> FieldMapping {
    let words: Vec<&str> = WORD.find_iter(&doc.text).map(|m| m.as_str()).collect();
    let sentence_count = SENTENCE_END
        .split(&doc.text)
        .filter(|s| WORD.is_match(s))
        .count();
    let avg_sentence_length = if sentence_count == 0 {
        0.0
    } else {
        ((words.len() as f64 / sentence_count as f64) * 100.0).round() / 100.0
    };

    let mut freq: HashMap<String, u64> = HashMap::new();
    for w in &words {
        *freq.entry(w.to_lowercase()).or_default() += 1;
    }
    let unique_words = freq.len();
    let mut terms: Vec<(&String, &u64)> = freq
        .iter()
        .filter(|(w, _)| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect();
    terms.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top_terms: Vec<&String> = terms.into_iter().take(TOP_TERMS).map(|(w, _)| w).collect();

    let mut links: BTreeSet<&str> = BTreeSet::new();
    for caps in MD_LINK.captures_iter(&doc.text) {
        links.extend(caps.get(1).map(|m| m.as_str()));
    }
    for caps in HREF.captures_iter(&doc.text) {
        links.extend(caps.get(1).map(|m| m.as_str()));
    }
    links.extend(BARE_URL.find_iter(&doc.text).map(|m| m.as_str()));

    let char_count = doc.text.chars().count();
    let truncated = char_count > max_chars;
    let text: String = if truncated {
        doc.text.chars().take(max_chars).collect()
    } else {
        doc.text.clone()
    };

    let title = doc
        .title
        .clone()
        .or_else(|| doc.headings.first().map(|(t, _)| t.clone()))
        .or_else(|| {
            doc.text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(|l| l.chars().take(MAX_TITLE_CHARS).collect())
        })
        .unwrap_or_else(|| {
            Path::new(path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        });

    let mut headings = Rows::new("doc.content.headings", &["text", "level"]);
    for (heading, level) in &doc.headings {
        headings.push(vec![json!(heading), json!(level)]);
    }

    let mut out = FieldMapping::new();
    out.insert("doc.metadata.title".into(), json!(title));
    out.insert("doc.metadata.format".into(), json!(format.as_str()));
    out.insert("doc.metadata.bytes".into(), json!(bytes));
    out.insert("doc.metadata.line_count".into(), json!(doc.text.lines().count()));
    out.insert("doc.metadata.word_count".into(), json!(words.len()));
    out.insert("doc.metadata.page_count".into(), json!(doc.pages));
    out.insert("doc.content.text".into(), json!(text));
    out.insert("doc.content.truncated".into(), json!(truncated));
    out.insert("doc.content.char_count".into(), json!(char_count));
    headings.write_into(&mut out);
    out.insert("doc.analysis.word_count".into(), json!(words.len()));
    out.insert("doc.analysis.sentence_count".into(), json!(sentence_count));
    out.insert(
        "doc.analysis.avg_sentence_length".into(),
        json!(avg_sentence_length),
    );
    out.insert("doc.analysis.unique_words".into(), json!(unique_words));
    out.insert("doc.analysis.top_terms".into(), json!(top_terms));
    out.insert("doc.analysis.link_count".into(), json!(links.len()));
    out
}
