//! Size thresholds and file categorization.
//!
//! Everything here is pure: no I/O, no clocks. Verdicts are monotonic in
//! size, so a larger file never receives a milder verdict.

use crate::config::LimitsConfig;
use crate::error::SnapError;
use crate::models::{FileType, Verdict};

/// Verdict plus the warnings that justify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub warnings: Vec<String>,
}

impl Assessment {
    fn normal() -> Self {
        Self {
            verdict: Verdict::Normal,
            warnings: Vec::new(),
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            verdict: Verdict::Rejected,
            warnings: vec![reason],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitPolicy {
    limits: LimitsConfig,
}

impl LimitPolicy {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Classify a line count against soft-cap, god-threshold and hard-cap.
    ///
    /// Zero and negative counts are `normal`.
    pub fn categorize_lines(&self, lines: i64) -> Verdict {
        if lines <= 0 {
            return Verdict::Normal;
        }
        let lines = lines as u64;
        if lines >= self.limits.hard_cap_loc {
            Verdict::Rejected
        } else if lines >= self.limits.god_loc {
            Verdict::PotentialGod
        } else if lines >= self.limits.soft_cap_loc {
            Verdict::Large
        } else {
            Verdict::Normal
        }
    }

    /// Source files: line thresholds plus the byte cap.
    pub fn assess_code(&self, bytes: u64, lines: u64) -> Assessment {
        if bytes > self.limits.max_code_file_bytes {
            return Assessment::rejected(format!(
                "file is {} bytes, exceeds max_code_file_bytes ({})",
                bytes, self.limits.max_code_file_bytes
            ));
        }
        let verdict = self.categorize_lines(lines.min(i64::MAX as u64) as i64);
        let warnings = match verdict {
            Verdict::Normal => Vec::new(),
            Verdict::Large => vec![format!(
                "large file: {} lines (soft cap {})",
                lines, self.limits.soft_cap_loc
            )],
            Verdict::PotentialGod => vec![format!(
                "potential god file: {} lines (threshold {})",
                lines, self.limits.god_loc
            )],
            Verdict::Rejected => vec![format!(
                "file has {} lines, at or above hard cap ({})",
                lines, self.limits.hard_cap_loc
            )],
        };
        Assessment { verdict, warnings }
    }

    pub fn assess_document(&self, bytes: u64) -> Assessment {
        if bytes > self.limits.max_doc_file_bytes {
            Assessment::rejected(format!(
                "document is {} bytes, exceeds max_doc_file_bytes ({})",
                bytes, self.limits.max_doc_file_bytes
            ))
        } else {
            Assessment::normal()
        }
    }

    /// Tabular files: byte cap and an estimated row count (lines minus header).
    pub fn assess_tabular(&self, bytes: u64, estimated_rows: u64) -> Assessment {
        if bytes > self.limits.max_csv_file_bytes {
            return Assessment::rejected(format!(
                "table is {} bytes, exceeds max_csv_file_bytes ({})",
                bytes, self.limits.max_csv_file_bytes
            ));
        }
        if estimated_rows > self.limits.max_csv_rows {
            return Assessment::rejected(format!(
                "table has ~{} rows, exceeds max_csv_rows ({})",
                estimated_rows, self.limits.max_csv_rows
            ));
        }
        Assessment::normal()
    }

    pub fn assess(&self, file_type: FileType, bytes: u64, lines: u64) -> Assessment {
        match file_type {
            FileType::Code(_) => self.assess_code(bytes, lines),
            FileType::Document(_) => self.assess_document(bytes),
            FileType::Tabular(_) => self.assess_tabular(bytes, lines.saturating_sub(1)),
        }
    }

    /// Largest byte size any file type may have; used to skip reading oversized files.
    pub fn max_file_bytes(&self) -> u64 {
        self.limits
            .max_code_file_bytes
            .max(self.limits.max_doc_file_bytes)
            .max(self.limits.max_csv_file_bytes)
    }

    pub fn check_cell(&self, chars: usize) -> Result<(), String> {
        if chars > self.limits.max_csv_cell_chars {
            Err(format!(
                "cell has {} characters, exceeds max_csv_cell_chars ({})",
                chars, self.limits.max_csv_cell_chars
            ))
        } else {
            Ok(())
        }
    }

    pub fn check_rows(&self, rows: u64) -> Result<(), String> {
        if rows > self.limits.max_csv_rows {
            Err(format!(
                "table exceeds max_csv_rows ({})",
                self.limits.max_csv_rows
            ))
        } else {
            Ok(())
        }
    }

    pub fn check_repository(&self, total_bytes: u64) -> Result<(), SnapError> {
        if total_bytes > self.limits.max_repo_bytes {
            Err(SnapError::RepositoryTooLarge {
                total: total_bytes,
                max: self.limits.max_repo_bytes,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocFormat, Language, TabularFormat};

    fn policy() -> LimitPolicy {
        LimitPolicy::new(LimitsConfig::default())
    }

    #[test]
    fn line_thresholds_are_monotonic_at_the_boundaries() {
        let p = policy();
        assert_eq!(p.categorize_lines(1499), Verdict::Normal);
        assert_eq!(p.categorize_lines(1500), Verdict::Large);
        assert_eq!(p.categorize_lines(3999), Verdict::Large);
        assert_eq!(p.categorize_lines(4000), Verdict::PotentialGod);
        assert_eq!(p.categorize_lines(4999), Verdict::PotentialGod);
        assert_eq!(p.categorize_lines(5000), Verdict::Rejected);
    }

    #[test]
    fn zero_and_negative_sizes_are_normal() {
        let p = policy();
        assert_eq!(p.categorize_lines(0), Verdict::Normal);
        assert_eq!(p.categorize_lines(-42), Verdict::Normal);
        assert_eq!(p.assess_code(0, 0).verdict, Verdict::Normal);
    }

    #[test]
    fn verdict_never_decreases_as_lines_grow() {
        let p = policy();
        let mut prev = Verdict::Normal;
        for lines in (0..6000).step_by(7) {
            let v = p.categorize_lines(lines);
            assert!(v >= prev, "{} lines regressed to {:?}", lines, v);
            prev = v;
        }
    }

    #[test]
    fn byte_cap_rejects_small_line_counts() {
        let p = policy();
        let a = p.assess_code(p.limits().max_code_file_bytes + 1, 10);
        assert_eq!(a.verdict, Verdict::Rejected);
        assert_eq!(a.warnings.len(), 1);
    }

    #[test]
    fn large_files_carry_a_warning() {
        let a = policy().assess_code(1000, 2000);
        assert_eq!(a.verdict, Verdict::Large);
        assert!(a.warnings[0].contains("2000"));
    }

    #[test]
    fn tabular_row_estimate_excludes_header() {
        let mut limits = LimitsConfig::default();
        limits.max_csv_rows = 10;
        let p = LimitPolicy::new(limits);
        let csv = FileType::Tabular(TabularFormat::Csv);
        assert_eq!(p.assess(csv, 100, 11).verdict, Verdict::Normal);
        assert_eq!(p.assess(csv, 100, 12).verdict, Verdict::Rejected);
    }

    #[test]
    fn documents_ignore_line_thresholds() {
        let p = policy();
        let md = FileType::Document(DocFormat::Markdown);
        assert_eq!(p.assess(md, 1000, 9000).verdict, Verdict::Normal);
        let rs = FileType::Code(Language::Rust);
        assert_eq!(p.assess(rs, 1000, 9000).verdict, Verdict::Rejected);
    }

    #[test]
    fn repository_cap() {
        let p = policy();
        assert!(p.check_repository(10).is_ok());
        assert!(matches!(
            p.check_repository(u64::MAX),
            Err(SnapError::RepositoryTooLarge { .. })
        ));
    }

    #[test]
    fn cell_cap() {
        let p = policy();
        assert!(p.check_cell(10).is_ok());
        assert!(p.check_cell(p.limits().max_csv_cell_chars + 1).is_err());
    }
}
