//! System statistics overview.
//!
//! Summarises what the snapshot store holds across all projects: project
//! count, snapshot totals per type, and when anything was last processed.
//! Used by `snap stats`. No record content is shown.

use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::config::Config;
use crate::store::SystemMetrics;

/// Render `metrics` as the `snap stats` report.
pub fn render_stats(config: &Config, metrics: &SystemMetrics) -> String {
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "Snapshot Harness: Store Stats");
    let _ = writeln!(out, "=============================");
    let _ = writeln!(out);
    let _ = writeln!(out, "  Database:    {}", config.db.path.display());
    let _ = writeln!(out, "  Size:        {}", format_bytes(db_size));
    let _ = writeln!(out);
    let _ = writeln!(out, "  Projects:    {}", metrics.project_count);
    let _ = writeln!(out, "  Snapshots:   {}", metrics.total_snapshots);
    let _ = writeln!(
        out,
        "  Last run:    {}",
        metrics
            .last_processed_at
            .map(format_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    if metrics.total_snapshots > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "  By type:");
        let _ = writeln!(out, "  {:<16} {:>10}", "TYPE", "SNAPSHOTS");
        let _ = writeln!(out, "  {}", "-".repeat(27));
        for (t, count) in metrics.counts_by_type.iter().filter(|(_, c)| **c > 0) {
            let _ = writeln!(out, "  {:<16} {:>10}", t.as_str(), count);
        }
    }
    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time ("3 hours ago"); absolute beyond 30 days or in the future.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotType;
    use chrono::Duration;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        assert_eq!(format_relative(Utc::now()), "just now");
        assert_eq!(format_relative(Utc::now() - Duration::minutes(1)), "1 min ago");
        assert_eq!(format_relative(Utc::now() - Duration::hours(3)), "3 hours ago");
    }

    #[test]
    fn report_lists_only_present_types() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let mut counts: std::collections::BTreeMap<SnapshotType, u64> =
            SnapshotType::ALL.iter().map(|t| (*t, 0)).collect();
        counts.insert(SnapshotType::Functions, 7);
        let metrics = SystemMetrics {
            project_count: 2,
            total_snapshots: 7,
            counts_by_type: counts,
            last_processed_at: None,
        };
        let report = render_stats(&config, &metrics);
        assert!(report.contains("Projects:    2"));
        assert!(report.contains("functions"));
        assert!(!report.contains("csv_schema"));
        assert!(report.contains("Last run:    never"));
    }
}
