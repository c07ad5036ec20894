//! Processing run progress reporting.
//!
//! Reports what a `snap process` run is doing (state transitions, files
//! parsed out of files dispatched) so users can follow long runs. Progress
//! is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::manifest::RunState;

/// A single progress event for a processing run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// The run entered a new state.
    State { project: String, state: RunState },
    /// n of total dispatched files have finished parsing.
    Parsing { project: String, n: u64, total: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "process alpha  parsing  120 / 1,500 files".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::State { project, state } => {
                format!("process {}  {}\n", project, state.as_str().to_ascii_lowercase())
            }
            RunProgressEvent::Parsing { project, n, total } => format!(
                "process {}  parsing  {} / {} files\n",
                project,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::State { project, state } => serde_json::json!({
                "event": "state",
                "project_id": project,
                "state": state,
            }),
            RunProgressEvent::Parsing { project, n, total } => serde_json::json!({
                "event": "progress",
                "project_id": project,
                "phase": "parsing",
                "n": n,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
