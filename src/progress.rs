//! Export progress reporting.
//!
//! Reports what the exporter is doing during `bbs-export export` so users
//! can follow long runs: which repository, which stage, and how many pull
//! requests are done. Progress goes to **stderr** so the stdout summary
//! stays parseable for scripts.

use std::fmt;
use std::io::Write;

/// Stage of a repository export.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportPhase {
    /// Users, the owning project and repository metadata.
    Metadata,
    /// `git clone --mirror` of the repository.
    Mirroring,
    /// Group permissions as teams.
    Teams,
    /// Tags as releases.
    Tags,
    /// Branch restrictions as protected branches.
    BranchPermissions,
    /// Collecting pull requests that have commits.
    PreparingPullRequests,
}

impl ExportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportPhase::Metadata => "metadata",
            ExportPhase::Mirroring => "mirroring",
            ExportPhase::Teams => "teams",
            ExportPhase::Tags => "tags",
            ExportPhase::BranchPermissions => "branch permissions",
            ExportPhase::PreparingPullRequests => "preparing pull requests",
        }
    }
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ExportProgressEvent {
    Phase {
        repository: String,
        phase: ExportPhase,
    },
    /// n pull requests exported out of total.
    PullRequests {
        repository: String,
        n: u64,
        total: u64,
    },
}

/// Reports export progress. Implementations write to stderr (human or JSON).
pub trait ExportProgressReporter: Send + Sync {
    fn report(&self, event: ExportProgressEvent);
}

/// Human-friendly progress on stderr: "export MIGR/hugo  pull requests  12 / 1,204".
pub struct StderrProgress;

impl ExportProgressReporter for StderrProgress {
    fn report(&self, event: ExportProgressEvent) {
        let line = match &event {
            ExportProgressEvent::Phase { repository, phase } => {
                format!("export {}  {}...\n", repository, phase)
            }
            ExportProgressEvent::PullRequests { repository, n, total } => format!(
                "export {}  pull requests  {} / {}\n",
                repository,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ExportProgressReporter for JsonProgress {
    fn report(&self, event: ExportProgressEvent) {
        let obj = match &event {
            ExportProgressEvent::Phase { repository, phase } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": phase.as_str(),
            }),
            ExportProgressEvent::PullRequests { repository, n, total } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "pull_requests",
                "n": n,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ExportProgressReporter for NoProgress {
    fn report(&self, _event: ExportProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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

    pub fn reporter(&self) -> Box<dyn ExportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
