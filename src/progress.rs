//! Envelope rebuild progress reporting.
//!
//! `vparent extents rebuild` walks every child of a group, which can take a
//! while on a large archive. Progress goes to **stderr** so stdout keeps
//! only the final summary.

use std::io::Write;

/// A single progress event for a rebuild.
#[derive(Clone, Debug, PartialEq)]
pub enum RebuildEvent {
    /// Parents locked and loaded; children are being discovered.
    Discovering { group: String, parents: u64 },
    /// `n` children folded so far, out of `total` discovered.
    Applying { group: String, n: u64, total: u64 },
    /// Parents being written back.
    Persisting { group: String, parents: u64 },
}

/// Reports rebuild progress. Implementations write to stderr (human or JSON).
pub trait RebuildReporter: Send + Sync {
    fn report(&self, event: RebuildEvent);
}

/// Human-friendly progress: "rebuild S1A  applying  1,234 / 5,000 children".
pub struct StderrProgress;

impl RebuildReporter for StderrProgress {
    fn report(&self, event: RebuildEvent) {
        let line = match &event {
            RebuildEvent::Discovering { group, parents } => format!(
                "rebuild {}  discovering children of {} parents...\n",
                group,
                format_number(*parents)
            ),
            RebuildEvent::Applying { group, n, total } => format!(
                "rebuild {}  applying  {} / {} children\n",
                group,
                format_number(*n),
                format_number(*total)
            ),
            RebuildEvent::Persisting { group, parents } => format!(
                "rebuild {}  writing {} parents\n",
                group,
                format_number(*parents)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl RebuildReporter for JsonProgress {
    fn report(&self, event: RebuildEvent) {
        let obj = match &event {
            RebuildEvent::Discovering { group, parents } => serde_json::json!({
                "event": "progress",
                "group": group,
                "phase": "discovering",
                "parents": parents
            }),
            RebuildEvent::Applying { group, n, total } => serde_json::json!({
                "event": "progress",
                "group": group,
                "phase": "applying",
                "n": n,
                "total": total
            }),
            RebuildEvent::Persisting { group, parents } => serde_json::json!({
                "event": "progress",
                "group": group,
                "phase": "persisting",
                "parents": parents
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl RebuildReporter for NoProgress {
    fn report(&self, _event: RebuildEvent) {}
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

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RebuildReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
