//! Upload progress reporting.
//!
//! Reports observable progress during `ragcli upload` so users see which
//! stage a document is in and how much embedding work is left. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::time::Duration;

/// Embedding progress of one `batch_embed` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchProgress {
    pub done: u64,
    pub total: u64,
    /// Estimated time remaining, once at least one item has completed.
    pub eta: Option<Duration>,
}

/// A single progress event for an upload.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Fraction of the text chunked so far.
    Chunking { document: String, fraction: f64 },
    /// Chunks embedded so far.
    Embedding {
        document: String,
        progress: BatchProgress,
    },
    /// Vectors are being written to the index.
    Indexing { document: String, vectors: u64 },
}

/// Reports upload progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "upload notes.md  embedding  120 / 480 chunks  eta 14s".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Chunking { document, fraction } => {
                format!("upload {}  chunking  {:.0}%\n", document, fraction * 100.0)
            }
            ProgressEvent::Embedding { document, progress } => {
                let eta = progress
                    .eta
                    .map(|d| format!("  eta {}", format_duration(d)))
                    .unwrap_or_default();
                format!(
                    "upload {}  embedding  {} / {} chunks{}\n",
                    document,
                    format_number(progress.done),
                    format_number(progress.total),
                    eta
                )
            }
            ProgressEvent::Indexing { document, vectors } => {
                format!(
                    "upload {}  indexing  {} vectors\n",
                    document,
                    format_number(*vectors)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Chunking { document, fraction } => serde_json::json!({
                "event": "progress",
                "document": document,
                "phase": "chunking",
                "fraction": fraction
            }),
            ProgressEvent::Embedding { document, progress } => serde_json::json!({
                "event": "progress",
                "document": document,
                "phase": "embedding",
                "n": progress.done,
                "total": progress.total,
                "eta_secs": progress.eta.map(|d| d.as_secs_f64())
            }),
            ProgressEvent::Indexing { document, vectors } => serde_json::json!({
                "event": "progress",
                "document": document,
                "phase": "indexing",
                "vectors": vectors
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Exponential moving average of per-item latency, used for ETAs.
#[derive(Debug, Clone, Copy)]
pub struct EtaEstimator {
    alpha: f64,
    avg_secs: Option<f64>,
}

impl EtaEstimator {
    pub const DEFAULT_ALPHA: f64 = 0.2;

    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            avg_secs: None,
        }
    }

    pub fn observe(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64();
        self.avg_secs = Some(match self.avg_secs {
            Some(avg) => self.alpha * sample + (1.0 - self.alpha) * avg,
            None => sample,
        });
    }

    /// Remaining time for `remaining` items spread across `workers`.
    pub fn eta(&self, remaining: u64, workers: usize) -> Option<Duration> {
        let avg = self.avg_secs?;
        let secs = avg * remaining as f64 / workers.max(1) as f64;
        Some(Duration::from_secs_f64(secs))
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA)
    }
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

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
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

    #[test]
    fn format_duration_minutes() {
        assert_eq!(format_duration(Duration::from_secs(14)), "14s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }

    #[test]
    fn eta_uses_moving_average_and_workers() {
        let mut eta = EtaEstimator::default();
        assert_eq!(eta.eta(10, 2), None);

        eta.observe(Duration::from_secs(1));
        assert_eq!(eta.eta(10, 2), Some(Duration::from_secs(5)));

        // 0.2 * 6 + 0.8 * 1 = 2.0
        eta.observe(Duration::from_secs(6));
        let remaining = eta.eta(4, 4).unwrap();
        assert!((remaining.as_secs_f64() - 2.0).abs() < 1e-9);
    }
}
