//! Build progress reporting.
//!
//! Stage transitions and embedding batch progress are emitted on **stderr**
//! so stdout stays free for callers that pipe build output. The reporter is
//! separate from `tracing` logging: it is meant for a human (or a wrapper
//! script) watching a long build.

use serde::Serialize;
use std::io::Write;

/// Stage of a build job, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    Ingested,
    SchemaAnalysis,
    Embeddings,
    Snapshot,
    Validation,
    Summaries,
    Report,
    Done,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Ingested => "ingested",
            BuildStage::SchemaAnalysis => "schema-analysis",
            BuildStage::Embeddings => "embeddings",
            BuildStage::Snapshot => "snapshot",
            BuildStage::Validation => "validation",
            BuildStage::Summaries => "summaries",
            BuildStage::Report => "report",
            BuildStage::Done => "done",
        }
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event for a build.
#[derive(Clone, Debug)]
pub enum BuildProgressEvent {
    /// A stage started.
    Stage { job_id: String, stage: BuildStage },
    /// `n` of `total` embedding batches finished (successfully or not).
    EmbeddingBatches { job_id: String, n: u64, total: u64 },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "build 1a2b…  embeddings  12 / 40 batches".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Stage { job_id, stage } => {
                format!("build {}  {}\n", short_id(job_id), stage)
            }
            BuildProgressEvent::EmbeddingBatches { job_id, n, total } => format!(
                "build {}  embeddings  {} / {} batches\n",
                short_id(job_id),
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Stage { job_id, stage } => serde_json::json!({
                "event": "stage",
                "jobId": job_id,
                "stage": stage,
            }),
            BuildProgressEvent::EmbeddingBatches { job_id, n, total } => serde_json::json!({
                "event": "progress",
                "jobId": job_id,
                "stage": BuildStage::Embeddings,
                "n": n,
                "total": total,
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

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
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

/// Progress mode: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum ProgressMode {
    #[default]
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

    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
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
    fn stage_names_are_kebab_case() {
        assert_eq!(BuildStage::SchemaAnalysis.as_str(), "schema-analysis");
        assert_eq!(
            serde_json::to_value(BuildStage::SchemaAnalysis).unwrap(),
            serde_json::json!("schema-analysis")
        );
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
