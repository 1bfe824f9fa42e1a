// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core type definitions shared across the detection pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One target function travelling through the pipeline.
///
/// `candidates` is empty until the token stage attaches the surviving
/// vulnerability identifiers; later stages only ever prune it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    /// Purified source text of the function.
    pub code: String,
    /// Stable identifier, unique per function within one run.
    pub path: String,
    /// Vulnerability identifiers still considered plausible.
    pub candidates: Vec<String>,
}

impl FunctionRecord {
    pub fn new(code: String, path: String) -> Self {
        Self {
            code,
            path,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// Typed queue item: payload or the end-of-stream sentinel.
///
/// The sentinel is totalised: it is the last message any stage reads or
/// writes on a queue, exactly once per stage per run.
#[derive(Debug, Clone)]
pub enum Message {
    Data(FunctionRecord),
    EndOfStream,
}

/// One vulnerable/patched function pair, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnPair {
    /// Identifier of the vulnerable sample (its cached file name).
    pub vuln_id: String,
    /// CVE extracted from `vuln_id`.
    pub cve_id: String,
    pub vuln_path: PathBuf,
    pub patch_path: PathBuf,
}

/// Pipeline stages as seen by the telemetry aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSource {
    Dataset,
    Bloom,
    Token,
    Syntax,
    Trace,
}

impl std::fmt::Display for StageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageSource::Dataset => write!(f, "dataset"),
            StageSource::Bloom => write!(f, "bloom"),
            StageSource::Token => write!(f, "token"),
            StageSource::Syntax => write!(f, "syntax"),
            StageSource::Trace => write!(f, "trace"),
        }
    }
}

/// Typed telemetry event, one per stage completion.
#[derive(Debug, Clone, Copy)]
pub enum TelemetryEvent {
    /// `passed` is true when the item was promoted downstream.
    Stage { source: StageSource, passed: bool },
    /// Emitted once by the final stage after its sentinel.
    EndOfDetection,
}

/// One detected function in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: usize,
    pub dst: String,
    pub sim: Vec<String>,
}

/// The JSON report written by the vulnerable-function sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Number of detected functions.
    pub cnt: usize,
    /// Total number of matched vulnerability records.
    pub all: usize,
    pub vul: Vec<Finding>,
}

/// One syntax-stage attempt, dumped to the trace CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceAttempt {
    pub target_file: String,
    pub vuln_file: String,
    pub patch_file: String,
    /// Ordered check outcomes, `|`-joined (del/add line checks, AST ratios).
    pub detail: String,
    pub predict: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_start_empty() {
        let rec = FunctionRecord::new("int f() {}".into(), "a.c".into());
        assert!(rec.candidates.is_empty());
    }

    #[test]
    fn stage_source_display() {
        assert_eq!(StageSource::Bloom.to_string(), "bloom");
        assert_eq!(StageSource::Trace.to_string(), "trace");
    }
}
