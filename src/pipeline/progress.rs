// SPDX-License-Identifier: PMPL-1.0-or-later

//! Telemetry aggregator: one consumer for the per-stage completion events,
//! driving the progress bar and the end-of-run snapshot.
//!
//! Per-stage wall time is measured by queue occupancy: a stage's timer runs
//! only while it has unfinished input, so idle stages do not accumulate
//! elapsed time.

use crate::types::{StageSource, TelemetryEvent};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StageInfo {
    input: u64,
    done: u64,
    offset: f64,
    start: Instant,
    last: Instant,
}

impl StageInfo {
    fn new(now: Instant) -> Self {
        Self {
            input: 0,
            done: 0,
            offset: 0.0,
            start: now,
            last: now,
        }
    }

    fn start_timer(&mut self) {
        self.start = Instant::now();
        self.last = self.start;
    }

    fn stop_timer(&mut self) {
        self.offset += self.start.elapsed().as_secs_f64();
        self.start = Instant::now();
        self.last = self.start;
    }

    fn record_time(&mut self) {
        self.last = Instant::now();
    }

    fn elapsed(&self) -> f64 {
        if self.done >= self.input {
            self.offset
        } else {
            self.offset + (self.last - self.start).as_secs_f64()
        }
    }

    fn speed(&self) -> f64 {
        self.done as f64 / self.elapsed().max(1e-3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub input: u64,
    pub done: u64,
    pub elapsed_secs: f64,
    /// Fraction of completed items promoted to the next stage.
    pub pass_rate: f64,
    pub per_sec: f64,
}

/// End-of-run counters, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub finished_at: String,
    pub detected: u64,
    pub bloom: StageSnapshot,
    pub token: StageSnapshot,
    pub syntax: StageSnapshot,
    pub trace: StageSnapshot,
    /// Projected trace throughput in functions per hour.
    pub trace_per_hour: f64,
}

/// Consume telemetry events until the end-of-detection marker, then persist
/// the snapshot.
pub fn run_aggregator(
    events: Receiver<TelemetryEvent>,
    total: u64,
    snapshot_path: &Path,
    quiet: bool,
) -> Result<TelemetrySnapshot> {
    let now = Instant::now();
    let mut bloom = StageInfo::new(now);
    let mut token = StageInfo::new(now);
    let mut syntax = StageInfo::new(now);
    let mut trace = StageInfo::new(now);
    let mut detected: u64 = 0;

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total)
    };
    if let Ok(style) = ProgressStyle::with_template("{pos}/{len} ~{eta} [{per_sec}] {msg}") {
        bar.set_style(style);
    }

    loop {
        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                bail!("telemetry queue closed before the end-of-detection marker")
            }
        };
        match event {
            Some(TelemetryEvent::Stage { source, passed }) => match source {
                StageSource::Dataset => {
                    if bloom.input == bloom.done {
                        bloom.start_timer();
                    }
                    bloom.input += 1;
                }
                StageSource::Bloom => {
                    finish_one(&mut bloom);
                    if passed {
                        if token.input == token.done {
                            token.start_timer();
                        }
                        token.input += 1;
                    } else {
                        bar.inc(1);
                    }
                }
                StageSource::Token => {
                    finish_one(&mut token);
                    if passed {
                        if syntax.input == syntax.done {
                            syntax.start_timer();
                        }
                        syntax.input += 1;
                    } else {
                        bar.inc(1);
                    }
                }
                StageSource::Syntax => {
                    finish_one(&mut syntax);
                    if passed {
                        if trace.input == trace.done {
                            trace.start_timer();
                        }
                        trace.input += 1;
                    } else {
                        bar.inc(1);
                    }
                }
                StageSource::Trace => {
                    finish_one(&mut trace);
                    bar.inc(1);
                    if passed {
                        detected += 1;
                    }
                }
            },
            Some(TelemetryEvent::EndOfDetection) => break,
            None => {}
        }

        bar.set_message(postfix(&bloom, &token, &syntax, &trace, detected));
    }
    bar.finish_and_clear();

    let snapshot = TelemetrySnapshot {
        finished_at: chrono::Utc::now().to_rfc3339(),
        detected,
        bloom: stage_snapshot(&bloom, token.input),
        token: stage_snapshot(&token, syntax.input),
        syntax: stage_snapshot(&syntax, trace.input),
        trace: stage_snapshot(&trace, detected),
        trace_per_hour: 3600.0 * trace.speed(),
    };
    if let Some(parent) = snapshot_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(snapshot_path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("writing {}", snapshot_path.display()))?;
    Ok(snapshot)
}

fn finish_one(info: &mut StageInfo) {
    info.done += 1;
    if info.input <= info.done {
        info.stop_timer();
    }
    info.record_time();
}

fn stage_snapshot(info: &StageInfo, promoted: u64) -> StageSnapshot {
    StageSnapshot {
        input: info.input,
        done: info.done,
        elapsed_secs: info.elapsed(),
        pass_rate: promoted as f64 / info.done.max(1) as f64,
        per_sec: info.speed(),
    }
}

fn postfix(
    bloom: &StageInfo,
    token: &StageInfo,
    syntax: &StageInfo,
    trace: &StageInfo,
    detected: u64,
) -> String {
    let bloom_pass = token.input as f64 / bloom.done.max(1) as f64;
    let token_pass = syntax.input as f64 / token.done.max(1) as f64;
    let syntax_pass = trace.input as f64 / syntax.done.max(1) as f64;
    format!(
        "bloom:{}/{}({:.1}%,{:.1}f/s) token:{}/{}({:.1}%,{:.2}f/s) syntax:{}/{}({:.1}%,{:.2}f/s) trace:{}/{}({},{:.1}f/h)",
        bloom.done,
        bloom.input,
        100.0 * (1.0 - bloom_pass),
        bloom.speed(),
        token.done,
        token.input,
        100.0 * (1.0 - token_pass),
        token.speed(),
        syntax.done,
        syntax.input,
        100.0 * (1.0 - syntax_pass),
        syntax.speed(),
        trace.done,
        trace.input,
        detected,
        3600.0 * trace.speed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn counts_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detect_info.json");
        let (tx, rx) = bounded(100);

        // Three functions enter; one passes bloom and token, is filtered by
        // syntax; the others are filtered by bloom.
        for _ in 0..3 {
            tx.send(TelemetryEvent::Stage {
                source: StageSource::Dataset,
                passed: false,
            })
            .unwrap();
        }
        tx.send(TelemetryEvent::Stage {
            source: StageSource::Bloom,
            passed: true,
        })
        .unwrap();
        for _ in 0..2 {
            tx.send(TelemetryEvent::Stage {
                source: StageSource::Bloom,
                passed: false,
            })
            .unwrap();
        }
        tx.send(TelemetryEvent::Stage {
            source: StageSource::Token,
            passed: true,
        })
        .unwrap();
        tx.send(TelemetryEvent::Stage {
            source: StageSource::Syntax,
            passed: false,
        })
        .unwrap();
        tx.send(TelemetryEvent::EndOfDetection).unwrap();

        let snapshot = run_aggregator(rx, 3, &path, true).unwrap();
        assert_eq!(snapshot.bloom.input, 3);
        assert_eq!(snapshot.bloom.done, 3);
        assert_eq!(snapshot.token.input, 1);
        assert_eq!(snapshot.token.done, 1);
        assert_eq!(snapshot.syntax.done, 1);
        assert_eq!(snapshot.trace.input, 0);
        assert_eq!(snapshot.detected, 0);
        assert!(path.exists());

        let reloaded: TelemetrySnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.bloom.done, 3);
    }

    #[test]
    fn disconnect_without_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = bounded::<TelemetryEvent>(10);
        drop(tx);
        assert!(run_aggregator(rx, 1, &dir.path().join("x.json"), true).is_err());
    }
}
