// SPDX-License-Identifier: PMPL-1.0-or-later

//! The detection orchestrator: bounded queues, one worker pool per stage,
//! end-of-stream propagation and telemetry.
//!
//! Each stage runs a dispatcher thread feeding a pool of workers through an
//! internal bounded channel sized to the pool width; a saturated pool blocks
//! the dispatcher and a full downstream queue blocks the workers, so a slow
//! stage throttles everything upstream. On reading the sentinel a stage
//! stops dispatching, waits for its in-flight items, forwards exactly one
//! sentinel and exits.

pub mod progress;
pub mod sink;

pub use progress::{run_aggregator, StageSnapshot, TelemetrySnapshot};
pub use sink::TraceCsvMessage;

use crate::config::WorkersConfig;
use crate::features::BloomStage;
use crate::store::SideStore;
use crate::syntax::SyntaxFilter;
use crate::token::TokenFilter;
use crate::trace::TraceStage;
use crate::types::{
    DetectionReport, FunctionRecord, Message, StageSource, TelemetryEvent,
};
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Queue bounds, tuned to the bloom/token/syntax/trace throughput ratios.
pub const DATASET_QUEUE_CAP: usize = 100;
pub const BLOOM_OUT_CAP: usize = 2000;
pub const TOKEN_OUT_CAP: usize = 1000;
pub const SYNTAX_OUT_CAP: usize = 100;
pub const VULNERABLE_QUEUE_CAP: usize = 100;
pub const TRACE_CSV_CAP: usize = 100;
pub const TELEMETRY_CAP: usize = 100;

/// Per-stage worker-pool widths.
#[derive(Debug, Clone)]
pub struct StageWidths {
    pub bloom: usize,
    pub token: usize,
    pub syntax: usize,
    pub trace: usize,
}

impl From<&WorkersConfig> for StageWidths {
    fn from(workers: &WorkersConfig) -> Self {
        Self {
            bloom: workers.bloom_filter,
            token: workers.token,
            syntax: workers.syntax,
            trace: workers.trace,
        }
    }
}

/// Cooperative cancellation signal owned by the orchestrator; workers check
/// it between items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The immutable stage handles, built once at initialisation.
pub struct PipelineStages {
    pub bloom: Arc<BloomStage>,
    pub token: Arc<TokenFilter>,
    pub syntax: Arc<SyntaxFilter>,
    pub trace: Arc<dyn TraceStage>,
    pub store: Arc<SideStore>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub widths: StageWidths,
    pub report_path: PathBuf,
    pub trace_csv_path: PathBuf,
    pub telemetry_path: PathBuf,
    pub quiet: bool,
}

/// Outputs of one detection run.
pub struct RunOutput {
    pub report: DetectionReport,
    pub telemetry: TelemetrySnapshot,
    pub trace_rows: usize,
}

type StageJob<'env> = Box<dyn Fn(FunctionRecord) -> Result<Option<FunctionRecord>> + Send + Sync + 'env>;

/// Run the full pipeline over the prepared target functions.
pub fn run(
    stages: &PipelineStages,
    funcs: &[PathBuf],
    options: &PipelineOptions,
    cancel: &CancelFlag,
) -> Result<RunOutput> {
    let (q0_tx, q0_rx) = bounded::<Message>(DATASET_QUEUE_CAP);
    let (q1_tx, q1_rx) = bounded::<Message>(BLOOM_OUT_CAP);
    let (q2_tx, q2_rx) = bounded::<Message>(TOKEN_OUT_CAP);
    let (q3_tx, q3_rx) = bounded::<Message>(SYNTAX_OUT_CAP);
    let (vul_tx, vul_rx) = bounded::<Message>(VULNERABLE_QUEUE_CAP);
    let (csv_tx, csv_rx) = bounded::<TraceCsvMessage>(TRACE_CSV_CAP);
    let (telemetry_tx, telemetry_rx) = bounded::<TelemetryEvent>(TELEMETRY_CAP);

    info!("starting detection over {} target functions", funcs.len());

    thread::scope(|scope| -> Result<RunOutput> {
        let aggregator = {
            let telemetry_path = options.telemetry_path.clone();
            let quiet = options.quiet;
            let total = funcs.len() as u64;
            scope.spawn(move || run_aggregator(telemetry_rx, total, &telemetry_path, quiet))
        };
        let report_sink = {
            let report_path = options.report_path.clone();
            let quiet = options.quiet;
            scope.spawn(move || sink::collect_report(vul_rx, &report_path, quiet))
        };
        let csv_sink = {
            let csv_path = options.trace_csv_path.clone();
            scope.spawn(move || sink::collect_trace_csv(csv_rx, &csv_path))
        };

        let producer = {
            let telemetry = telemetry_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || -> Result<()> {
                for path in funcs {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let code = match fs::read_to_string(path) {
                        Ok(code) => code,
                        Err(err) => {
                            warn!("skipping unreadable target {}: {err}", path.display());
                            continue;
                        }
                    };
                    telemetry
                        .send(TelemetryEvent::Stage {
                            source: StageSource::Dataset,
                            passed: false,
                        })
                        .ok();
                    q0_tx
                        .send(Message::Data(FunctionRecord::new(
                            code,
                            path.to_string_lossy().into_owned(),
                        )))
                        .map_err(|_| anyhow!("dataset queue closed"))?;
                }
                q0_tx
                    .send(Message::EndOfStream)
                    .map_err(|_| anyhow!("dataset queue closed"))?;
                Ok(())
            })
        };

        let bloom_stage = {
            let bloom = stages.bloom.clone();
            let telemetry = telemetry_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                run_stage(
                    StageSource::Bloom,
                    options.widths.bloom,
                    q0_rx,
                    q1_tx,
                    telemetry,
                    cancel,
                    Box::new(move |record| {
                        if bloom.detect(&record.code) {
                            Ok(Some(record))
                        } else {
                            Ok(None)
                        }
                    }),
                    || {},
                )
            })
        };

        let token_stage = {
            let token = stages.token.clone();
            let telemetry = telemetry_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                run_stage(
                    StageSource::Token,
                    options.widths.token,
                    q1_rx,
                    q2_tx,
                    telemetry,
                    cancel,
                    Box::new(move |record| {
                        let candidates = token.detect(&record.code);
                        if candidates.is_empty() {
                            Ok(None)
                        } else {
                            Ok(Some(record.with_candidates(candidates)))
                        }
                    }),
                    || {},
                )
            })
        };

        let syntax_stage = {
            let syntax = stages.syntax.clone();
            let telemetry = telemetry_tx.clone();
            let cancel = cancel.clone();
            let fast_path = vul_tx.clone();
            let attempts_out = csv_tx.clone();
            scope.spawn(move || {
                run_stage(
                    StageSource::Syntax,
                    options.widths.syntax,
                    q2_rx,
                    q3_tx,
                    telemetry,
                    cancel,
                    Box::new(move |record| {
                        let outcome =
                            syntax.evaluate(&record.code, &record.path, &record.candidates)?;
                        for attempt in outcome.attempts {
                            attempts_out
                                .send(TraceCsvMessage::Row(attempt))
                                .map_err(|_| anyhow!("trace csv queue closed"))?;
                        }
                        for vuln_id in outcome.fast_path {
                            fast_path
                                .send(Message::Data(FunctionRecord {
                                    code: record.code.clone(),
                                    path: record.path.clone(),
                                    candidates: vec![vuln_id],
                                }))
                                .map_err(|_| anyhow!("vulnerable-function queue closed"))?;
                        }
                        if outcome.forwarded.is_empty() {
                            Ok(None)
                        } else {
                            Ok(Some(record.with_candidates(outcome.forwarded)))
                        }
                    }),
                    || {},
                )
            })
        };

        let trace_stage = {
            let trace = stages.trace.clone();
            let store = stages.store.clone();
            let telemetry = telemetry_tx.clone();
            let cancel = cancel.clone();
            let end_telemetry = telemetry_tx.clone();
            let end_csv = csv_tx.clone();
            scope.spawn(move || {
                run_stage(
                    StageSource::Trace,
                    options.widths.trace,
                    q3_rx,
                    vul_tx,
                    telemetry,
                    cancel,
                    Box::new(move |record| {
                        let candidates: Vec<String> = record
                            .candidates
                            .iter()
                            .filter(|candidate| !store.is_error_func(candidate))
                            .cloned()
                            .collect();
                        if candidates.is_empty() {
                            return Ok(None);
                        }
                        match trace.confirm(&record.code, &record.path, &candidates) {
                            Ok(confirmed) if confirmed.is_empty() => Ok(None),
                            Ok(confirmed) => Ok(Some(record.with_candidates(confirmed))),
                            Err(err) => {
                                warn!("trace stage failed on {}: {err:#}", record.path);
                                for candidate in &candidates {
                                    store.set_error_func(candidate);
                                }
                                Ok(None)
                            }
                        }
                    }),
                    move || {
                        end_telemetry.send(TelemetryEvent::EndOfDetection).ok();
                        end_csv.send(TraceCsvMessage::End).ok();
                    },
                )
            })
        };

        // The scope keeps its own clones alive; drop them so the sinks see
        // disconnection only if a stage dies without its sentinel.
        drop(telemetry_tx);
        drop(csv_tx);

        producer
            .join()
            .map_err(|_| anyhow!("dataset producer panicked"))??;
        for (name, handle) in [
            ("bloom", bloom_stage),
            ("token", token_stage),
            ("syntax", syntax_stage),
            ("trace", trace_stage),
        ] {
            handle
                .join()
                .map_err(|_| anyhow!("{name} stage panicked"))??;
        }
        let report = report_sink
            .join()
            .map_err(|_| anyhow!("report sink panicked"))??;
        let trace_rows = csv_sink
            .join()
            .map_err(|_| anyhow!("trace csv sink panicked"))??;
        let telemetry = aggregator
            .join()
            .map_err(|_| anyhow!("telemetry aggregator panicked"))??;

        stages.store.flush()?;
        info!("detection complete: {} findings", report.cnt);
        Ok(RunOutput {
            report,
            telemetry,
            trace_rows,
        })
    })
}

/// Generic stage driver: a dispatcher thread pulling from `input` plus
/// `width` workers. Filtered items die here; promoted items go to `output`.
/// The sentinel is forwarded exactly once, after the pool has drained.
#[allow(clippy::too_many_arguments)]
fn run_stage<'env>(
    source: StageSource,
    width: usize,
    input: Receiver<Message>,
    output: Sender<Message>,
    telemetry: Sender<TelemetryEvent>,
    cancel: CancelFlag,
    job: StageJob<'env>,
    epilogue: impl FnOnce(),
) -> Result<()> {
    let width = width.max(1);
    let (work_tx, work_rx) = bounded::<FunctionRecord>(width);
    let job = &job;

    thread::scope(|scope| -> Result<()> {
        let mut workers = Vec::with_capacity(width);
        for _ in 0..width {
            let work_rx = work_rx.clone();
            let output = output.clone();
            let telemetry = telemetry.clone();
            let cancel = cancel.clone();
            workers.push(scope.spawn(move || -> Result<()> {
                for record in work_rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let path = record.path.clone();
                    let outcome = job(record);
                    let passed = matches!(outcome, Ok(Some(_)));
                    telemetry
                        .send(TelemetryEvent::Stage { source, passed })
                        .ok();
                    match outcome {
                        Ok(Some(promoted)) => {
                            output
                                .send(Message::Data(promoted))
                                .map_err(|_| anyhow!("{source} output queue closed"))?;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("{source} worker failed on {path}: {err:#}");
                        }
                    }
                }
                Ok(())
            }));
        }
        drop(work_rx);

        let mut sentinel_seen = false;
        for message in input.iter() {
            match message {
                Message::Data(record) => {
                    work_tx
                        .send(record)
                        .map_err(|_| anyhow!("{source} worker pool closed"))?;
                }
                Message::EndOfStream => {
                    sentinel_seen = true;
                    break;
                }
            }
        }
        drop(work_tx);
        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow!("{source} worker panicked"))??;
        }
        if !sentinel_seen {
            bail!("{source} input closed without a sentinel");
        }
        output
            .send(Message::EndOfStream)
            .map_err(|_| anyhow!("{source} output queue closed"))?;
        Ok(())
    })?;

    info!("{source} stage finished");
    epilogue();
    Ok(())
}
