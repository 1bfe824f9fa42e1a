// SPDX-License-Identifier: PMPL-1.0-or-later

//! Run-output sinks: the vulnerable-function JSON report and the CSV trace
//! of every syntax-stage attempt. Both rewrite their file on every record so
//! a killed run still leaves usable output behind.

use crate::types::{DetectionReport, Finding, Message, TraceAttempt};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use crossbeam_channel::Receiver;
use std::fs;
use std::path::Path;
use tracing::info;

/// Messages on the trace-CSV queue.
pub enum TraceCsvMessage {
    Row(TraceAttempt),
    End,
}

/// Collect detected functions until the sentinel, dumping the report
/// incrementally.
pub fn collect_report(
    input: Receiver<Message>,
    output_path: &Path,
    quiet: bool,
) -> Result<DetectionReport> {
    let mut report = DetectionReport::default();
    loop {
        match input.recv() {
            Ok(Message::Data(record)) => {
                report.cnt += 1;
                report.all += record.candidates.len();
                if !quiet {
                    println!(
                        "{}",
                        format!("[No. {}] vulnerability detected in {}", report.cnt, record.path)
                            .green()
                            .bold()
                    );
                    for vuln in &record.candidates {
                        println!("{}", format!("    similar to {vuln}").green());
                    }
                }
                report.vul.push(Finding {
                    id: report.cnt,
                    dst: record.path,
                    sim: record.candidates,
                });
                write_report(&report, output_path)?;
            }
            Ok(Message::EndOfStream) => break,
            Err(_) => bail!("vulnerable-function queue closed without a sentinel"),
        }
    }
    write_report(&report, output_path)?;
    info!("detection report written to {}", output_path.display());
    Ok(report)
}

fn write_report(report: &DetectionReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Collect every syntax-stage attempt into the trace CSV.
pub fn collect_trace_csv(input: Receiver<TraceCsvMessage>, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    let mut rows = 0usize;
    loop {
        match input.recv() {
            Ok(TraceCsvMessage::Row(attempt)) => {
                writer.serialize(&attempt)?;
                writer.flush()?;
                rows += 1;
            }
            Ok(TraceCsvMessage::End) => break,
            Err(_) => bail!("trace queue closed without a terminator"),
        }
    }
    writer.flush()?;
    Ok(rows)
}
