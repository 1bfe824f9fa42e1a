// SPDX-License-Identifier: PMPL-1.0-or-later

//! revenant: recurring-vulnerability clone detection for C/C++ code bases.
//!
//! `revenant detect <project>` screens every function of the target project
//! against the configured vulnerability corpus through the four-stage
//! cascade (feature fingerprint, token Jaccard, syntax, trace) and writes a
//! JSON report of the unpatched clones it finds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use revenant::config::Config;
use revenant::dataset::normal::DEFAULT_SAMPLE_SIZE;
use revenant::dataset::{CtagsCarver, NormalSample, OldNewFuncs, TargetProject};
use revenant::features::{BloomStage, BloomStageOptions};
use revenant::pipeline::{self, CancelFlag, PipelineOptions, PipelineStages, StageWidths};
use revenant::store::SideStore;
use revenant::syntax::{SyntaxFilter, SyntaxFilterOptions};
use revenant::token::TokenFilter;
use revenant::trace::{self, TraceTooling};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revenant")]
#[command(version)]
#[command(about = "Recurring-vulnerability clone detection for C/C++ code bases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Suppress the progress bar and per-finding output
    #[arg(long, default_value_t = false, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect unpatched clones of known vulnerable functions in a project
    Detect {
        /// Path to the target project directory
        #[arg(value_name = "PROJECT")]
        project: PathBuf,

        /// Caches to rebuild before the run
        #[arg(long, value_enum, num_args = 0.., default_values_t = vec![RebuildTarget::Target])]
        rebuild: Vec<RebuildTarget>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RebuildTarget {
    #[value(name = "bloomFilter")]
    BloomFilter,
    #[value(name = "old-new-funcs")]
    OldNewFuncs,
    #[value(name = "normal-sample")]
    NormalSample,
    #[value(name = "target")]
    Target,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Detect { project, rebuild } => detect(&project, &rebuild, cli.quiet),
    }
}

fn detect(project: &Path, rebuild: &[RebuildTarget], quiet: bool) -> Result<()> {
    let config = Config::load(Path::new("config.yml"))?;
    let cache_root = PathBuf::from("cache");

    let old_new = OldNewFuncs::open(
        &config.basic.dataset.old_new_func_dataset_path,
        &cache_root,
        rebuild.contains(&RebuildTarget::OldNewFuncs),
    )?;
    let normal = NormalSample::open(
        &config.basic.dataset.normal_sample_dataset_path,
        &cache_root,
        DEFAULT_SAMPLE_SIZE,
        rebuild.contains(&RebuildTarget::NormalSample),
    )?;
    let target = TargetProject::prepare(
        project,
        Path::new("processed"),
        &CtagsCarver::default(),
        rebuild.contains(&RebuildTarget::Target),
    )?;

    info!("start initialization");
    let bloom = Arc::new(BloomStage::initialize(
        &old_new.sample_funcs()?,
        &old_new.non_sample_funcs()?,
        &normal.funcs()?,
        &BloomStageOptions {
            rebuild: rebuild.contains(&RebuildTarget::BloomFilter),
            ..BloomStageOptions::new(&cache_root)
        },
    )?);
    let token = Arc::new(TokenFilter::initialize(
        &old_new.vul_funcs()?,
        config.experiment.token_filter.jaccard_sim_threshold,
    )?);
    let store = Arc::new(SideStore::open(&cache_root.join("store"))?);
    let syntax = Arc::new(SyntaxFilter::initialize(
        old_new.func_pairs()?,
        store.clone(),
        SyntaxFilterOptions {
            ast_sim_threshold_min: config.experiment.trace.ast_sim_threshold_min,
            ast_sim_threshold_max: config.experiment.trace.ast_sim_threshold_max,
            ..SyntaxFilterOptions::default()
        },
    ));
    let trace_stage = trace::build_stage(&TraceTooling {
        codebert_model_path: config.basic.trace.codebert_model_path.clone(),
        joern_path: config.basic.trace.joern_path.clone(),
        redis_host: config.experiment.trace.redis_host.clone(),
        redis_port: config.experiment.trace.redis_port,
    });

    let project_name = project
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let result_dir = PathBuf::from("result").join(&project_name);
    std::fs::create_dir_all(&result_dir)
        .with_context(|| format!("creating {}", result_dir.display()))?;

    let stages = PipelineStages {
        bloom,
        token,
        syntax,
        trace: trace_stage,
        store,
    };
    let options = PipelineOptions {
        widths: StageWidths::from(&config.basic.workers),
        report_path: result_dir.join(format!("{project_name}.json")),
        trace_csv_path: result_dir.join(format!("{project_name}.trace.csv")),
        telemetry_path: result_dir.join(format!("{project_name}.detect_info.json")),
        quiet,
    };

    info!("start detection");
    let funcs = target.funcs()?;
    let output = pipeline::run(&stages, &funcs, &options, &CancelFlag::new())?;

    if !quiet {
        println!();
        if output.report.cnt == 0 {
            println!("{}", "No recurring vulnerabilities detected.".yellow());
        } else {
            println!(
                "{}",
                format!(
                    "{} vulnerable functions detected ({} matching records), report at {}",
                    output.report.cnt,
                    output.report.all,
                    options.report_path.display()
                )
                .green()
                .bold()
            );
        }
    }
    Ok(())
}
