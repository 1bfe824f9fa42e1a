// SPDX-License-Identifier: PMPL-1.0-or-later

//! Run configuration loaded from `config.yml`.
//!
//! A missing file is a fatal startup error: a commented template is written
//! next to the binary and the caller is expected to exit non-zero.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub basic: BasicConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BasicConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub trace: TraceToolsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatasetConfig {
    pub old_new_func_dataset_path: PathBuf,
    pub normal_sample_dataset_path: PathBuf,
}

/// Locations of the external tools consumed by the trace stage only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TraceToolsConfig {
    #[serde(default)]
    pub codebert_model_path: PathBuf,
    #[serde(default)]
    pub joern_path: PathBuf,
}

/// Per-stage worker-pool widths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_bloom_workers")]
    pub bloom_filter: usize,
    #[serde(default = "default_token_workers")]
    pub token: usize,
    #[serde(default = "default_syntax_workers")]
    pub syntax: usize,
    #[serde(default = "default_trace_workers")]
    pub trace: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            bloom_filter: default_bloom_workers(),
            token: default_token_workers(),
            syntax: default_syntax_workers(),
            trace: default_trace_workers(),
        }
    }
}

fn default_bloom_workers() -> usize {
    5
}
fn default_token_workers() -> usize {
    15
}
fn default_syntax_workers() -> usize {
    6
}
fn default_trace_workers() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub token_filter: TokenFilterConfig,
    #[serde(default)]
    pub trace: TraceExperimentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFilterConfig {
    #[serde(default = "default_jaccard_threshold")]
    pub jaccard_sim_threshold: f64,
}

impl Default for TokenFilterConfig {
    fn default() -> Self {
        Self {
            jaccard_sim_threshold: default_jaccard_threshold(),
        }
    }
}

fn default_jaccard_threshold() -> f64 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExperimentConfig {
    #[serde(default = "default_ast_min")]
    pub ast_sim_threshold_min: f64,
    #[serde(default = "default_ast_max")]
    pub ast_sim_threshold_max: f64,
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
}

impl Default for TraceExperimentConfig {
    fn default() -> Self {
        Self {
            ast_sim_threshold_min: default_ast_min(),
            ast_sim_threshold_max: default_ast_max(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
        }
    }
}

fn default_ast_min() -> f64 {
    0.7
}
fn default_ast_max() -> f64 {
    0.9
}
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}

impl Config {
    /// Load `config.yml`, writing a template and failing when it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let template = format!(
                "# revenant configuration\n# fill in the dataset paths before running `revenant detect`\n{}",
                serde_yaml::to_string(&Config::default())?
            );
            fs::write(path, template)
                .with_context(|| format!("writing config template to {}", path.display()))?;
            bail!(
                "{} not found; wrote a template, fill in the dataset paths and re-run",
                path.display()
            );
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.basic.dataset.old_new_func_dataset_path.as_os_str().is_empty() {
            bail!("basic.dataset.old_new_func_dataset_path is not set");
        }
        if self
            .basic
            .dataset
            .normal_sample_dataset_path
            .as_os_str()
            .is_empty()
        {
            bail!("basic.dataset.normal_sample_dataset_path is not set");
        }
        let w = &self.basic.workers;
        if w.bloom_filter == 0 || w.token == 0 || w.syntax == 0 || w.trace == 0 {
            bail!("basic.workers widths must all be non-zero");
        }
        let t = &self.experiment.token_filter;
        if !(0.0 < t.jaccard_sim_threshold && t.jaccard_sim_threshold <= 1.0) {
            bail!("experiment.token_filter.jaccard_sim_threshold must be in (0, 1]");
        }
        Ok(())
    }
}
