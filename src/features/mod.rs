// SPDX-License-Identifier: PMPL-1.0-or-later

//! Stage 1: feature-fingerprint screening.
//!
//! One-hot vectors of every known vulnerable function are inserted into an
//! SFBL; a target function survives the stage when its own vector scores
//! above the tuned threshold. The threshold is found once against a labelled
//! corpus and cached in `bloomFilter.json`.

pub mod extractor;
pub mod sfbl;

pub use extractor::{FeatureExtractor, VECTOR_LEN};
pub use sfbl::{threshold_to_max_tries, CacheState, Sfbl, SfblParams};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fallback threshold when the tuning corpora are unavailable: accept any
/// collision within 100 tries.
const FALLBACK_THRESHOLD: i64 = -100;

/// Maximum tries used during threshold tuning.
const TUNING_TRIES: usize = 100;

#[derive(Debug, Clone)]
pub struct BloomStageOptions {
    pub cache_root: PathBuf,
    pub dropout_rate: f64,
    pub require_recall: f64,
    pub rebuild: bool,
}

impl BloomStageOptions {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            dropout_rate: 0.17,
            require_recall: 0.96,
            rebuild: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ThresholdCache {
    threshold: i64,
}

/// The constructed stage-1 handle, shared by immutable reference across the
/// bloom worker pool.
pub struct BloomStage {
    extractor: FeatureExtractor,
    filter: Sfbl,
}

impl BloomStage {
    /// Build (or reload) the detection filter.
    ///
    /// `samples` carries one vulnerable representative per CVE,
    /// `non_samples` the remaining vulnerable functions, `normals` the
    /// benign tuning corpus.
    pub fn initialize(
        samples: &[PathBuf],
        non_samples: &[PathBuf],
        normals: &[PathBuf],
        options: &BloomStageOptions,
    ) -> Result<Self> {
        let extractor = FeatureExtractor::new();
        let threshold = load_or_tune_threshold(&extractor, samples, non_samples, normals, options)?;
        info!("bloom filter using threshold {threshold}");

        let params = SfblParams {
            dropout_rate: options.dropout_rate,
            ..SfblParams::new(extractor.vector_len(), threshold_to_max_tries(threshold))
        };
        let sfbl_dir = options.cache_root.join("sfbl");
        let filter = match Sfbl::with_cache(&params, &sfbl_dir, options.rebuild)? {
            CacheState::Initialised(mut filter) => {
                info!("using cached bloom filter bins");
                filter.set_threshold(threshold);
                filter
            }
            CacheState::NeedsBuild { mut filter, reason } => {
                info!("constructing bloom filter bins: {reason}");
                let construct: Vec<PathBuf> = samples.iter().chain(non_samples).cloned().collect();
                let vectors = extract_files(&extractor, &construct)?;
                filter.construct(vectors, threshold)?;
                filter
            }
        };
        Ok(Self { extractor, filter })
    }

    pub fn detect(&self, code: &str) -> bool {
        self.filter.detect(&self.extractor.extract(code))
    }

    pub fn threshold(&self) -> i64 {
        self.filter.threshold()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }
}

fn load_or_tune_threshold(
    extractor: &FeatureExtractor,
    samples: &[PathBuf],
    non_samples: &[PathBuf],
    normals: &[PathBuf],
    options: &BloomStageOptions,
) -> Result<i64> {
    let cache_path = options.cache_root.join("bloomFilter.json");
    if !options.rebuild {
        match read_threshold(&cache_path) {
            Ok(threshold) => return Ok(threshold),
            Err(err) => warn!("threshold cache unusable, re-tuning: {err:#}"),
        }
    }

    let threshold = if non_samples.is_empty() || normals.is_empty() {
        warn!("tuning corpora unavailable, using fixed threshold {FALLBACK_THRESHOLD}");
        FALLBACK_THRESHOLD
    } else {
        let params = SfblParams {
            dropout_rate: options.dropout_rate,
            ..SfblParams::new(extractor.vector_len(), TUNING_TRIES)
        };
        let mut tuner = Sfbl::in_memory(&params);
        let construct = extract_files(extractor, samples)?;
        let mut targets: Vec<(Vec<u8>, bool)> = extract_files(extractor, non_samples)?
            .into_iter()
            .map(|vector| (vector, true))
            .collect();
        targets.extend(
            extract_files(extractor, normals)?
                .into_iter()
                .map(|vector| (vector, false)),
        );
        tuner.find_threshold(construct, &targets, options.require_recall)?
    };

    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(
        &cache_path,
        serde_json::to_string(&serde_json::json!({ "threshold": threshold }))?,
    )
    .with_context(|| format!("writing {}", cache_path.display()))?;
    Ok(threshold)
}

fn read_threshold(path: &Path) -> Result<i64> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let cache: ThresholdCache = serde_json::from_str(&raw)?;
    Ok(cache.threshold)
}

fn extract_files(extractor: &FeatureExtractor, files: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    files
        .par_iter()
        .map(|path| -> Result<Vec<u8>> {
            let code = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(extractor.extract(&code))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const VULN: &str = r#"int copy_data(char *dst, const char *src, int n) {
    int i = 0;
    while (i < n) {
        dst[i] = src[i];
        i++;
    }
    dst[n] = 0;
    return i;
}"#;

    fn write_funcs(dir: &Path, specs: &[(&str, &str)]) -> Vec<PathBuf> {
        specs
            .iter()
            .map(|(name, code)| {
                let path = dir.join(name);
                fs::write(&path, code).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn fallback_threshold_without_tuning_corpora() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_funcs(dir.path(), &[("v.c", VULN)]);
        let options = BloomStageOptions::new(dir.path().join("cache"));
        let stage = BloomStage::initialize(&samples, &[], &[], &options).unwrap();
        assert_eq!(stage.threshold(), -100);
        assert!(stage.detect(VULN), "inserted function must be detected");
    }

    #[test]
    fn threshold_is_cached_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let samples = write_funcs(dir.path(), &[("v.c", VULN)]);
        let options = BloomStageOptions::new(dir.path().join("cache"));
        let first = BloomStage::initialize(&samples, &[], &[], &options).unwrap();
        let second = BloomStage::initialize(&samples, &[], &[], &options).unwrap();
        assert_eq!(first.threshold(), second.threshold());
        assert!(second.detect(VULN));
    }
}
