// SPDX-License-Identifier: PMPL-1.0-or-later

//! Benign sample corpus: `<root>/<software>/<function-file>`. A seeded
//! random subset is purified into the cache and serves as the negative
//! class during threshold tuning.

use crate::dataset::{list_files, DATASET_SEED};
use crate::purify::{purify_function, read_source_lossy};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Default subset size.
pub const DEFAULT_SAMPLE_SIZE: usize = 3000;

pub struct NormalSample {
    cache_dir: PathBuf,
}

impl NormalSample {
    pub fn open(root: &Path, cache_root: &Path, size: usize, rebuild: bool) -> Result<Self> {
        let cache_dir = cache_root.join("normal");
        let dataset = Self { cache_dir };

        let cached = list_files(&dataset.cache_dir).map(|f| f.len()).unwrap_or(0);
        if !rebuild && cached == size {
            info!("using cached normal sample corpus");
        } else {
            fs::remove_dir_all(&dataset.cache_dir).ok();
            fs::create_dir_all(&dataset.cache_dir)
                .with_context(|| format!("creating {}", dataset.cache_dir.display()))?;
            dataset.preprocess(root, size)?;
        }
        info!(
            "normal sample corpus size: {}",
            dataset.funcs()?.len()
        );
        Ok(dataset)
    }

    fn preprocess(&self, root: &Path, size: usize) -> Result<()> {
        info!("preprocessing normal sample corpus from {}", root.display());
        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            candidates.push((name, entry.into_path()));
        }
        candidates.sort();
        let mut rng = StdRng::seed_from_u64(DATASET_SEED);
        candidates.shuffle(&mut rng);

        let mut kept = 0;
        for (name, path) in candidates {
            if kept == size {
                break;
            }
            let raw = read_source_lossy(&path)?;
            let Some(code) = purify_function(&raw, false) else {
                continue;
            };
            fs::write(self.cache_dir.join(&name), code)?;
            kept += 1;
        }
        info!("normal sample preprocessing finished ({kept} functions)");
        Ok(())
    }

    pub fn funcs(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"static int sum_all(const int *xs, int n) {
    int total = 0;
    int i = 0;
    for (i = 0; i < n; i++) {
        total += xs[i];
    }
    return total;
}"#;

    fn build_corpus(root: &Path, count: usize) {
        let software = root.join("libdemo");
        fs::create_dir_all(&software).unwrap();
        for i in 0..count {
            fs::write(
                software.join(format!("fn_{i}.c")),
                BODY.replace("sum_all", &format!("sum_all_{i}")),
            )
            .unwrap();
        }
    }

    #[test]
    fn draws_the_requested_subset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("normal");
        build_corpus(&root, 10);
        let dataset = NormalSample::open(&root, &dir.path().join("cache"), 4, true).unwrap();
        assert_eq!(dataset.funcs().unwrap().len(), 4);
    }

    #[test]
    fn subset_is_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        for dir in [&dir_a, &dir_b] {
            build_corpus(&dir.path().join("normal"), 10);
        }
        let a = NormalSample::open(
            &dir_a.path().join("normal"),
            &dir_a.path().join("cache"),
            4,
            true,
        )
        .unwrap();
        let b = NormalSample::open(
            &dir_b.path().join("normal"),
            &dir_b.path().join("cache"),
            4,
            true,
        )
        .unwrap();
        let names = |funcs: Vec<PathBuf>| -> Vec<String> {
            funcs
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(names(a.funcs().unwrap()), names(b.funcs().unwrap()));
    }

    #[test]
    fn undersized_corpus_is_taken_whole() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("normal");
        build_corpus(&root, 2);
        let dataset = NormalSample::open(&root, &dir.path().join("cache"), 50, true).unwrap();
        assert_eq!(dataset.funcs().unwrap().len(), 2);
    }
}
