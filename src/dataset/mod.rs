// SPDX-License-Identifier: PMPL-1.0-or-later

//! Corpus handling: the OLD/NEW vulnerability corpus, the benign sample
//! corpus and the target project. Every dataset purifies its functions once
//! into a local cache directory and serves file paths from there.

pub mod normal;
pub mod old_new;
pub mod target;

pub use normal::NormalSample;
pub use old_new::{split_filename, FilenameParts, OldNewFuncs};
pub use target::{CarvedFunction, CtagsCarver, FunctionCarver, TargetProject};

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Seed shared by every deterministic sampling step.
pub const DATASET_SEED: u64 = 20231031;

/// Absolute paths of every entry in a cache directory, sorted for
/// deterministic iteration.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// True when the directory is missing or holds no entries.
pub fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
