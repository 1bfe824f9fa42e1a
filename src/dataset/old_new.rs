// SPDX-License-Identifier: PMPL-1.0-or-later

//! The OLD/NEW vulnerability corpus: `<root>/<software>/<CVE>/<file>`,
//! where `OLD` files are vulnerable functions and `NEW` files their patched
//! counterparts (paired by filename substitution).
//!
//! Per CVE, the first OLD of a given function name is the "sample" copy;
//! later OLDs of the same function are "non-sample". Purified texts are
//! cached under `old_new_funcs/{vul/sample,vul/non_sample,no_vul}`.

use crate::dataset::{dir_is_empty, list_files};
use crate::purify::{purify_function, read_source_lossy};
use crate::syntax::cve_of;
use crate::types::VulnPair;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fields of an OLD/NEW corpus filename:
/// `<cve>_<cwe>_<commit>_<srcfile>[_<version>]_<funcname>_<OLD|NEW>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameParts {
    pub cve: String,
    pub cwe: String,
    pub commit: String,
    pub file_name: String,
    pub version: String,
    pub func_name: String,
    pub old_new: String,
}

/// Parse a corpus filename; `None` when it does not follow the convention.
pub fn split_filename(name: &str) -> Option<FilenameParts> {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 6 {
        return None;
    }
    let cve = parts[0];
    let cwe = parts[1];
    let commit = parts[2];

    // The source-file section is every consecutive part containing ".c".
    let mut i = 3;
    while i < parts.len() - 1 && parts[i].contains(".c") {
        i += 1;
    }
    let file_name = parts[3..i].join("_");

    let version = if i < parts.len() - 1 && parts[i].contains('.') {
        let v = parts[i];
        i += 1;
        v
    } else {
        ""
    };

    let func_name = parts[i..parts.len() - 1].join("_");
    let old_new = parts[parts.len() - 1];
    if func_name.is_empty() || !matches!(old_new, "OLD" | "NEW") {
        return None;
    }
    Some(FilenameParts {
        cve: cve.trim().to_string(),
        cwe: cwe.trim().to_string(),
        commit: commit.trim().to_string(),
        file_name: file_name.trim().to_string(),
        version: version.trim().to_string(),
        func_name: func_name.trim().to_string(),
        old_new: old_new.trim().to_string(),
    })
}

pub struct OldNewFuncs {
    sample_dir: PathBuf,
    non_sample_dir: PathBuf,
    no_vul_dir: PathBuf,
}

impl OldNewFuncs {
    /// Open the corpus, purifying and classifying every function into the
    /// cache unless a usable cache already exists.
    pub fn open(root: &Path, cache_root: &Path, rebuild: bool) -> Result<Self> {
        let cache_dir = cache_root.join("old_new_funcs");
        let dataset = Self {
            sample_dir: cache_dir.join("vul").join("sample"),
            non_sample_dir: cache_dir.join("vul").join("non_sample"),
            no_vul_dir: cache_dir.join("no_vul"),
        };

        let unusable = dir_is_empty(&dataset.sample_dir)
            || dir_is_empty(&dataset.no_vul_dir);
        if rebuild || unusable {
            fs::remove_dir_all(&cache_dir).ok();
            for dir in [
                &dataset.sample_dir,
                &dataset.non_sample_dir,
                &dataset.no_vul_dir,
            ] {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            dataset.preprocess(root)?;
        } else {
            fs::create_dir_all(&dataset.non_sample_dir)?;
            info!("using cached old/new function corpus");
        }

        let samples = dataset.sample_funcs()?.len();
        let non_samples = dataset.non_sample_funcs()?.len();
        let no_vul = dataset.no_vul_funcs()?.len();
        info!(
            "old/new corpus: {} vulnerable ({} samples), {} patched",
            samples + non_samples,
            samples,
            no_vul
        );
        Ok(dataset)
    }

    fn preprocess(&self, root: &Path) -> Result<()> {
        info!("preprocessing old/new function corpus from {}", root.display());
        for software in read_subdirs(root)? {
            for cve_dir in read_subdirs(&software)? {
                let mut seen_funcs: HashSet<String> = HashSet::new();
                for func_file in list_files(&cve_dir)? {
                    let name = func_file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let Some(parts) = split_filename(&name) else {
                        warn!("unrecognised corpus filename {name}, skipping");
                        continue;
                    };
                    let raw = read_source_lossy(&func_file)?;
                    let Some(code) = purify_function(&raw, false) else {
                        continue;
                    };
                    let target_dir = if parts.old_new == "OLD" {
                        if seen_funcs.insert(parts.func_name.clone()) {
                            &self.sample_dir
                        } else {
                            &self.non_sample_dir
                        }
                    } else {
                        &self.no_vul_dir
                    };
                    fs::write(target_dir.join(&name), code)?;
                }
            }
        }
        info!("old/new corpus preprocessing finished");
        Ok(())
    }

    /// Sample vulnerable functions: one representative per CVE and function.
    pub fn sample_funcs(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.sample_dir)
    }

    /// Vulnerable functions that have another vulnerable version on record.
    pub fn non_sample_funcs(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.non_sample_dir)
    }

    /// All vulnerable functions (samples plus non-samples).
    pub fn vul_funcs(&self) -> Result<Vec<PathBuf>> {
        let mut funcs = self.sample_funcs()?;
        funcs.extend(self.non_sample_funcs()?);
        Ok(funcs)
    }

    /// Patched counterparts.
    pub fn no_vul_funcs(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.no_vul_dir)
    }

    /// Vulnerable/patched pairs, matched by substituting `OLD` with `NEW`
    /// in the filename. Unpaired vulnerable functions are left out.
    pub fn func_pairs(&self) -> Result<Vec<VulnPair>> {
        let mut pairs = Vec::new();
        for dir in [&self.sample_dir, &self.non_sample_dir] {
            for vuln_path in list_files(dir)? {
                let name = vuln_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let patch_name = name.replace("OLD", "NEW");
                let patch_path = self.no_vul_dir.join(&patch_name);
                if patch_path.exists() {
                    pairs.push(VulnPair {
                        cve_id: cve_of(&vuln_path),
                        vuln_id: name,
                        vuln_path,
                        patch_path,
                    });
                }
            }
        }
        Ok(pairs)
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VULN: &str = r#"int copy_data(char *dst, const char *src, int n) {
    int i = 0;
    while (i < n) {
        dst[i] = src[i];
        i++;
    }
    dst[n] = 0;
    return i;
}"#;

    #[test]
    fn parses_plain_filename() {
        let parts =
            split_filename("CVE-2019-1010_CWE-119_8a9f2_util.c_copy_data_OLD.vul").unwrap();
        assert_eq!(parts.cve, "CVE-2019-1010");
        assert_eq!(parts.cwe, "CWE-119");
        assert_eq!(parts.commit, "8a9f2");
        assert_eq!(parts.file_name, "util.c");
        assert_eq!(parts.version, "");
        assert_eq!(parts.func_name, "copy_data");
        assert_eq!(parts.old_new, "OLD");
    }

    #[test]
    fn parses_versioned_filename() {
        let parts =
            split_filename("CVE-2020-5_CWE-787_deadbeef_io.c_2.4.1_read_frame_NEW.vul").unwrap();
        assert_eq!(parts.file_name, "io.c");
        assert_eq!(parts.version, "2.4.1");
        assert_eq!(parts.func_name, "read_frame");
        assert_eq!(parts.old_new, "NEW");
    }

    #[test]
    fn underscored_function_names_are_joined() {
        let parts = split_filename(
            "CVE-2018-7_CWE-20_f00_parse.c_handle_client_request_OLD.vul",
        )
        .unwrap();
        assert_eq!(parts.func_name, "handle_client_request");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(split_filename("README").is_none());
        assert!(split_filename("a_b_c").is_none());
        assert!(split_filename("CVE-1_CWE-2_c_file.c_fn_NEITHER.vul").is_none());
    }

    fn build_corpus(root: &Path) {
        let cve_dir = root.join("demo").join("CVE-2021-0001");
        fs::create_dir_all(&cve_dir).unwrap();
        fs::write(
            cve_dir.join("CVE-2021-0001_CWE-119_aaa_demo.c_copy_data_OLD.vul"),
            VULN,
        )
        .unwrap();
        fs::write(
            cve_dir.join("CVE-2021-0001_CWE-119_aaa_demo.c_copy_data_NEW.vul"),
            VULN.replace("dst[n] = 0;", "if (n < LEN)\n    dst[n] = 0;"),
        )
        .unwrap();
        // A second OLD of the same function becomes non-sample.
        fs::write(
            cve_dir.join("CVE-2021-0001_CWE-119_bbb_demo.c_copy_data_OLD.vul"),
            VULN.replace("return i;", "return n;"),
        )
        .unwrap();
    }

    #[test]
    fn classifies_sample_and_non_sample() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("corpus");
        build_corpus(&root);
        let dataset = OldNewFuncs::open(&root, &dir.path().join("cache"), true).unwrap();

        assert_eq!(dataset.sample_funcs().unwrap().len(), 1);
        assert_eq!(dataset.non_sample_funcs().unwrap().len(), 1);
        assert_eq!(dataset.vul_funcs().unwrap().len(), 2);
        assert_eq!(dataset.no_vul_funcs().unwrap().len(), 1);

        // Only the OLD with a NEW counterpart pairs up.
        let pairs = dataset.func_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].cve_id, "CVE-2021-0001");
        assert!(pairs[0].vuln_id.contains("_aaa_"));
    }

    #[test]
    fn cache_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("corpus");
        build_corpus(&root);
        let cache = dir.path().join("cache");
        let first = OldNewFuncs::open(&root, &cache, true).unwrap();
        let first_samples = first.sample_funcs().unwrap();

        // Remove the corpus: a second open must work from the cache alone.
        fs::remove_dir_all(&root).unwrap();
        let second = OldNewFuncs::open(&root, &cache, false).unwrap();
        assert_eq!(second.sample_funcs().unwrap(), first_samples);
    }
}
