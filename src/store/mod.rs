// SPDX-License-Identifier: PMPL-1.0-or-later

//! Per-vulnerability side-store: five key-value namespaces keyed by the
//! vulnerability filename, holding precomputed artefacts (diff line hashes,
//! line-hash multisets, diff embeddings, error markers, fuzzy hashes).
//!
//! Populated under a single-writer discipline during initialisation and
//! memoised concurrently afterwards; persisted as one JSON file per
//! namespace under the cache directory.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    PatchLineHashes,
    LineHashMset,
    DiffEmbedding,
    ErrorFunc,
    FuzzyHash,
}

const NAMESPACES: [Namespace; 5] = [
    Namespace::PatchLineHashes,
    Namespace::LineHashMset,
    Namespace::DiffEmbedding,
    Namespace::ErrorFunc,
    Namespace::FuzzyHash,
];

impl Namespace {
    fn file_name(self) -> &'static str {
        match self {
            Namespace::PatchLineHashes => "patch_line_hashes.json",
            Namespace::LineHashMset => "line_hash_mset.json",
            Namespace::DiffEmbedding => "diff_embedding.json",
            Namespace::ErrorFunc => "error_func.json",
            Namespace::FuzzyHash => "fuzzy_hash.json",
        }
    }

    fn index(self) -> usize {
        match self {
            Namespace::PatchLineHashes => 0,
            Namespace::LineHashMset => 1,
            Namespace::DiffEmbedding => 2,
            Namespace::ErrorFunc => 3,
            Namespace::FuzzyHash => 4,
        }
    }
}

/// Diff line hashes: lines removed by the patch, lines added by the patch.
pub type PatchLineHashes = (Vec<String>, Vec<String>);

/// Line-hash multisets of the vulnerable and patched variants.
pub type LineHashMsets = (HashMap<String, usize>, HashMap<String, usize>);

pub struct SideStore {
    dir: PathBuf,
    maps: [DashMap<String, Value>; 5],
}

impl SideStore {
    /// Open the store, loading any namespaces already on disk.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let maps = NAMESPACES.map(|_| DashMap::new());
        let store = Self {
            dir: dir.to_path_buf(),
            maps,
        };
        for ns in NAMESPACES {
            let path = store.dir.join(ns.file_name());
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let entries: HashMap<String, Value> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            for (key, value) in entries {
                store.maps[ns.index()].insert(key, value);
            }
        }
        Ok(store)
    }

    /// Write every namespace back to disk.
    pub fn flush(&self) -> Result<()> {
        for ns in NAMESPACES {
            let map = &self.maps[ns.index()];
            let entries: HashMap<String, Value> = map
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            let path = self.dir.join(ns.file_name());
            fs::write(&path, serde_json::to_string(&entries)?)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }

    fn set<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Result<()> {
        self.maps[ns.index()].insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Option<T> {
        let value = self.maps[ns.index()].get(key)?.value().clone();
        serde_json::from_value(value).ok()
    }

    pub fn set_patch_line_hashes(&self, vuln_id: &str, hashes: &PatchLineHashes) -> Result<()> {
        self.set(Namespace::PatchLineHashes, vuln_id, hashes)
    }

    pub fn get_patch_line_hashes(&self, vuln_id: &str) -> Option<PatchLineHashes> {
        self.get(Namespace::PatchLineHashes, vuln_id)
    }

    pub fn set_line_hash_msets(&self, vuln_id: &str, msets: &LineHashMsets) -> Result<()> {
        self.set(Namespace::LineHashMset, vuln_id, msets)
    }

    pub fn get_line_hash_msets(&self, vuln_id: &str) -> Option<LineHashMsets> {
        self.get(Namespace::LineHashMset, vuln_id)
    }

    pub fn set_diff_embedding(&self, vuln_id: &str, embedding: &[Vec<f64>]) -> Result<()> {
        self.set(Namespace::DiffEmbedding, vuln_id, &embedding.to_vec())
    }

    pub fn get_diff_embedding(&self, vuln_id: &str) -> Option<Vec<Vec<f64>>> {
        self.get(Namespace::DiffEmbedding, vuln_id)
    }

    pub fn set_error_func(&self, key: &str) {
        self.maps[Namespace::ErrorFunc.index()].insert(key.to_string(), Value::from(1));
    }

    pub fn is_error_func(&self, key: &str) -> bool {
        self.maps[Namespace::ErrorFunc.index()].contains_key(key)
    }

    pub fn set_fuzzy_hash(&self, vuln_id: &str, hash: &str) -> Result<()> {
        self.set(Namespace::FuzzyHash, vuln_id, &hash.to_string())
    }

    pub fn get_fuzzy_hash(&self, vuln_id: &str) -> Option<String> {
        self.get(Namespace::FuzzyHash, vuln_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_patch_line_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SideStore::open(dir.path()).unwrap();
        let hashes = (
            vec!["aa".to_string(), "bb".to_string()],
            vec!["cc".to_string()],
        );
        store.set_patch_line_hashes("v.c", &hashes).unwrap();
        assert_eq!(store.get_patch_line_hashes("v.c").unwrap(), hashes);
        assert!(store.get_patch_line_hashes("other.c").is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SideStore::open(dir.path()).unwrap();
            let mut vuln = HashMap::new();
            vuln.insert("h1".to_string(), 2usize);
            let patch = HashMap::new();
            store
                .set_line_hash_msets("v.c", &(vuln.clone(), patch))
                .unwrap();
            store.set_error_func("broken.c");
            store.set_fuzzy_hash("v.c", "3:abc:def").unwrap();
            store.flush().unwrap();
        }
        let reopened = SideStore::open(dir.path()).unwrap();
        let (vuln, patch) = reopened.get_line_hash_msets("v.c").unwrap();
        assert_eq!(vuln.get("h1"), Some(&2));
        assert!(patch.is_empty());
        assert!(reopened.is_error_func("broken.c"));
        assert!(!reopened.is_error_func("fine.c"));
        assert_eq!(reopened.get_fuzzy_hash("v.c").unwrap(), "3:abc:def");
    }

    #[test]
    fn diff_embeddings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SideStore::open(dir.path()).unwrap();
        let embedding = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        store.set_diff_embedding("v.c", &embedding).unwrap();
        assert_eq!(store.get_diff_embedding("v.c").unwrap(), embedding);
    }
}
