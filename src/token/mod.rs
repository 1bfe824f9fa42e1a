// SPDX-License-Identifier: PMPL-1.0-or-later

//! Stage 2: token-bag Jaccard screening with a length-bucket index.
//!
//! A bag of size L and one of size L' can only reach Jaccard ≥ θ when
//! L' ∈ [⌈L·θ⌉, ⌊L/θ⌋], so only vulnerabilities whose token count falls in
//! that window are ever compared.

pub mod lexer;

pub use lexer::tokenize;

use crate::sim::multiset_jaccard;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

struct VulnTokens {
    vuln_id: String,
    tokens: Vec<String>,
}

/// The constructed stage-2 index, shared by immutable reference across the
/// token worker pool.
pub struct TokenFilter {
    buckets: HashMap<usize, Vec<VulnTokens>>,
    threshold: f64,
}

impl TokenFilter {
    /// Tokenise every vulnerable function and bucket by sequence length.
    pub fn initialize(vul_funcs: &[PathBuf], threshold: f64) -> Result<Self> {
        let entries: Vec<VulnTokens> = vul_funcs
            .par_iter()
            .map(|path| -> Result<VulnTokens> {
                let code = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(VulnTokens {
                    vuln_id: path.to_string_lossy().into_owned(),
                    tokens: tokenize(&code),
                })
            })
            .collect::<Result<_>>()?;

        let mut buckets: HashMap<usize, Vec<VulnTokens>> = HashMap::new();
        for entry in entries {
            buckets.entry(entry.tokens.len()).or_default().push(entry);
        }
        info!(
            "token filter indexed {} vulnerable functions in {} length buckets",
            vul_funcs.len(),
            buckets.len()
        );
        Ok(Self { buckets, threshold })
    }

    /// Inclusive length window of bags that can still reach `threshold`.
    pub fn length_window(len: usize, threshold: f64) -> (usize, usize) {
        let lo = (len as f64 * threshold).ceil() as usize;
        let hi = (len as f64 / threshold).floor() as usize;
        (lo, hi)
    }

    /// Number of indexed bags a query of this length would be compared with.
    pub fn comparable_bags(&self, len: usize) -> usize {
        let (lo, hi) = Self::length_window(len, self.threshold);
        (lo..=hi)
            .filter_map(|bucket_len| self.buckets.get(&bucket_len))
            .map(Vec::len)
            .sum()
    }

    /// Candidate vulnerability ids with multiset Jaccard ≥ θ against the
    /// target's token bag. Bags outside the length window are never scored.
    pub fn detect(&self, code: &str) -> Vec<String> {
        let tokens = tokenize(code);
        let (lo, hi) = Self::length_window(tokens.len(), self.threshold);
        let mut candidates = Vec::new();
        for bucket_len in lo..=hi {
            let Some(bucket) = self.buckets.get(&bucket_len) else {
                continue;
            };
            for entry in bucket {
                if multiset_jaccard(&tokens, &entry.tokens) >= self.threshold {
                    candidates.push(entry.vuln_id.clone());
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const VULN: &str = r#"int copy_data(char *dst, const char *src, int n) {
    int i = 0;
    while (i < n) {
        dst[i] = src[i];
        i++;
    }
    dst[n] = 0;
    return i;
}"#;

    fn filter_for(code: &str, dir: &Path, threshold: f64) -> TokenFilter {
        let path = dir.join("v.c");
        std::fs::write(&path, code).unwrap();
        TokenFilter::initialize(&[path], threshold).unwrap()
    }

    #[test]
    fn identical_function_is_a_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(VULN, dir.path(), 0.7);
        let candidates = filter.detect(VULN);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].ends_with("v.c"));
    }

    #[test]
    fn renamed_identifiers_stay_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(VULN, dir.path(), 0.7);
        let renamed = VULN.replace("dst", "buf").replace("src", "inp");
        assert_eq!(filter.detect(&renamed).len(), 1);
    }

    #[test]
    fn unrelated_function_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let filter = filter_for(VULN, dir.path(), 0.7);
        let unrelated = r#"static double area(double w, double h) {
    double scale = 2.5;
    return w * h * scale;
}"#;
        assert!(filter.detect(unrelated).is_empty());
    }

    #[test]
    fn window_bounds_are_tight() {
        assert_eq!(TokenFilter::length_window(50, 0.7), (35, 71));
        assert_eq!(TokenFilter::length_window(200, 0.7), (140, 285));
        assert_eq!(TokenFilter::length_window(0, 0.7), (0, 0));
    }

    #[test]
    fn out_of_window_bags_are_never_compared() {
        let dir = tempfile::tempdir().unwrap();
        // A vulnerability with a 200-token bag.
        let body: String = (0..33)
            .map(|i| format!("x{i} = x{i} + 1;\n"))
            .collect::<String>();
        let filter = filter_for(&body, dir.path(), 0.7);
        let indexed_len = tokenize(&body).len();
        assert!(indexed_len >= 190, "fixture should be ~200 tokens");

        // A 50-token query window [35, 71] never touches that bucket.
        let query: String = (0..8).map(|i| format!("y{i} = y{i} + 1;\n")).collect();
        let query_len = tokenize(&query).len();
        assert!((45..=55).contains(&query_len));
        assert_eq!(filter.comparable_bags(query_len), 0);
        assert!(filter.detect(&query).is_empty());
    }
}
