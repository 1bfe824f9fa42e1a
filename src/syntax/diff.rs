// SPDX-License-Identifier: PMPL-1.0-or-later

//! Line hashing and the vulnerable/patched line diff.
//!
//! Every line is trimmed before hashing, so the artefacts are independent
//! of indentation and of line order within unchanged regions.

use sha2::{Digest, Sha256};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::collections::HashMap;

/// `SHA-256(trim(line))`, hex-encoded.
pub fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Multiset of line hashes over a function body.
pub fn line_hash_multiset(code: &str) -> HashMap<String, usize> {
    let mut multiset = HashMap::new();
    for line in code.lines() {
        *multiset.entry(line_hash(line)).or_insert(0) += 1;
    }
    multiset
}

/// Line-level diff of the vulnerable function against its patch, as two
/// hash sequences: lines the patch removed and lines the patch added.
/// Trimmed lines equal to one of `filter_lines` are excluded.
pub fn diff_line_hashes(
    vuln: &str,
    patch: &str,
    filter_lines: &[&str],
) -> (Vec<String>, Vec<String>) {
    let vuln_lines: Vec<&str> = vuln.lines().map(str::trim).collect();
    let patch_lines: Vec<&str> = patch.lines().map(str::trim).collect();

    let mut deleted = Vec::new();
    let mut added = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &vuln_lines, &patch_lines) {
        match op {
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                deleted.extend(&vuln_lines[old_index..old_index + old_len]);
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                added.extend(&patch_lines[new_index..new_index + new_len]);
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                deleted.extend(&vuln_lines[old_index..old_index + old_len]);
                added.extend(&patch_lines[new_index..new_index + new_len]);
            }
            DiffOp::Equal { .. } => {}
        }
    }

    let hash_kept = |lines: Vec<&str>| -> Vec<String> {
        lines
            .into_iter()
            .filter(|line| !filter_lines.contains(line))
            .map(line_hash)
            .collect()
    };
    (hash_kept(deleted), hash_kept(added))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VULN: &str = "int f(int n) {\n    int i = 0;\n    buf[n] = 0;\n    return i;\n}";
    const PATCH: &str =
        "int f(int n) {\n    int i = 0;\n    if (n < LEN)\n    buf[n] = 0;\n    return i;\n}";

    #[test]
    fn hashing_trims_first() {
        assert_eq!(line_hash("  return i;  "), line_hash("return i;"));
        assert_ne!(line_hash("return i;"), line_hash("return j;"));
    }

    #[test]
    fn multiset_counts_duplicates() {
        let mset = line_hash_multiset("a;\na;\nb;");
        assert_eq!(mset.get(&line_hash("a;")), Some(&2));
        assert_eq!(mset.get(&line_hash("b;")), Some(&1));
    }

    #[test]
    fn multiset_is_order_independent() {
        let forward = line_hash_multiset("a;\nb;\nc;");
        let shuffled = line_hash_multiset("c;\na;\nb;");
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn pure_insertion_yields_only_added_hashes() {
        let (del, add) = diff_line_hashes(VULN, PATCH, &[]);
        assert!(del.is_empty());
        assert_eq!(add, vec![line_hash("if (n < LEN)")]);
    }

    #[test]
    fn replacement_yields_both_sides() {
        let patched = VULN.replace("buf[n] = 0;", "buf[n - 1] = 0;");
        let (del, add) = diff_line_hashes(VULN, &patched, &[]);
        assert_eq!(del, vec![line_hash("buf[n] = 0;")]);
        assert_eq!(add, vec![line_hash("buf[n - 1] = 0;")]);
    }

    #[test]
    fn filter_lines_are_excluded() {
        let vuln = "while (x)\n{\n    work();\n}";
        let patch = "if (x) {\n    work();\n    done();\n}";
        let (del, add) = diff_line_hashes(vuln, patch, &["{", "}"]);
        assert!(del.contains(&line_hash("while (x)")));
        assert!(!del.contains(&line_hash("{")));
        assert!(add.contains(&line_hash("done();")));
        assert!(!add.contains(&line_hash("}")));
    }

    #[test]
    fn identical_functions_have_empty_diff() {
        let (del, add) = diff_line_hashes(VULN, VULN, &["{", "}"]);
        assert!(del.is_empty());
        assert!(add.is_empty());
    }
}
