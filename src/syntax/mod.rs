// SPDX-License-Identifier: PMPL-1.0-or-later

//! Stage 3: syntactic screening against each surviving candidate pair.
//!
//! Three checks per candidate, short-circuiting on the first failure:
//! 1. every line the patch removed is still present in the target exactly as
//!    in the vulnerable variant (or was a diff no-op),
//! 2. the symmetric condition for the lines the patch added,
//! 3. the target's AST-node multiset is at least `ast_min`-similar to the
//!    vulnerable variant and no closer to the patch (a much-closer-to-patch
//!    cluster is kept but tagged near-patch).
//!
//! Survivors are collapsed per CVE; candidates above `ast_max` bypass the
//! trace stage through the high-confidence sink.

pub mod ast;
pub mod diff;

pub use ast::ast_nodes;
pub use diff::{diff_line_hashes, line_hash, line_hash_multiset};

use crate::sim::multiset_jaccard;
use crate::store::{LineHashMsets, SideStore};
use crate::types::{TraceAttempt, VulnPair};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Margin above which a closer-to-patch candidate is still accepted but
/// tagged near-patch.
const NEAR_PATCH_MARGIN: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct SyntaxFilterOptions {
    pub ast_sim_threshold_min: f64,
    pub ast_sim_threshold_max: f64,
    /// Trimmed lines excluded from the diff hashes.
    pub filter_lines: Vec<String>,
}

impl Default for SyntaxFilterOptions {
    fn default() -> Self {
        Self {
            ast_sim_threshold_min: 0.7,
            ast_sim_threshold_max: 0.9,
            filter_lines: vec!["{".to_string(), "}".to_string()],
        }
    }
}

/// Stage-3 result for one target function.
#[derive(Debug, Default)]
pub struct SyntaxOutcome {
    /// Candidates confirmed with `Jv > ast_max`: emitted straight to the
    /// report, bypassing the trace stage.
    pub fast_path: Vec<String>,
    /// Remaining survivors, forwarded to the trace stage.
    pub forwarded: Vec<String>,
    /// One row per attempted candidate for the trace CSV.
    pub attempts: Vec<TraceAttempt>,
}

struct PairArtifacts {
    del_hashes: Vec<String>,
    add_hashes: Vec<String>,
    vuln_mset: HashMap<String, usize>,
    patch_mset: HashMap<String, usize>,
}

struct Survivor {
    vuln_id: String,
    cve_id: String,
    jv: f64,
    near_patch: bool,
}

/// The constructed stage-3 handle, shared by immutable reference across the
/// syntax worker pool.
pub struct SyntaxFilter {
    pairs: HashMap<String, VulnPair>,
    store: Arc<SideStore>,
    ast_cache: DashMap<String, Arc<(Vec<String>, Vec<String>)>>,
    options: SyntaxFilterOptions,
}

impl SyntaxFilter {
    pub fn initialize(
        pairs: Vec<VulnPair>,
        store: Arc<SideStore>,
        options: SyntaxFilterOptions,
    ) -> Self {
        let pairs = pairs
            .into_iter()
            .map(|pair| (pair.vuln_path.to_string_lossy().into_owned(), pair))
            .collect();
        Self {
            pairs,
            store,
            ast_cache: DashMap::new(),
            options,
        }
    }

    /// Evaluate one target function against its candidate vulnerabilities.
    pub fn evaluate(
        &self,
        code: &str,
        path: &str,
        candidates: &[String],
    ) -> Result<SyntaxOutcome> {
        let dst_mset = line_hash_multiset(code);
        let dst_ast = ast_nodes(code)
            .with_context(|| format!("extracting AST nodes of {path}"))?;

        let mut outcome = SyntaxOutcome::default();
        let mut survivors: Vec<Survivor> = Vec::new();

        for candidate in candidates {
            let Some(pair) = self.pairs.get(candidate) else {
                debug!("no patch counterpart for {candidate}, skipping");
                continue;
            };
            let mut detail: Vec<String> = Vec::new();
            let mut passed = true;

            let artifacts = self.pair_artifacts(pair)?;

            let del_ok = Self::lines_check(
                &artifacts.del_hashes,
                &artifacts.vuln_mset,
                &artifacts.patch_mset,
                &dst_mset,
            );
            detail.push(format!("del_lines:{}", if del_ok { "pass" } else { "fail" }));
            if artifacts.del_hashes.is_empty() {
                detail.push("no_del_line".to_string());
            }
            if del_ok {
                let add_ok = Self::lines_check(
                    &artifacts.add_hashes,
                    &artifacts.vuln_mset,
                    &artifacts.patch_mset,
                    &dst_mset,
                );
                detail.push(format!("add_lines:{}", if add_ok { "pass" } else { "fail" }));
                if artifacts.add_hashes.is_empty() {
                    detail.push("no_add_line".to_string());
                }
                if add_ok {
                    let asts = self.pair_asts(pair)?;
                    let jv = multiset_jaccard(&dst_ast, &asts.0);
                    let jp = multiset_jaccard(&dst_ast, &asts.1);
                    detail.push(format!("jv:{jv:.4}"));
                    detail.push(format!("jp:{jp:.4}"));
                    match ast_verdict(jv, jp, self.options.ast_sim_threshold_min) {
                        Some(near_patch) => {
                            survivors.push(Survivor {
                                vuln_id: candidate.clone(),
                                cve_id: pair.cve_id.clone(),
                                jv,
                                near_patch,
                            });
                        }
                        None => passed = false,
                    }
                } else {
                    passed = false;
                }
            } else {
                passed = false;
            }

            outcome.attempts.push(TraceAttempt {
                target_file: path.to_string(),
                vuln_file: candidate.clone(),
                patch_file: pair.patch_path.to_string_lossy().into_owned(),
                detail: detail.join("|"),
                predict: passed,
            });
        }

        for survivor in collapse_by_cve(survivors) {
            if survivor.jv > self.options.ast_sim_threshold_max && !survivor.near_patch {
                outcome.fast_path.push(survivor.vuln_id);
            } else {
                outcome.forwarded.push(survivor.vuln_id);
            }
        }
        Ok(outcome)
    }

    /// A deleted or added line is acceptable when it was a diff no-op
    /// (`vuln.count == patch.count`) or the target still carries it with the
    /// vulnerable multiplicity (`dst.count == vuln.count`).
    fn lines_check(
        hashes: &[String],
        vuln_mset: &HashMap<String, usize>,
        patch_mset: &HashMap<String, usize>,
        dst_mset: &HashMap<String, usize>,
    ) -> bool {
        hashes.iter().all(|hash| {
            let vuln = vuln_mset.get(hash).copied().unwrap_or(0);
            let patch = patch_mset.get(hash).copied().unwrap_or(0);
            let dst = dst_mset.get(hash).copied().unwrap_or(0);
            vuln == patch || dst == vuln
        })
    }

    /// Diff and line-hash artefacts, memoised in the side-store.
    fn pair_artifacts(&self, pair: &VulnPair) -> Result<PairArtifacts> {
        let cached = (
            self.store.get_patch_line_hashes(&pair.vuln_id),
            self.store.get_line_hash_msets(&pair.vuln_id),
        );
        if let (Some((del_hashes, add_hashes)), Some((vuln_mset, patch_mset))) = cached {
            return Ok(PairArtifacts {
                del_hashes,
                add_hashes,
                vuln_mset,
                patch_mset,
            });
        }

        let vuln_code = fs::read_to_string(&pair.vuln_path)
            .with_context(|| format!("reading {}", pair.vuln_path.display()))?;
        let patch_code = fs::read_to_string(&pair.patch_path)
            .with_context(|| format!("reading {}", pair.patch_path.display()))?;
        let filter_lines: Vec<&str> = self
            .options
            .filter_lines
            .iter()
            .map(String::as_str)
            .collect();
        let (del_hashes, add_hashes) = diff_line_hashes(&vuln_code, &patch_code, &filter_lines);
        let msets: LineHashMsets = (
            line_hash_multiset(&vuln_code),
            line_hash_multiset(&patch_code),
        );
        self.store
            .set_patch_line_hashes(&pair.vuln_id, &(del_hashes.clone(), add_hashes.clone()))?;
        self.store.set_line_hash_msets(&pair.vuln_id, &msets)?;
        Ok(PairArtifacts {
            del_hashes,
            add_hashes,
            vuln_mset: msets.0,
            patch_mset: msets.1,
        })
    }

    /// AST-node multisets of both variants, memoised in memory. Concurrent
    /// fills compute the same value, so readers always observe a consistent
    /// entry.
    fn pair_asts(&self, pair: &VulnPair) -> Result<Arc<(Vec<String>, Vec<String>)>> {
        if let Some(entry) = self.ast_cache.get(&pair.vuln_id) {
            return Ok(entry.value().clone());
        }
        let vuln_code = fs::read_to_string(&pair.vuln_path)
            .with_context(|| format!("reading {}", pair.vuln_path.display()))?;
        let patch_code = fs::read_to_string(&pair.patch_path)
            .with_context(|| format!("reading {}", pair.patch_path.display()))?;
        let computed = Arc::new((ast_nodes(&vuln_code)?, ast_nodes(&patch_code)?));
        self.ast_cache
            .insert(pair.vuln_id.clone(), computed.clone());
        Ok(computed)
    }
}

/// AST-Jaccard decision: `None` rejects the candidate, `Some(near_patch)`
/// accepts it, flagging the tight closer-to-patch cluster.
fn ast_verdict(jv: f64, jp: f64, ast_min: f64) -> Option<bool> {
    if jv < ast_min {
        None
    } else if jv < jp {
        if jp - jv > NEAR_PATCH_MARGIN {
            Some(true)
        } else {
            None
        }
    } else {
        Some(false)
    }
}

/// Keep one survivor per CVE: the highest `Jv`, ties broken by the
/// lexicographically smaller vulnerability id.
fn collapse_by_cve(survivors: Vec<Survivor>) -> Vec<Survivor> {
    if survivors.len() <= 1 {
        return survivors;
    }
    let mut best: Vec<Survivor> = Vec::new();
    for survivor in survivors {
        match best.iter_mut().find(|kept| kept.cve_id == survivor.cve_id) {
            Some(kept) => {
                let better = survivor.jv > kept.jv
                    || (survivor.jv == kept.jv && survivor.vuln_id < kept.vuln_id);
                if better {
                    *kept = survivor;
                }
            }
            None => best.push(survivor),
        }
    }
    best
}

/// Extract the CVE identifier from a vulnerability file name.
pub fn cve_of(vuln_file: &Path) -> String {
    let name = vuln_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('_').next().unwrap_or_default().to_string()
}
