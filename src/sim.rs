// SPDX-License-Identifier: PMPL-1.0-or-later

//! Multiset Jaccard similarity, shared by the token and syntax filters.

use std::collections::HashMap;
use std::hash::Hash;

/// `Σ min(c₁,c₂) / Σ max(c₁,c₂)` over the union of both multisets.
///
/// Returns 0 when both inputs are empty.
pub fn multiset_jaccard<T: Eq + Hash>(left: &[T], right: &[T]) -> f64 {
    let left_counts = counts(left);
    let right_counts = counts(right);

    let mut intersection = 0usize;
    let mut union = 0usize;
    for (item, &lc) in &left_counts {
        let rc = right_counts.get(item).copied().unwrap_or(0);
        intersection += lc.min(rc);
        union += lc.max(rc);
    }
    for (item, &rc) in &right_counts {
        if !left_counts.contains_key(item) {
            union += rc;
        }
    }

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn counts<T: Eq + Hash>(items: &[T]) -> HashMap<&T, usize> {
    let mut map = HashMap::new();
    for item in items {
        *map.entry(item).or_insert(0) += 1;
    }
    map
}
