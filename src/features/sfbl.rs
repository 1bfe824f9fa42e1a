// SPDX-License-Identifier: PMPL-1.0-or-later

//! Shuffle-and-Feature-dropout Bloom Lookup (SFBL).
//!
//! A similarity-preserving membership structure: a vector is projected K
//! times (seeded permutation, then the first D positions dropped) and each
//! projection is inserted into its own classical Bloom filter. Two vectors
//! that agree on most positions collide in at least one projection; widely
//! different vectors do not. The query score is `-i` for the first filter i
//! that reports a hit, `-K` when none does; higher is more similar.

use anyhow::{bail, Context, Result};
use bloomfilter::Bloom;
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Shape of one SFBL instance.
#[derive(Debug, Clone)]
pub struct SfblParams {
    /// Length of the one-hot vectors inserted and queried.
    pub vector_len: usize,
    /// Number of shuffled projections (K).
    pub max_tries: usize,
    /// Fraction of positions dropped from the front of each projection.
    pub dropout_rate: f64,
    /// Base permutation seed; filter i permutes with `seed + i`.
    pub seed: u64,
    /// Per-filter element capacity.
    pub capacity: usize,
    /// Per-filter false-positive rate.
    pub error_rate: f64,
}

impl SfblParams {
    pub fn new(vector_len: usize, max_tries: usize) -> Self {
        Self {
            vector_len,
            max_tries,
            dropout_rate: 0.17,
            seed: 20231031,
            capacity: 10_000,
            error_rate: 1e-5,
        }
    }
}

/// Number of tries needed so that `score > threshold` stays decidable.
pub fn threshold_to_max_tries(threshold: i64) -> usize {
    if threshold >= 0 {
        1
    } else {
        (1 - threshold) as usize
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FilterMeta {
    bits: u64,
    k_num: u32,
    sip_keys: [(u64, u64); 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct SfblMeta {
    max_tries: usize,
    vector_len: usize,
    dropout_count: usize,
    seed: u64,
    filters: Vec<FilterMeta>,
}

/// Outcome of opening the SFBL cache: a ready handle, or a fresh filter
/// that still needs its construct pass.
pub enum CacheState {
    Initialised(Sfbl),
    NeedsBuild { filter: Sfbl, reason: String },
}

pub struct Sfbl {
    filters: Vec<Bloom<[u8]>>,
    vector_len: usize,
    dropout_count: usize,
    max_tries: usize,
    seed: u64,
    threshold: i64,
    rebuilt: bool,
    cache_dir: Option<PathBuf>,
}

impl Sfbl {
    /// Fresh in-memory instance (used for threshold tuning and in tests).
    pub fn in_memory(params: &SfblParams) -> Self {
        Self {
            filters: Self::fresh_filters(params),
            vector_len: params.vector_len,
            dropout_count: dropout_count(params),
            max_tries: params.max_tries,
            seed: params.seed,
            threshold: -(params.max_tries as i64 - 1),
            rebuilt: true,
            cache_dir: None,
        }
    }

    /// Open the cached instance under `cache_dir`.
    ///
    /// Returns [`CacheState::Initialised`] when the bitmaps pass the
    /// integrity check (exactly `max_tries` bitmap files plus readable
    /// metadata), otherwise truncates the directory and returns
    /// [`CacheState::NeedsBuild`]; that instance must be
    /// [`construct`](Self::construct)ed before use.
    pub fn with_cache(params: &SfblParams, cache_dir: &Path, rebuild: bool) -> Result<CacheState> {
        let reason = if rebuild {
            "rebuild requested".to_string()
        } else {
            match Self::load(params, cache_dir) {
                Ok(loaded) => return Ok(CacheState::Initialised(loaded)),
                Err(err) => {
                    warn!("SFBL cache unusable, rebuilding: {err:#}");
                    format!("{err:#}")
                }
            }
        };
        fs::remove_dir_all(cache_dir).ok();
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating {}", cache_dir.display()))?;
        let mut fresh = Self::in_memory(params);
        fresh.cache_dir = Some(cache_dir.to_path_buf());
        Ok(CacheState::NeedsBuild {
            filter: fresh,
            reason,
        })
    }

    fn fresh_filters(params: &SfblParams) -> Vec<Bloom<[u8]>> {
        (0..params.max_tries)
            .map(|i| {
                let seed = filter_seed(params.seed, i);
                Bloom::new_for_fp_rate_with_seed(params.capacity, params.error_rate, &seed)
            })
            .collect()
    }

    fn load(params: &SfblParams, cache_dir: &Path) -> Result<Self> {
        let meta_path = cache_dir.join("sfbl.meta.json");
        let meta: SfblMeta = serde_json::from_str(
            &fs::read_to_string(&meta_path)
                .with_context(|| format!("reading {}", meta_path.display()))?,
        )
        .context("parsing SFBL metadata")?;
        if meta.max_tries != params.max_tries || meta.vector_len != params.vector_len {
            bail!(
                "SFBL cache shape mismatch (cached {} tries, want {})",
                meta.max_tries,
                params.max_tries
            );
        }
        let bitmap_files = fs::read_dir(cache_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".sfbl.bin")
            })
            .count();
        if bitmap_files != params.max_tries {
            bail!(
                "SFBL cache holds {} bitmap files, want {}",
                bitmap_files,
                params.max_tries
            );
        }
        let mut filters = Vec::with_capacity(meta.max_tries);
        for (i, filter_meta) in meta.filters.iter().enumerate() {
            let path = cache_dir.join(format!("{i}.sfbl.bin"));
            let file =
                File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            // The bitmaps are never written after construction.
            let map = unsafe { Mmap::map(&file) }
                .with_context(|| format!("mapping {}", path.display()))?;
            filters.push(Bloom::from_existing(
                &map,
                filter_meta.bits,
                filter_meta.k_num,
                filter_meta.sip_keys,
            ));
        }
        Ok(Self {
            filters,
            vector_len: meta.vector_len,
            dropout_count: meta.dropout_count,
            max_tries: meta.max_tries,
            seed: meta.seed,
            threshold: -(meta.max_tries as i64 - 1),
            rebuilt: false,
            cache_dir: Some(cache_dir.to_path_buf()),
        })
    }

    fn persist(&self) -> Result<()> {
        let Some(dir) = &self.cache_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let mut metas = Vec::with_capacity(self.filters.len());
        for (i, filter) in self.filters.iter().enumerate() {
            fs::write(dir.join(format!("{i}.sfbl.bin")), filter.bitmap())?;
            metas.push(FilterMeta {
                bits: filter.number_of_bits(),
                k_num: filter.number_of_hash_functions(),
                sip_keys: filter.sip_keys(),
            });
        }
        let meta = SfblMeta {
            max_tries: self.max_tries,
            vector_len: self.vector_len,
            dropout_count: self.dropout_count,
            seed: self.seed,
            filters: metas,
        };
        fs::write(
            dir.join("sfbl.meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(())
    }

    pub fn max_tries(&self) -> usize {
        self.max_tries
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: i64) {
        self.threshold = threshold;
    }

    /// True when the instance was freshly created and must be constructed.
    pub fn needs_construction(&self) -> bool {
        self.rebuilt
    }

    fn permuted(&self, vector: &[u8], try_index: usize) -> Vec<u8> {
        let mut shuffled = vector.to_vec();
        let mut rng = StdRng::seed_from_u64(filter_seed_u64(self.seed, try_index));
        shuffled.shuffle(&mut rng);
        shuffled
    }

    fn encoded<'a>(&self, shuffled: &'a [u8]) -> &'a [u8] {
        &shuffled[self.dropout_count.min(shuffled.len())..]
    }

    pub fn insert(&mut self, vector: &[u8]) {
        for i in 0..self.max_tries {
            let shuffled = self.permuted(vector, i);
            let item = &shuffled[self.dropout_count.min(shuffled.len())..];
            self.filters[i].set(item);
        }
    }

    /// Score in `{-K, …, 0}`: `-i` for the first projection that collides,
    /// `-K` when none does.
    pub fn query(&self, vector: &[u8]) -> i64 {
        for i in 0..self.max_tries {
            let shuffled = self.permuted(vector, i);
            if self.filters[i].check(self.encoded(&shuffled)) {
                return -(i as i64);
            }
        }
        -(self.max_tries as i64)
    }

    pub fn detect(&self, vector: &[u8]) -> bool {
        self.query(vector) > self.threshold
    }

    /// Insert every construct vector and fix the decision threshold.
    /// Refuses to run on an instance restored from cache.
    pub fn construct(
        &mut self,
        vectors: impl IntoIterator<Item = Vec<u8>>,
        threshold: i64,
    ) -> Result<()> {
        if !self.rebuilt {
            bail!("refusing to construct an SFBL restored from cache");
        }
        self.threshold = threshold;
        for vector in vectors {
            self.insert(&vector);
        }
        self.persist()?;
        Ok(())
    }

    /// Tune the decision threshold: insert the construct set, score the
    /// labelled target set and return the largest threshold whose recall
    /// still meets `require_recall` (precision-recall-curve semantics,
    /// predicted positive iff `score >= threshold`). `i64::MAX` when no
    /// threshold qualifies; detection then never flags.
    pub fn find_threshold(
        &mut self,
        construct: impl IntoIterator<Item = Vec<u8>>,
        targets: &[(Vec<u8>, bool)],
        require_recall: f64,
    ) -> Result<i64> {
        if !self.rebuilt {
            bail!("threshold search needs a freshly built SFBL");
        }
        for vector in construct {
            self.insert(&vector);
        }
        let scored: Vec<(i64, bool)> = targets
            .iter()
            .map(|(vector, label)| (self.query(vector), *label))
            .collect();
        let positives = scored.iter().filter(|(_, label)| *label).count();
        if positives == 0 {
            return Ok(i64::MAX);
        }
        let mut thresholds: Vec<i64> = scored.iter().map(|(score, _)| *score).collect();
        thresholds.sort_unstable();
        thresholds.dedup();

        let mut best = None;
        for &threshold in &thresholds {
            let recalled = scored
                .iter()
                .filter(|(score, label)| *label && *score >= threshold)
                .count();
            // Recall only falls as the threshold rises.
            if recalled as f64 / positives as f64 >= require_recall {
                best = Some(threshold);
            } else {
                break;
            }
        }
        Ok(best.unwrap_or(i64::MAX))
    }
}

fn dropout_count(params: &SfblParams) -> usize {
    (params.vector_len as f64 * params.dropout_rate).round() as usize
}

fn filter_seed_u64(seed: u64, try_index: usize) -> u64 {
    seed.wrapping_add(try_index as u64)
}

fn filter_seed(seed: u64, try_index: usize) -> [u8; 32] {
    let word = filter_seed_u64(seed, try_index).to_le_bytes();
    let mut out = [0u8; 32];
    for (chunk, byte) in out.iter_mut().zip(word.iter().cycle()) {
        *chunk = *byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(vector_len: usize, max_tries: usize) -> SfblParams {
        SfblParams {
            capacity: 1_000,
            ..SfblParams::new(vector_len, max_tries)
        }
    }

    fn one_hot(len: usize, ones: &[usize]) -> Vec<u8> {
        let mut v = vec![0u8; len];
        for &i in ones {
            v[i] = 1;
        }
        v
    }

    #[test]
    fn inserted_vector_scores_zero() {
        let mut sfbl = Sfbl::in_memory(&params(64, 10));
        let v = one_hot(64, &[1, 5, 9, 33]);
        sfbl.insert(&v);
        assert_eq!(sfbl.query(&v), 0);
    }

    #[test]
    fn score_stays_in_range() {
        let mut sfbl = Sfbl::in_memory(&params(64, 10));
        sfbl.insert(&one_hot(64, &[0, 2, 4]));
        for probe in [
            one_hot(64, &[0, 2, 4]),
            one_hot(64, &[1, 3, 5]),
            one_hot(64, &(0..64).collect::<Vec<_>>()),
        ] {
            let score = sfbl.query(&probe);
            assert!((-10..=0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn distant_vector_misses() {
        let mut sfbl = Sfbl::in_memory(&params(64, 10));
        sfbl.insert(&one_hot(64, &[0, 1, 2, 3]));
        let far = one_hot(64, &(32..64).collect::<Vec<_>>());
        assert_eq!(sfbl.query(&far), -10);
    }

    fn fresh(params: &SfblParams, dir: &Path, rebuild: bool) -> Sfbl {
        match Sfbl::with_cache(params, dir, rebuild).unwrap() {
            CacheState::NeedsBuild { filter, .. } => filter,
            CacheState::Initialised(_) => panic!("expected a cache miss"),
        }
    }

    fn reopened(params: &SfblParams, dir: &Path) -> Sfbl {
        match Sfbl::with_cache(params, dir, false).unwrap() {
            CacheState::Initialised(filter) => filter,
            CacheState::NeedsBuild { reason, .. } => {
                panic!("expected a cache hit, got rebuild: {reason}")
            }
        }
    }

    #[test]
    fn construct_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let p = params(32, 4);
        let mut sfbl = fresh(&p, dir.path(), true);
        sfbl.construct(vec![one_hot(32, &[1])], -4).unwrap();

        let mut reloaded = reopened(&p, dir.path());
        assert!(!reloaded.needs_construction());
        assert!(reloaded.construct(vec![one_hot(32, &[2])], -4).is_err());
    }

    #[test]
    fn cache_round_trip_preserves_queries() {
        let dir = tempfile::tempdir().unwrap();
        let p = params(64, 8);
        let vectors: Vec<Vec<u8>> = vec![
            one_hot(64, &[1, 2, 3, 4, 5]),
            one_hot(64, &[10, 20, 30, 40]),
            one_hot(64, &[7, 14, 21, 28, 35]),
        ];
        let mut built = fresh(&p, dir.path(), true);
        built.construct(vectors.clone(), -8).unwrap();

        let probes: Vec<Vec<u8>> = vectors
            .iter()
            .cloned()
            .chain([one_hot(64, &[60, 61, 62]), one_hot(64, &[2, 3, 4])])
            .collect();
        let expected: Vec<i64> = probes.iter().map(|v| built.query(v)).collect();

        let reloaded = reopened(&p, dir.path());
        let actual: Vec<i64> = probes.iter().map(|v| reloaded.query(v)).collect();
        assert_eq!(expected, actual);
    }

    #[test]
    fn missing_bitmap_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let p = params(32, 4);
        let mut built = fresh(&p, dir.path(), true);
        built.construct(vec![one_hot(32, &[3])], -4).unwrap();

        std::fs::remove_file(dir.path().join("2.sfbl.bin")).unwrap();
        assert!(matches!(
            Sfbl::with_cache(&p, dir.path(), false).unwrap(),
            CacheState::NeedsBuild { .. }
        ));
    }

    #[test]
    fn threshold_search_prefers_the_largest_recalling_threshold() {
        let p = params(64, 100);
        let sample = one_hot(64, &[1, 2, 3, 4, 5, 6]);

        // One positive collides immediately (score 0), the other is distant;
        // requiring 96% recall forces the threshold down to the distant score.
        let near = sample.clone();
        let far = one_hot(64, &(32..64).collect::<Vec<_>>());
        let far_score = {
            let mut probe = Sfbl::in_memory(&p);
            probe.insert(&sample);
            probe.query(&far)
        };
        assert!(far_score < 0, "far vector should not collide first");
        let targets = vec![(near, true), (far.clone(), true), (far, false)];

        let mut tuner = Sfbl::in_memory(&p);
        let threshold = tuner.find_threshold(vec![sample], &targets, 0.96).unwrap();
        assert_eq!(threshold, far_score);
    }

    #[test]
    fn threshold_search_without_positives_never_flags() {
        let p = params(64, 10);
        let mut sfbl = Sfbl::in_memory(&p);
        let targets = vec![(one_hot(64, &[1]), false)];
        let threshold = sfbl
            .find_threshold(vec![one_hot(64, &[2])], &targets, 0.96)
            .unwrap();
        assert_eq!(threshold, i64::MAX);
        assert_eq!(threshold_to_max_tries(threshold), 1);
    }

    #[test]
    fn max_tries_from_threshold() {
        assert_eq!(threshold_to_max_tries(-100), 101);
        assert_eq!(threshold_to_max_tries(-1), 2);
        assert_eq!(threshold_to_max_tries(0), 1);
    }
}
