//! Empirical null distributions of AP and the p-values derived from them.
//!
//! Under the null hypothesis the `n_pos` positives of a query land on
//! uniformly random ranks among its `n_pos + n_neg` candidates, so the null
//! distribution only depends on that `(n_pos, n_total)` configuration. Each
//! configuration is sampled once, from its own seeded stream, and cached.
//! Results therefore do not depend on the batch size, the thread count or the
//! order in which configurations are first requested.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::average_precision::average_precision_from_ranks;
use crate::error::{EmptyPairSet, MapError, MapResult};
use crate::pairs::PairSet;

pub const NULL_STREAM: u64 = 0x4e55_4c4c;
pub const MAP_STREAM: u64 = 0x4d41_5030;
pub const SHUFFLE_STREAM: u64 = 0x5348_5546;

/// Null values within this distance of the observed score count as ties.
const TIE_TOLERANCE: f64 = 1e-12;

/// `(n_pos, n_total)` of a ranked candidate list.
pub type RankConfig = (usize, usize);

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Seed of an independent random stream derived from the run seed.
pub fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    parts
        .iter()
        .fold(splitmix64(seed), |acc, &part| splitmix64(acc ^ part))
}

/// FNV-1a, so derived seeds do not depend on the platform or on std's hasher.
pub fn stable_hash(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

pub fn rank_config(pairs: &PairSet, i: usize) -> RankConfig {
    let n_pos = pairs.positives[i].len();
    (n_pos, n_pos + pairs.negatives[i].len())
}

/// One-sided empirical p-value with continuity correction:
/// `(#{null >= observed} + 1) / (N + 1)`. `sorted_null` must be ascending.
pub fn empirical_p_value(sorted_null: &[f64], observed: f64) -> f64 {
    let below = sorted_null.partition_point(|&x| x < observed - TIE_TOLERANCE);
    let at_or_above = sorted_null.len() - below;
    (at_or_above + 1) as f64 / (sorted_null.len() + 1) as f64
}

pub struct NullModel {
    null_size: usize,
    batch_size: usize,
    seed: u64,
    max_draws: Option<u64>,
    draws: u64,
    dists: BTreeMap<RankConfig, Vec<f64>>,
}

impl NullModel {
    pub fn new(null_size: usize, batch_size: usize, seed: u64, max_draws: Option<u64>) -> Self {
        Self {
            null_size,
            batch_size: batch_size.max(1),
            seed,
            max_draws,
            draws: 0,
            dists: BTreeMap::new(),
        }
    }

    /// Null rankings sampled so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Sorted null AP values of a configuration, if already sampled.
    pub fn distribution(&self, config: RankConfig) -> Option<&[f64]> {
        self.dists.get(&config).map(Vec::as_slice)
    }

    fn sample_config(&self, config: RankConfig) -> Vec<f64> {
        let (n_pos, n_total) = config;
        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(
            self.seed,
            &[NULL_STREAM, n_pos as u64, n_total as u64],
        ));
        let mut dist: Vec<f64> = (0..self.null_size)
            .map(|_| {
                let mut ranks: Vec<usize> = index::sample(&mut rng, n_total, n_pos)
                    .into_iter()
                    .map(|r| r + 1)
                    .collect();
                ranks.sort_unstable();
                average_precision_from_ranks(&ranks)
            })
            .collect();
        dist.sort_by(f64::total_cmp);
        dist
    }

    /// Sample every configuration in `configs` that is not cached yet.
    pub fn ensure(&mut self, configs: impl IntoIterator<Item = RankConfig>) -> MapResult<()> {
        let missing: Vec<RankConfig> = configs
            .into_iter()
            .filter(|c| !self.dists.contains_key(c))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let requested = self.draws + missing.len() as u64 * self.null_size as u64;
        if let Some(budget) = self.max_draws {
            if requested > budget {
                return Err(MapError::BudgetExceeded { budget, requested });
            }
        }

        let this = &*self;
        let sampled: Vec<(RankConfig, Vec<f64>)> = missing
            .par_iter()
            .map(|&config| (config, this.sample_config(config)))
            .collect();

        debug!("Sampled null distributions for {} configurations", sampled.len());
        self.draws = requested;
        self.dists.extend(sampled);
        Ok(())
    }

    /// p-value of an observed AP; `None` if the configuration was never sampled.
    pub fn p_value(&self, config: RankConfig, observed: f64) -> Option<f64> {
        self.distribution(config)
            .map(|dist| empirical_p_value(dist, observed))
    }

    /// p-values of every scored profile, null-evaluated `batch_size` profiles
    /// at a time. Unscored profiles get `None`.
    ///
    /// `configs[i]` is the rank configuration `scores[i]` was computed on.
    pub fn p_values(
        &mut self,
        scores: &[Result<f64, EmptyPairSet>],
        configs: &[RankConfig],
    ) -> MapResult<Vec<Option<f64>>> {
        if scores.len() != configs.len() {
            return Err(MapError::MisalignedTables {
                metadata_rows: configs.len(),
                feature_rows: scores.len(),
                ids: scores.len(),
            });
        }
        let indices: Vec<usize> = (0..scores.len()).collect();
        let mut out = Vec::with_capacity(scores.len());

        for (batch, chunk) in indices.chunks(self.batch_size).enumerate() {
            self.ensure(
                chunk
                    .iter()
                    .filter(|&&i| scores[i].is_ok())
                    .map(|&i| configs[i]),
            )?;
            debug!("Null batch {} ({} profiles)", batch, chunk.len());

            for &i in chunk {
                out.push(match scores[i] {
                    Ok(ap) => self.p_value(configs[i], ap),
                    Err(_) => None,
                });
            }
        }
        Ok(out)
    }

    /// p-value of a mean AP over profiles with the given configurations.
    ///
    /// Each null replicate draws one value from every profile's cached null
    /// distribution and averages them. Profiles are visited grouped by
    /// configuration, so the outcome does not depend on their order.
    pub fn map_p_value(&self, configs: &[RankConfig], observed_map: f64, stream_seed: u64) -> Option<f64> {
        if configs.is_empty() {
            return None;
        }
        let mut counts: BTreeMap<RankConfig, usize> = BTreeMap::new();
        for &config in configs {
            *counts.entry(config).or_default() += 1;
        }
        let groups: Vec<(&[f64], usize)> = counts
            .iter()
            .map(|(config, &count)| self.distribution(*config).map(|d| (d, count)))
            .collect::<Option<_>>()?;

        let mut rng = ChaCha8Rng::seed_from_u64(stream_seed);
        let m = configs.len() as f64;
        let mut null_maps: Vec<f64> = (0..self.null_size)
            .map(|_| {
                let mut sum = 0.0;
                for &(dist, count) in &groups {
                    for _ in 0..count {
                        sum += dist[rng.gen_range(0..dist.len())];
                    }
                }
                sum / m
            })
            .collect();
        null_maps.sort_by(f64::total_cmp);
        Some(empirical_p_value(&null_maps, observed_map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_config_counts_partners() {
        let pairs = PairSet {
            positives: vec![vec![1, 2], vec![0]],
            negatives: vec![vec![3], vec![2, 3, 4]],
        };
        assert_eq!(rank_config(&pairs, 0), (2, 3));
        assert_eq!(rank_config(&pairs, 1), (1, 4));
    }

    #[test]
    fn test_empirical_p_value() {
        let null = [0.1, 0.2, 0.2, 0.5];
        assert_eq!(empirical_p_value(&null, 0.2), 4.0 / 5.0);
        assert_eq!(empirical_p_value(&null, 0.6), 1.0 / 5.0);
        assert_eq!(empirical_p_value(&null, 0.0), 1.0);
    }

    #[test]
    fn test_p_values_in_unit_interval_and_monotone() {
        let mut model = NullModel::new(500, 10, 42, None);
        model.ensure([(3, 12)]).unwrap();
        let mut previous = f64::INFINITY;
        for step in 0..=20 {
            let ap = step as f64 / 20.0;
            let p = model.p_value((3, 12), ap).unwrap();
            assert!(p > 0.0 && p <= 1.0);
            assert!(p <= previous, "p-value increased at ap={ap}");
            previous = p;
        }
        assert_eq!(model.p_value((3, 12), 1.0 + 1e-9).unwrap(), 1.0 / 501.0);
    }

    #[test]
    fn test_null_distribution_matches_expectation() {
        // one positive among two candidates: AP is 1 or 1/2 with equal odds
        let mut model = NullModel::new(4000, 1, 3, None);
        model.ensure([(1, 2)]).unwrap();
        let dist = model.distribution((1, 2)).unwrap();
        assert!(dist.iter().all(|&v| v == 1.0 || v == 0.5));
        let mean = dist.iter().sum::<f64>() / dist.len() as f64;
        assert!((mean - 0.75).abs() < 0.03, "mean {mean}");
    }

    #[test]
    fn test_batch_size_does_not_change_p_values() {
        let configs = [(2, 7), (3, 7), (2, 7), (1, 8), (4, 8), (0, 3)];
        let scores = vec![
            Ok(0.9),
            Ok(0.4),
            Ok(0.55),
            Ok(1.0),
            Ok(0.7),
            Err(EmptyPairSet::NoPositives),
        ];
        let reference = NullModel::new(300, 1, 9, None).p_values(&scores, &configs).unwrap();
        for batch_size in [2, 4, 100] {
            let p = NullModel::new(300, batch_size, 9, None)
                .p_values(&scores, &configs)
                .unwrap();
            assert_eq!(p, reference, "batch_size {batch_size}");
        }
        assert_eq!(reference[5], None);
        assert!(reference[..5].iter().all(|p| p.is_some()));
    }

    #[test]
    fn test_same_seed_same_distribution() {
        let mut a = NullModel::new(200, 5, 1234, None);
        let mut b = NullModel::new(200, 5, 1234, None);
        a.ensure([(2, 9), (5, 20)]).unwrap();
        b.ensure([(5, 20)]).unwrap();
        b.ensure([(2, 9)]).unwrap();
        assert_eq!(a.distribution((2, 9)), b.distribution((2, 9)));
        assert_eq!(a.distribution((5, 20)), b.distribution((5, 20)));
        assert_eq!(a.draws(), 400);
    }

    #[test]
    fn test_budget_is_enforced() {
        let mut model = NullModel::new(100, 5, 0, Some(150));
        model.ensure([(1, 3)]).unwrap();
        let err = model.ensure([(2, 3)]).unwrap_err();
        assert!(matches!(err, MapError::BudgetExceeded { budget: 150, requested: 200 }));
        // cached configurations cost nothing
        model.ensure([(1, 3)]).unwrap();
    }

    #[test]
    fn test_map_p_value() {
        let mut model = NullModel::new(200, 5, 77, None);
        let configs = vec![(5, 15); 8];
        model.ensure(configs.iter().copied()).unwrap();

        let seed = derive_seed(77, &[MAP_STREAM, stable_hash("Prometaphase")]);
        assert_eq!(model.map_p_value(&configs, 1.0, seed).unwrap(), 1.0 / 201.0);
        assert_eq!(model.map_p_value(&configs, 0.0, seed).unwrap(), 1.0);
        assert_eq!(model.map_p_value(&[], 0.5, seed), None);
        assert_eq!(model.map_p_value(&[(9, 9)], 0.5, seed), None);
    }

    #[test]
    fn test_null_stream_is_chacha8() {
        let mut model = NullModel::new(50, 1, 5, None);
        model.ensure([(2, 6)]).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(5, &[NULL_STREAM, 2, 6]));
        let mut expected: Vec<f64> = (0..50)
            .map(|_| {
                let mut ranks: Vec<usize> =
                    index::sample(&mut rng, 6, 2).into_iter().map(|r| r + 1).collect();
                ranks.sort_unstable();
                average_precision_from_ranks(&ranks)
            })
            .collect();
        expected.sort_by(f64::total_cmp);
        assert_eq!(model.distribution((2, 6)).unwrap(), expected.as_slice());
    }

    #[test]
    fn test_derived_streams_differ() {
        assert_ne!(derive_seed(1, &[NULL_STREAM]), derive_seed(1, &[MAP_STREAM]));
        assert_ne!(derive_seed(1, &[NULL_STREAM]), derive_seed(2, &[NULL_STREAM]));
        assert_eq!(stable_hash("A"), stable_hash("A"));
    }
}
