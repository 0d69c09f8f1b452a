//! Average precision of a query profile against its ranked partners.
//!
//! ```text
//! AP = (1 / n_pos) * Σ precision@k   over the ranks k holding a positive
//! ```
//!
//! Candidates are ranked by descending cosine similarity to the query. Ties
//! are broken by ascending profile identifier and then negatives first, so
//! the ranking never depends on the row order of the input table.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;

use crate::error::EmptyPairSet;
use crate::pairs::PairSet;
use crate::partition::Profiles;

fn l2_norm(v: ArrayView1<f64>) -> f64 {
    v.dot(&v).sqrt()
}

/// Feature matrix with its row norms computed once.
pub struct SimilarityIndex<'a> {
    feats: &'a Array2<f64>,
    norms: Array1<f64>,
}

impl<'a> SimilarityIndex<'a> {
    pub fn new(feats: &'a Array2<f64>) -> Self {
        let norms = feats.map_axis(Axis(1), l2_norm);
        Self { feats, norms }
    }

    /// Cosine similarity of rows `i` and `j`; 0 when either has zero length.
    pub fn similarity(&self, i: usize, j: usize) -> f64 {
        let denom = self.norms[i] * self.norms[j];
        if denom == 0.0 {
            return 0.0;
        }
        let sim = self.feats.row(i).dot(&self.feats.row(j)) / denom;
        if sim.is_nan() {
            // rank last
            f64::NEG_INFINITY
        } else {
            sim.clamp(-1.0, 1.0)
        }
    }
}

/// AP given the ascending 1-indexed ranks at which positives were hit.
///
/// Shared by the observed scores and the null model so both produce
/// bit-identical values for identical rankings.
pub fn average_precision_from_ranks(ranks: &[usize]) -> f64 {
    if ranks.is_empty() {
        return 0.0;
    }
    let sum: f64 = ranks
        .iter()
        .enumerate()
        .map(|(hits, &rank)| (hits + 1) as f64 / rank as f64)
        .sum();
    sum / ranks.len() as f64
}

/// AP of `query` against its positive and negative partners.
pub fn average_precision(
    index: &SimilarityIndex,
    ids: &[String],
    query: usize,
    positives: &[usize],
    negatives: &[usize],
) -> Result<f64, EmptyPairSet> {
    if positives.is_empty() {
        return Err(EmptyPairSet::NoPositives);
    }
    if negatives.is_empty() {
        return Err(EmptyPairSet::NoNegatives);
    }

    let mut ranked: Vec<(f64, &str, bool)> = positives
        .iter()
        .map(|&j| (index.similarity(query, j), ids[j].as_str(), true))
        .chain(
            negatives
                .iter()
                .map(|&j| (index.similarity(query, j), ids[j].as_str(), false)),
        )
        .collect();

    ranked.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.cmp(b.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let ranks: Vec<usize> = ranked
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.2)
        .map(|(k, _)| k + 1)
        .collect();

    Ok(average_precision_from_ranks(&ranks))
}

/// AP of the profiles at `indices` of a comparison table, in that order.
pub fn score_profiles(
    profiles: &Profiles,
    pairs: &PairSet,
    indices: &[usize],
) -> Vec<Result<f64, EmptyPairSet>> {
    let index = SimilarityIndex::new(&profiles.feats);
    indices
        .par_iter()
        .map(|&i| {
            average_precision(
                &index,
                &profiles.ids,
                i,
                &pairs.positives[i],
                &pairs.negatives[i],
            )
        })
        .collect()
}
