use std::collections::BTreeMap;

use statrs::statistics::Statistics;

use crate::models::{FeatureSubset, ResultRow};

/// Mean of the defined AP values, `None` when there are none.
///
/// Values are summed in ascending order so the result does not depend on
/// the row order of the comparison table.
pub fn mean_average_precision(aps: &[f64]) -> Option<f64> {
    if aps.is_empty() {
        return None;
    }
    let mut sorted = aps.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted.iter().mean())
}

/// Benjamini–Hochberg adjusted p-values. Missing p-values are left out of
/// the correction and stay missing.
pub fn benjamini_hochberg(p_values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut present: Vec<(usize, f64)> = p_values
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.map(|p| (i, p)))
        .collect();
    present.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let m = present.len() as f64;
    let mut out = vec![None; p_values.len()];
    let mut running_min = 1.0_f64;
    for (rank, &(i, p)) in present.iter().enumerate().rev() {
        let q = (p * m / (rank + 1) as f64).min(running_min);
        running_min = q;
        out[i] = Some(q);
    }
    out
}

/// Fill `q_value` of every row, correcting across labels within each
/// (feature subset, shuffled) group.
pub fn assign_q_values(rows: &mut [ResultRow]) {
    let mut groups: BTreeMap<(FeatureSubset, bool), Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        groups.entry((row.feature_subset, row.shuffled)).or_default().push(i);
    }
    for members in groups.values() {
        let p: Vec<Option<f64>> = members.iter().map(|&i| rows[i].p_value).collect();
        for (&i, q) in members.iter().zip(benjamini_hochberg(&p)) {
            rows[i].q_value = q;
        }
    }
}
