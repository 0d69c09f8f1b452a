//! Positive and negative pair enumeration from metadata grouping rules.
//!
//! Two rows `i != j` are partners under a [`GroupingPredicate`] when every
//! `same_by` field is equal and at least one `diff_by` field differs. Rows
//! are bucketed by their `same_by` values so only rows inside one bucket are
//! ever compared; the outcome is the same as checking every pair.

use std::collections::{HashMap, HashSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EmptyPairSet, MapError, MapResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingPredicate {
    pub same_by: Vec<String>,
    pub diff_by: Vec<String>,
}

impl GroupingPredicate {
    /// A field cannot be required to match and to differ at the same time.
    pub fn validate(&self, name: &str) -> MapResult<()> {
        let same: HashSet<&str> = self.same_by.iter().map(String::as_str).collect();
        let overlap: Vec<&str> = self
            .diff_by
            .iter()
            .map(String::as_str)
            .filter(|f| same.contains(f))
            .collect();
        if !overlap.is_empty() {
            return Err(MapError::InvalidConfiguration(format!(
                "{name}: fields {overlap:?} appear in both same_by and diff_by"
            )));
        }
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.same_by.iter().chain(self.diff_by.iter())
    }
}

/// String rendering of the metadata fields the predicates look at.
#[derive(Debug, Clone)]
pub struct MetadataKeys {
    height: usize,
    columns: HashMap<String, Vec<Option<String>>>,
}

impl MetadataKeys {
    pub fn from_frame<'a>(
        meta: &DataFrame,
        fields: impl IntoIterator<Item = &'a String>,
    ) -> MapResult<Self> {
        let mut columns = HashMap::new();
        for field in fields {
            if columns.contains_key(field) {
                continue;
            }
            let column = meta.column(field).map_err(|_| {
                MapError::InvalidConfiguration(format!("column {field} not found in metadata"))
            })?;
            let casted = column.cast(&DataType::String)?;
            let values: Vec<Option<String>> = casted
                .str()?
                .into_iter()
                .map(|v| v.map(str::to_string))
                .collect();
            columns.insert(field.clone(), values);
        }
        Ok(Self {
            height: meta.height(),
            columns,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn column(&self, name: &str) -> MapResult<&[Option<String>]> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| MapError::InvalidConfiguration(format!("column {name} was not extracted")))
    }
}

/// Partner lists of every row under `predicate`, each sorted ascending.
///
/// Rows with a null in any `same_by` field have no partners. For `diff_by`
/// two nulls count as equal. An empty `diff_by` imposes no constraint.
pub fn find_partners(keys: &MetadataKeys, predicate: &GroupingPredicate) -> MapResult<Vec<Vec<usize>>> {
    let same = predicate
        .same_by
        .iter()
        .map(|c| keys.column(c))
        .collect::<MapResult<Vec<_>>>()?;
    let diff = predicate
        .diff_by
        .iter()
        .map(|c| keys.column(c))
        .collect::<MapResult<Vec<_>>>()?;

    let mut buckets: HashMap<Vec<&str>, Vec<usize>> = HashMap::new();
    'rows: for i in 0..keys.height() {
        let mut key = Vec::with_capacity(same.len());
        for col in &same {
            match col[i].as_deref() {
                Some(v) => key.push(v),
                None => continue 'rows,
            }
        }
        buckets.entry(key).or_default().push(i);
    }

    let mut partners = vec![Vec::new(); keys.height()];
    for members in buckets.values() {
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[a + 1..] {
                if differs(&diff, i, j) {
                    partners[i].push(j);
                    partners[j].push(i);
                }
            }
        }
    }
    for p in partners.iter_mut() {
        p.sort_unstable();
    }

    debug!(
        "{} same_by buckets over {} rows for {:?}",
        buckets.len(),
        keys.height(),
        predicate.same_by
    );
    Ok(partners)
}

fn differs(diff: &[&[Option<String>]], i: usize, j: usize) -> bool {
    diff.is_empty() || diff.iter().any(|col| col[i] != col[j])
}

/// Positive and negative partners of every profile in a comparison table.
#[derive(Debug, Clone)]
pub struct PairSet {
    pub positives: Vec<Vec<usize>>,
    pub negatives: Vec<Vec<usize>>,
}

impl PairSet {
    pub fn build(meta: &DataFrame, pos: &GroupingPredicate, neg: &GroupingPredicate) -> MapResult<Self> {
        let keys = MetadataKeys::from_frame(meta, pos.fields().chain(neg.fields()))?;
        Ok(Self {
            positives: find_partners(&keys, pos)?,
            negatives: find_partners(&keys, neg)?,
        })
    }

    pub fn len(&self) -> usize {
        self.positives.len()
    }

    /// Whether profile `i` can be ranked at all.
    pub fn check(&self, i: usize) -> Result<(), EmptyPairSet> {
        if self.positives[i].is_empty() {
            Err(EmptyPairSet::NoPositives)
        } else if self.negatives[i].is_empty() {
            Err(EmptyPairSet::NoNegatives)
        } else {
            Ok(())
        }
    }

    /// Number of profiles that cannot be scored.
    pub fn n_excluded(&self) -> usize {
        (0..self.len()).filter(|&i| self.check(i).is_err()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn grouping(same_by: &[&str], diff_by: &[&str]) -> GroupingPredicate {
        GroupingPredicate {
            same_by: same_by.iter().map(|s| s.to_string()).collect(),
            diff_by: diff_by.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn naive_partners(keys: &MetadataKeys, predicate: &GroupingPredicate) -> Vec<Vec<usize>> {
        let same: Vec<_> = predicate.same_by.iter().map(|c| keys.column(c).unwrap()).collect();
        let diff: Vec<_> = predicate.diff_by.iter().map(|c| keys.column(c).unwrap()).collect();
        let n = keys.height();
        let mut out = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let same_ok = same
                    .iter()
                    .all(|col| col[i].is_some() && col[j].is_some() && col[i] == col[j]);
                if same_ok && differs(&diff, i, j) {
                    out[i].push(j);
                }
            }
        }
        out
    }

    fn random_meta(n: usize, seed: u64) -> DataFrame {
        let mut rng = StdRng::seed_from_u64(seed);
        let labels: Vec<&str> = (0..n).map(|_| ["A", "B", "C"][rng.gen_range(0..3)]).collect();
        let plates: Vec<i64> = (0..n).map(|_| rng.gen_range(0..3)).collect();
        let wells: Vec<Option<&str>> = (0..n)
            .map(|_| match rng.gen_range(0..5) {
                0 => None,
                k => Some(["A01", "A02", "B01", "B02"][k - 1]),
            })
            .collect();
        df![
            "label" => labels,
            "Metadata_Plate" => plates,
            "Metadata_Well" => wells,
        ]
        .unwrap()
    }

    #[test]
    fn three_profiles_per_label_have_two_positives() {
        let meta = df![
            "label" => &["A", "A", "A", "B", "B", "B"],
            "well" => &["w1", "w2", "w3", "w4", "w5", "w6"],
            "plate" => &["p1", "p1", "p1", "p1", "p1", "p1"],
        ]
        .unwrap();
        let pos = grouping(&["label"], &["well"]);
        let neg = grouping(&["plate"], &["label"]);
        let pairs = PairSet::build(&meta, &pos, &neg).unwrap();

        for i in 0..6 {
            assert_eq!(pairs.positives[i].len(), 2, "profile {i}");
            assert_eq!(pairs.negatives[i].len(), 3, "profile {i}");
        }
        assert_eq!(pairs.positives[0], vec![1, 2]);
        assert_eq!(pairs.negatives[4], vec![0, 1, 2]);
        assert_eq!(pairs.n_excluded(), 0);
    }

    #[test]
    fn bucketing_matches_the_naive_rule() {
        let meta = random_meta(60, 7);
        let predicates = [
            grouping(&["label"], &["Metadata_Plate", "Metadata_Well"]),
            grouping(&["Metadata_Plate"], &["label"]),
            grouping(&["label", "Metadata_Well"], &["Metadata_Plate"]),
            grouping(&[], &["label"]),
        ];
        for predicate in &predicates {
            let keys = MetadataKeys::from_frame(&meta, predicate.fields()).unwrap();
            assert_eq!(
                find_partners(&keys, predicate).unwrap(),
                naive_partners(&keys, predicate),
                "{predicate:?}"
            );
        }
    }

    #[test]
    fn partners_are_symmetric_and_never_self() {
        let meta = random_meta(80, 11);
        let predicate = grouping(&["label"], &["Metadata_Plate", "Metadata_Well"]);
        let keys = MetadataKeys::from_frame(&meta, predicate.fields()).unwrap();
        let partners = find_partners(&keys, &predicate).unwrap();
        for (i, list) in partners.iter().enumerate() {
            assert!(!list.contains(&i));
            for &j in list {
                assert!(partners[j].contains(&i), "{i} -> {j} not mirrored");
            }
        }
    }

    #[test]
    fn any_differing_diff_field_is_enough() {
        let meta = df![
            "label" => &["A", "A", "A"],
            "Metadata_Plate" => &[1, 1, 2],
            "Metadata_Well" => &["A01", "A02", "A01"],
        ]
        .unwrap();
        let predicate = grouping(&["label"], &["Metadata_Plate", "Metadata_Well"]);
        let keys = MetadataKeys::from_frame(&meta, predicate.fields()).unwrap();
        let partners = find_partners(&keys, &predicate).unwrap();
        assert_eq!(partners[0], vec![1, 2]);
        assert_eq!(partners[1], vec![0, 2]);
    }

    #[test]
    fn null_same_by_value_pairs_with_nobody() {
        let meta = df![
            "label" => &[Some("A"), None, Some("A")],
            "well" => &["w1", "w2", "w3"],
        ]
        .unwrap();
        let predicate = grouping(&["label"], &["well"]);
        let keys = MetadataKeys::from_frame(&meta, predicate.fields()).unwrap();
        let partners = find_partners(&keys, &predicate).unwrap();
        assert!(partners[1].is_empty());
        assert_eq!(partners[0], vec![2]);
    }

    #[test]
    fn empty_diff_by_pairs_every_match() {
        let meta = df!["label" => &["A", "A", "B"]].unwrap();
        let predicate = grouping(&["label"], &[]);
        let keys = MetadataKeys::from_frame(&meta, predicate.fields()).unwrap();
        let partners = find_partners(&keys, &predicate).unwrap();
        assert_eq!(partners, vec![vec![1], vec![0], vec![]]);
    }

    #[test]
    fn excluded_profiles_report_the_reason() {
        let meta = df![
            "label" => &["A", "B", "B"],
            "well" => &["w1", "w2", "w3"],
            "plate" => &["p1", "p2", "p2"],
        ]
        .unwrap();
        let pos = grouping(&["label"], &["well"]);
        let neg = grouping(&["plate"], &["label"]);
        let pairs = PairSet::build(&meta, &pos, &neg).unwrap();
        assert_eq!(pairs.check(0), Err(EmptyPairSet::NoPositives));
        assert_eq!(pairs.check(1), Err(EmptyPairSet::NoNegatives));
        assert_eq!(pairs.n_excluded(), 3);
    }

    #[test]
    fn unknown_column_is_a_configuration_error() {
        let meta = df!["label" => &["A"]].unwrap();
        let pos = grouping(&["label"], &["Metadata_Well"]);
        let neg = grouping(&["label"], &[]);
        let err = PairSet::build(&meta, &pos, &neg).unwrap_err();
        assert!(matches!(err, MapError::InvalidConfiguration(_)));
    }

    #[test]
    fn overlapping_fields_are_rejected() {
        let predicate = grouping(&["label", "plate"], &["plate"]);
        assert!(predicate.validate("pos").is_err());
        assert!(grouping(&["label"], &["plate"]).validate("pos").is_ok());
    }
}
