use std::fmt;
use std::str::FromStr;

use polars::prelude::{DataFrame, PolarsResult};
use serde::{Deserialize, Serialize};

use crate::error::{EmptyPairSet, MapError};

/// Loads a profile table from wherever it is persisted.
pub trait Dataset {
    fn load(&self) -> PolarsResult<DataFrame>;
}

/// Feature partitions of a MitoCheck profile table.
///
/// CellProfiler features carry a `CP__` prefix, DeepProfiler features a
/// `DP__` prefix; the combined subset takes every `P__` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeatureSubset {
    CellProfiler,
    DeepProfiler,
    Combined,
}

impl FeatureSubset {
    pub const ALL: [FeatureSubset; 3] = [
        FeatureSubset::CellProfiler,
        FeatureSubset::DeepProfiler,
        FeatureSubset::Combined,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            FeatureSubset::CellProfiler => "CP",
            FeatureSubset::DeepProfiler => "DP",
            FeatureSubset::Combined => "CP_and_DP",
        }
    }

    /// Column-name pattern selecting this subset's features.
    pub fn column_pattern(&self) -> &'static str {
        match self {
            FeatureSubset::CellProfiler => "CP__",
            FeatureSubset::DeepProfiler => "DP__",
            FeatureSubset::Combined => "P__",
        }
    }
}

impl fmt::Display for FeatureSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FeatureSubset {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CP" => Ok(FeatureSubset::CellProfiler),
            "DP" => Ok(FeatureSubset::DeepProfiler),
            "CP_and_DP" => Ok(FeatureSubset::Combined),
            other => Err(MapError::InvalidPartitionTag(other.to_string())),
        }
    }
}

impl TryFrom<String> for FeatureSubset {
    type Error = MapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeatureSubset> for String {
    fn from(subset: FeatureSubset) -> Self {
        subset.tag().to_string()
    }
}

/// One line of the result table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub label: String,
    pub feature_subset: FeatureSubset,
    pub shuffled: bool,
    /// `None` when none of the label's profiles could be scored
    pub mean_average_precision: Option<f64>,
    pub p_value: Option<f64>,
    pub q_value: Option<f64>,
    /// Profiles carrying the label in the comparison table
    pub n_profiles: usize,
    /// Profiles among those with a defined AP
    pub n_scored: usize,
}

/// Per-profile outcome, kept when `keep_profile_scores` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileScore {
    pub target_label: String,
    pub label: String,
    pub profile_id: String,
    pub feature_subset: FeatureSubset,
    pub shuffled: bool,
    pub n_positive: usize,
    pub n_negative: usize,
    pub average_precision: Result<f64, EmptyPairSet>,
    pub p_value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_back() {
        for subset in FeatureSubset::ALL {
            assert_eq!(subset.tag().parse::<FeatureSubset>().unwrap(), subset);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = "CP_DP".parse::<FeatureSubset>().unwrap_err();
        assert!(matches!(err, MapError::InvalidPartitionTag(t) if t == "CP_DP"));
    }

    #[test]
    fn subsets_deserialize_from_tags() {
        let parsed: Vec<FeatureSubset> = serde_json::from_str(r#"["DP", "CP_and_DP"]"#).unwrap();
        assert_eq!(parsed, vec![FeatureSubset::DeepProfiler, FeatureSubset::Combined]);
        assert!(serde_json::from_str::<Vec<FeatureSubset>>(r#"["XP"]"#).is_err());
    }
}
