//! Run configuration, read from a JSON file.
//!
//! Everything a run depends on (grouping fields, null size, seed, inputs and
//! outputs) is in here; nothing is taken from ambient process state.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MapError, MapResult};
use crate::models::FeatureSubset;
use crate::pairs::GroupingPredicate;

pub const PHENOTYPE_COLUMN: &str = "Mitocheck_Phenotypic_Class";

fn default_label_column() -> String {
    PHENOTYPE_COLUMN.to_string()
}

fn default_feature_subsets() -> Vec<FeatureSubset> {
    FeatureSubset::ALL.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_sample_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./map_results")
}

/// Parameters of the MAP pipeline itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Column with a stable per-cell identifier, used to break ranking ties
    #[serde(default)]
    pub id_column: Option<String>,
    pub pos_sameby: Vec<String>,
    pub pos_diffby: Vec<String>,
    pub neg_sameby: Vec<String>,
    pub neg_diffby: Vec<String>,
    pub null_size: usize,
    pub batch_size: usize,
    #[serde(default = "default_feature_subsets")]
    pub feature_subsets: Vec<FeatureSubset>,
    #[serde(default)]
    pub random_seed: u64,
    #[serde(default = "default_true")]
    pub include_shuffled: bool,
    /// Upper bound on sampled null rankings for the whole run
    #[serde(default)]
    pub max_null_draws: Option<u64>,
    #[serde(default)]
    pub keep_profile_scores: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            label_column: default_label_column(),
            id_column: None,
            pos_sameby: vec![PHENOTYPE_COLUMN.to_string()],
            pos_diffby: vec!["Metadata_Plate".to_string(), "Metadata_Well".to_string()],
            neg_sameby: vec!["Metadata_Plate".to_string()],
            neg_diffby: vec![PHENOTYPE_COLUMN.to_string()],
            null_size: 3000,
            batch_size: 3000,
            feature_subsets: default_feature_subsets(),
            random_seed: 0,
            include_shuffled: true,
            max_null_draws: None,
            keep_profile_scores: false,
        }
    }
}

impl PipelineConfig {
    pub fn positive_predicate(&self) -> GroupingPredicate {
        GroupingPredicate {
            same_by: self.pos_sameby.clone(),
            diff_by: self.pos_diffby.clone(),
        }
    }

    pub fn negative_predicate(&self) -> GroupingPredicate {
        GroupingPredicate {
            same_by: self.neg_sameby.clone(),
            diff_by: self.neg_diffby.clone(),
        }
    }

    pub fn validate(&self) -> MapResult<()> {
        if self.null_size == 0 {
            return Err(MapError::InvalidConfiguration("null_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(MapError::InvalidConfiguration("batch_size must be > 0".into()));
        }
        if self.label_column.is_empty() {
            return Err(MapError::InvalidConfiguration("label_column is empty".into()));
        }
        if self.feature_subsets.is_empty() {
            return Err(MapError::InvalidConfiguration("no feature subsets configured".into()));
        }
        let unique: HashSet<_> = self.feature_subsets.iter().collect();
        if unique.len() != self.feature_subsets.len() {
            return Err(MapError::InvalidConfiguration(format!(
                "feature subsets listed more than once: {:?}",
                self.feature_subsets
            )));
        }
        self.positive_predicate().validate("positive pairs")?;
        self.negative_predicate().validate("negative pairs")?;
        Ok(())
    }
}

/// A control population compared against every phenotype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSet {
    pub name: String,
    pub path: PathBuf,
    /// Value written into the label column for these cells
    pub label: String,
    /// Keep only this fraction of the control cells
    #[serde(default)]
    pub sample_fraction: Option<f64>,
    #[serde(default = "default_sample_seed")]
    pub sample_seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub training_path: PathBuf,
    /// Columns of the training table absent from the controls
    #[serde(default)]
    pub drop_columns: Vec<String>,
    pub control_sets: Vec<ControlSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> MapResult<Self> {
        info!("Reading run configuration from {}", path.display());
        let text = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MapResult<()> {
        self.pipeline.validate()?;
        if self.data.control_sets.is_empty() {
            return Err(MapError::InvalidConfiguration("no control sets configured".into()));
        }
        let mut names = HashSet::new();
        for set in &self.data.control_sets {
            if set.name.is_empty() || !names.insert(set.name.as_str()) {
                return Err(MapError::InvalidConfiguration(format!(
                    "control set names must be unique and non-empty, got {:?}",
                    set.name
                )));
            }
            if let Some(fraction) = set.sample_fraction {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(MapError::InvalidConfiguration(format!(
                        "sample_fraction of {} must be in (0, 1], got {fraction}",
                        set.name
                    )));
                }
            }
        }
        Ok(())
    }
}
