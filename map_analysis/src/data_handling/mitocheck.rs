//! MitoCheck single-cell profile tables.

use std::path::PathBuf;

use polars::prelude::*;
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};

use crate::config::{ControlSet, PHENOTYPE_COLUMN};
use crate::data_handling::any_dataset::AnyDataset;
use crate::models::Dataset;

/// Labelled training cells. Columns the controls do not carry are dropped.
pub struct TrainingDataset {
    pub source: AnyDataset,
    pub drop_columns: Vec<String>,
}

impl TrainingDataset {
    pub fn prepare(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let mut df = df;
        for column in &self.drop_columns {
            if df.get_column_index(column).is_some() {
                df = df.drop(column)?;
            }
        }
        Ok(df)
    }
}

impl Dataset for TrainingDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        let df = match self.source.load() {
            Ok(df) => df,
            Err(e) => {
                error!("Failed to read training CSV: {}", e);
                return Err(e);
            }
        };
        self.prepare(df)
    }
}

/// Control cells, which carry no phenotype label of their own.
pub struct ControlDataset {
    pub source: AnyDataset,
    pub label_column: String,
    pub label: String,
    pub sample_fraction: Option<f64>,
    pub sample_seed: u64,
}

impl ControlDataset {
    pub fn from_control_set(set: &ControlSet, label_column: &str) -> Self {
        Self {
            source: AnyDataset {
                path: set.path.clone(),
            },
            label_column: label_column.to_string(),
            label: set.label.clone(),
            sample_fraction: set.sample_fraction,
            sample_seed: set.sample_seed,
        }
    }

    /// Keep `round(fraction * n)` rows chosen with the sample seed, in their
    /// original order, then put the label column first.
    pub fn prepare(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let mut df = match self.sample_fraction {
            Some(fraction) => {
                let n = df.height();
                let keep = ((fraction * n as f64).round() as usize).min(n);
                let mut rng = ChaCha8Rng::seed_from_u64(self.sample_seed);
                let mut rows: Vec<IdxSize> = index::sample(&mut rng, n, keep)
                    .into_iter()
                    .map(|i| i as IdxSize)
                    .collect();
                rows.sort_unstable();
                info!("Sampled {} of {} control cells", keep, n);
                df.take(&IdxCa::from_vec(PlSmallStr::from("rows"), rows))?
            }
            None => df,
        };

        if df.get_column_index(&self.label_column).is_some() {
            df = df.drop(&self.label_column)?;
        }
        let labels = Series::new(
            PlSmallStr::from(self.label_column.as_str()),
            vec![self.label.as_str(); df.height()],
        );
        df.insert_column(0, labels)?;
        Ok(df)
    }
}

impl Dataset for ControlDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Loading {} cells", self.label);
        let df = match self.source.load() {
            Ok(df) => df,
            Err(e) => {
                error!("Failed to read control CSV: {}", e);
                return Err(e);
            }
        };
        self.prepare(df)
    }
}

impl Default for ControlDataset {
    fn default() -> Self {
        Self {
            source: AnyDataset {
                path: PathBuf::new(),
            },
            label_column: PHENOTYPE_COLUMN.to_string(),
            label: "neg_control".to_string(),
            sample_fraction: None,
            sample_seed: 42,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper_functions::dataframe_to_csv;

    fn controls(n: usize) -> DataFrame {
        df![
            "Metadata_Plate" => vec!["LT0601_01"; n],
            "Metadata_Well" => (0..n).map(|i| format!("W{i:03}")).collect::<Vec<_>>(),
            "CP__area" => (0..n).map(|i| i as f64).collect::<Vec<_>>(),
        ]
        .unwrap()
    }

    #[test]
    fn control_label_is_inserted_first() {
        let dataset = ControlDataset {
            label: "pos_control".to_string(),
            ..ControlDataset::default()
        };
        let df = dataset.prepare(controls(4)).unwrap();

        assert_eq!(df.get_column_names()[0].as_str(), PHENOTYPE_COLUMN);
        assert_eq!(df.width(), 4);
        let labels = df.column(PHENOTYPE_COLUMN).unwrap().str().unwrap();
        assert!(labels.into_iter().all(|v| v == Some("pos_control")));
    }

    #[test]
    fn sampling_is_seeded_and_keeps_order() {
        let dataset = ControlDataset {
            sample_fraction: Some(0.1),
            ..ControlDataset::default()
        };
        let a = dataset.prepare(controls(205)).unwrap();
        let b = dataset.prepare(controls(205)).unwrap();
        // round(20.5) rounds away from zero
        assert_eq!(a.height(), 21);
        assert!(a.equals(&b));

        let area: Vec<f64> = a
            .column("CP__area")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!(area.windows(2).all(|w| w[0] < w[1]));

        let other_seed = ControlDataset {
            sample_seed: 7,
            ..dataset
        };
        assert!(!other_seed.prepare(controls(205)).unwrap().equals(&a));
    }

    #[test]
    fn full_fraction_keeps_everything() {
        let dataset = ControlDataset {
            sample_fraction: Some(1.0),
            ..ControlDataset::default()
        };
        assert_eq!(dataset.prepare(controls(9)).unwrap().height(), 9);
    }

    #[test]
    fn training_drops_outline_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.csv");
        let mut df = df![
            PHENOTYPE_COLUMN => &["Interphase", "Binuclear"],
            "Metadata_Object_Outline" => &["[[1, 2]]", "[[3, 4]]"],
            "CP__area" => &[1.0, 2.0],
        ]
        .unwrap();
        dataframe_to_csv(&mut df, &path).unwrap();

        let dataset = TrainingDataset {
            source: AnyDataset { path },
            drop_columns: vec!["Metadata_Object_Outline".to_string(), "Not_There".to_string()],
        };
        let loaded = dataset.load().unwrap();
        assert_eq!(loaded.width(), 2);
        assert!(loaded.column("Metadata_Object_Outline").is_err());
    }
}
