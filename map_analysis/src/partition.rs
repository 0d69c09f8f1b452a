//! Splits a profile table into a metadata frame and a feature matrix.

use ndarray::Array2;
use polars::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::models::FeatureSubset;

/// Any column whose name contains this marker is a feature, whatever the subset.
const FEATURE_MARKER: &str = "P__";

/// Row-aligned metadata, features and identifiers of one comparison table.
#[derive(Debug, Clone)]
pub struct Profiles {
    pub meta: DataFrame,
    pub feats: Array2<f64>,
    pub ids: Vec<String>,
}

impl Profiles {
    pub fn new(meta: DataFrame, feats: Array2<f64>, ids: Vec<String>) -> MapResult<Self> {
        if meta.height() != feats.nrows() || ids.len() != feats.nrows() {
            return Err(MapError::MisalignedTables {
                metadata_rows: meta.height(),
                feature_rows: feats.nrows(),
                ids: ids.len(),
            });
        }
        Ok(Self { meta, feats, ids })
    }

    pub fn len(&self) -> usize {
        self.feats.nrows()
    }
}

/// Names of all non-feature columns, in table order.
pub fn metadata_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|c| c.to_string())
        .filter(|c| !c.contains(FEATURE_MARKER))
        .collect()
}

/// Split `df` into its metadata columns and the numeric values of the
/// feature columns selected by `subset`.
///
/// Feature columns are cast to `f64`; a null or unparsable cell is an error
/// rather than a silent zero.
pub fn split_data(df: &DataFrame, subset: FeatureSubset) -> MapResult<(DataFrame, Array2<f64>)> {
    let feature_re = Regex::new(&regex::escape(subset.column_pattern()))?;

    let feature_cols: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|c| c.to_string())
        .filter(|c| feature_re.is_match(c))
        .collect();

    if feature_cols.is_empty() {
        return Err(MapError::EmptyFeatureSubset(subset.tag().to_string()));
    }

    let meta = df.select(metadata_columns(df))?;

    let mut feats = Array2::<f64>::zeros((df.height(), feature_cols.len()));
    for (j, name) in feature_cols.iter().enumerate() {
        let casted = df.column(name)?.cast(&DataType::Float64)?;
        for (i, v) in casted.f64()?.into_iter().enumerate() {
            feats[[i, j]] = v.ok_or_else(|| MapError::MissingFeatureValue {
                column: name.clone(),
                row: i,
            })?;
        }
    }

    debug!(
        "Split {} rows into {} metadata and {} {} feature columns",
        df.height(),
        meta.width(),
        feature_cols.len(),
        subset
    );
    Ok((meta, feats))
}

/// Identifiers used to break ranking ties.
///
/// Taken from `id_column` when one is configured; otherwise the row position
/// in `df` (ties are then only reproducible for a fixed row order).
pub fn profile_ids(df: &DataFrame, id_column: Option<&str>) -> MapResult<Vec<String>> {
    match id_column {
        Some(name) => {
            let casted = df.column(name)?.cast(&DataType::String)?;
            Ok(casted
                .str()?
                .into_iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Some(id) => id.to_string(),
                    None => format!("row-{i:09}"),
                })
                .collect())
        }
        None => Ok((0..df.height()).map(|i| format!("row-{i:09}")).collect()),
    }
}
