//! Error types for the MAP pipeline.
//!
//! Structural problems (bad configuration, misaligned tables) abort a run.
//! A profile without partners is not an error of the run: it is reported as
//! an [`EmptyPairSet`] and surfaces as a null in the result tables.

use polars::error::PolarsError;
use thiserror::Error;

/// Fatal errors raised by the pipeline.
#[derive(Debug, Error)]
pub enum MapError {
    /// Feature-subset tag is not one of the known partitions
    #[error("Invalid partition tag: {0}")]
    InvalidPartitionTag(String),
    /// The partition rule selected no feature columns
    #[error("No feature columns selected for subset {0}")]
    EmptyFeatureSubset(String),
    /// A feature cell is null or cannot be read as a float
    #[error("Missing feature value in column {column} at row {row}")]
    MissingFeatureValue { column: String, row: usize },
    /// Metadata, feature matrix and identifiers disagree on the number of rows
    #[error(
        "Misaligned tables: {metadata_rows} metadata rows, {feature_rows} feature rows, {ids} identifiers"
    )]
    MisalignedTables {
        metadata_rows: usize,
        feature_rows: usize,
        ids: usize,
    },
    /// Configuration rejected before any computation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Null sampling would exceed the configured draw budget
    #[error("Null sampling budget exceeded: {requested} draws requested, budget is {budget}")]
    BudgetExceeded { budget: u64, requested: u64 },
    #[error(transparent)]
    Polars(#[from] PolarsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type MapResult<T> = Result<T, MapError>;

/// Why a profile could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmptyPairSet {
    #[error("no positive partners")]
    NoPositives,
    #[error("no negative partners")]
    NoNegatives,
}

impl EmptyPairSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyPairSet::NoPositives => "no_positives",
            EmptyPairSet::NoNegatives => "no_negatives",
        }
    }
}
