use std::path::PathBuf;

use polars::error::PolarsResult;
use polars::frame::DataFrame;
use tracing::info;

use crate::helper_functions::read_csv;
use crate::models::Dataset;

/// A profile table used as is.
pub struct AnyDataset {
    pub path: PathBuf,
}

impl Dataset for AnyDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading data from {}", self.path.display());
        read_csv(&self.path)
    }
}
