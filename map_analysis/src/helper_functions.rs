use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{error, info};

pub fn project_root() -> PathBuf {
    match env::var_os("PROJECT_ROOT") {
        Some(val) => PathBuf::from(val),
        // fall back to the working directory
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

pub fn read_csv(file_path: impl AsRef<Path>) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(file_path.as_ref().to_path_buf()))?
        .finish()
}

/// Write `df` as a comma separated file with header, creating parent folders.
pub fn dataframe_to_csv(df: &mut DataFrame, file_path: impl AsRef<Path>) -> PolarsResult<()> {
    let path = file_path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    info!("Writing {} rows to {}", df.height(), path.display());
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b',')
        .finish(df)
        .map_err(|e| {
            error!("Failed to write {}: {}", path.display(), e);
            e
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip_creates_folders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/table.csv");
        let mut df = df![
            "Mitocheck_Phenotypic_Class" => &["Prometaphase", "Apoptosis"],
            "CP__area" => &[1.5, 2.25],
        ]
        .unwrap();

        dataframe_to_csv(&mut df, &path).unwrap();
        let back = read_csv(&path).unwrap();
        assert_eq!(back.shape(), (2, 2));
        assert_eq!(
            back.column("CP__area").unwrap().f64().unwrap().get(1),
            Some(2.25)
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_csv(dir.path().join("absent.csv")).is_err());
    }
}
