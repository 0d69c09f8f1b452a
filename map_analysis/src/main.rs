use std::env;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::analysis::map_pipeline::run_map_pipeline;
use crate::config::RunConfig;
use crate::data_handling::any_dataset::AnyDataset;
use crate::data_handling::mitocheck::{ControlDataset, TrainingDataset};
use crate::helper_functions::{dataframe_to_csv, project_root};
use crate::models::Dataset;

mod analysis;
mod average_precision;
mod config;
mod data_handling;
mod error;
mod helper_functions;
mod models;
mod null_model;
mod pairs;
mod partition;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the MitoCheck MAP analysis");

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| project_root().join("map_config.json"));
    let config = RunConfig::from_json_file(&config_path)
        .with_context(|| format!("loading run configuration {}", config_path.display()))?;

    let training = TrainingDataset {
        source: AnyDataset {
            path: config.data.training_path.clone(),
        },
        drop_columns: config.data.drop_columns.clone(),
    }
    .load()
    .context("loading training profiles")?;
    info!("Training table: {} cells x {} columns", training.height(), training.width());

    for set in &config.data.control_sets {
        let controls = ControlDataset::from_control_set(set, &config.pipeline.label_column)
            .load()
            .with_context(|| format!("loading control set {}", set.name))?;

        info!("Running MAP pipeline against {} ({} cells)", set.name, controls.height());
        let results = match run_map_pipeline(&training, &controls, &config.pipeline) {
            Ok(results) => results,
            Err(e) => {
                error!("MAP pipeline failed for {}: {}", set.name, e);
                return Err(e).with_context(|| format!("control set {}", set.name));
            }
        };

        let out_dir = config.output_dir.join(&set.name);
        dataframe_to_csv(&mut results.to_dataframe()?, out_dir.join("map_results_all.csv"))?;
        for &subset in &config.pipeline.feature_subsets {
            let path = out_dir.join(format!("map_results_{}.csv", subset.tag()));
            dataframe_to_csv(&mut results.subset_dataframe(subset)?, path)?;
        }
        if config.pipeline.keep_profile_scores {
            dataframe_to_csv(
                &mut results.profile_scores_dataframe()?,
                out_dir.join("profile_scores.csv"),
            )?;
        }
        info!("Results for {} written to {}", set.name, out_dir.display());
    }

    info!("Finished");
    Ok(())
}
