//! Per-phenotype MAP evaluation against a control population.
//!
//! For every phenotype of the training table the cells of that phenotype are
//! stacked with the control cells, and for every configured feature subset
//! the MAP of the phenotype is computed on the real labels and, once more,
//! after one global permutation of the label column of that comparison table.
//! The permutation is drawn once per phenotype and shared by all feature
//! subsets, so the subsets stay comparable within a condition.

use std::collections::HashSet;

use polars::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::analysis::significance::{assign_q_values, mean_average_precision};
use crate::average_precision::score_profiles;
use crate::config::PipelineConfig;
use crate::error::{MapError, MapResult};
use crate::models::{FeatureSubset, ProfileScore, ResultRow};
use crate::null_model::{
    derive_seed, rank_config, stable_hash, NullModel, RankConfig, MAP_STREAM, SHUFFLE_STREAM,
};
use crate::pairs::{GroupingPredicate, PairSet};
use crate::partition::{profile_ids, split_data, Profiles};

#[derive(Debug, Clone, Default)]
pub struct MapResults {
    pub rows: Vec<ResultRow>,
    pub profile_scores: Vec<ProfileScore>,
}

impl MapResults {
    #[cfg(test)]
    pub fn row(&self, label: &str, subset: FeatureSubset, shuffled: bool) -> Option<&ResultRow> {
        self.rows
            .iter()
            .find(|r| r.label == label && r.feature_subset == subset && r.shuffled == shuffled)
    }

    /// Full result table.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        rows_to_dataframe(self.rows.iter())
    }

    /// Result table restricted to one feature subset.
    pub fn subset_dataframe(&self, subset: FeatureSubset) -> PolarsResult<DataFrame> {
        rows_to_dataframe(self.rows.iter().filter(|r| r.feature_subset == subset))
    }

    pub fn profile_scores_dataframe(&self) -> PolarsResult<DataFrame> {
        let scores = &self.profile_scores;
        DataFrame::new(vec![
            Column::from(Series::new(
                PlSmallStr::from("target_label"),
                scores.iter().map(|s| s.target_label.as_str()).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("label"),
                scores.iter().map(|s| s.label.as_str()).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("profile_id"),
                scores.iter().map(|s| s.profile_id.as_str()).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("feature_subset"),
                scores.iter().map(|s| s.feature_subset.tag()).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("shuffled"),
                scores.iter().map(|s| s.shuffled).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("n_positive"),
                scores.iter().map(|s| s.n_positive as u32).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("n_negative"),
                scores.iter().map(|s| s.n_negative as u32).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("average_precision"),
                scores.iter().map(|s| s.average_precision.ok()).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("p_value"),
                scores.iter().map(|s| s.p_value).collect::<Vec<_>>(),
            )),
            Column::from(Series::new(
                PlSmallStr::from("excluded"),
                scores
                    .iter()
                    .map(|s| s.average_precision.err().map(|e| e.as_str()))
                    .collect::<Vec<_>>(),
            )),
        ])
    }
}

fn rows_to_dataframe<'a>(rows: impl Iterator<Item = &'a ResultRow>) -> PolarsResult<DataFrame> {
    let rows: Vec<&ResultRow> = rows.collect();
    DataFrame::new(vec![
        Column::from(Series::new(
            PlSmallStr::from("label"),
            rows.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("feature_subset"),
            rows.iter().map(|r| r.feature_subset.tag()).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("shuffled"),
            rows.iter().map(|r| r.shuffled).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("mean_average_precision"),
            rows.iter().map(|r| r.mean_average_precision).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("p_value"),
            rows.iter().map(|r| r.p_value).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("q_value"),
            rows.iter().map(|r| r.q_value).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("n_profiles"),
            rows.iter().map(|r| r.n_profiles as u32).collect::<Vec<_>>(),
        )),
        Column::from(Series::new(
            PlSmallStr::from("n_scored"),
            rows.iter().map(|r| r.n_scored as u32).collect::<Vec<_>>(),
        )),
    ])
}

fn string_values(df: &DataFrame, column: &str) -> MapResult<Vec<Option<String>>> {
    let casted = df.column(column)?.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect();
    Ok(values)
}

/// Distinct labels in order of first appearance.
pub fn unique_labels(df: &DataFrame, label_column: &str) -> MapResult<Vec<String>> {
    let mut seen = HashSet::new();
    Ok(string_values(df, label_column)?
        .into_iter()
        .flatten()
        .filter(|label| seen.insert(label.clone()))
        .collect())
}

fn select_label(df: &DataFrame, label_column: &str, label: &str) -> MapResult<DataFrame> {
    let casted = df.column(label_column)?.cast(&DataType::String)?;
    let mask = casted.str()?.equal(label);
    Ok(df.filter(&mask)?)
}

/// Stack the controls under `selected`, following its column order and dtypes.
fn comparison_table(selected: &DataFrame, controls: &DataFrame) -> MapResult<DataFrame> {
    let mut columns = Vec::with_capacity(selected.width());
    for column in selected.get_columns() {
        let other = controls.column(column.name().as_str())?;
        if other.dtype() == column.dtype() {
            columns.push(other.clone());
        } else {
            let casted = other.strict_cast(column.dtype()).map_err(|e| {
                MapError::InvalidConfiguration(format!(
                    "control column {} cannot be read as {}: {e}",
                    column.name(),
                    column.dtype()
                ))
            })?;
            columns.push(casted);
        }
    }
    let aligned = DataFrame::new(columns)?;
    Ok(selected.vstack(&aligned)?)
}

/// One permutation of the whole label column.
///
/// Labels are permuted in ascending `ids` order and written back to their
/// rows, so a row's new label does not depend on the row order of `df`.
pub fn shuffle_labels(
    df: &DataFrame,
    label_column: &str,
    ids: &[String],
    seed: u64,
) -> MapResult<DataFrame> {
    let current = string_values(df, label_column)?;
    if ids.len() != current.len() {
        return Err(MapError::MisalignedTables {
            metadata_rows: current.len(),
            feature_rows: current.len(),
            ids: ids.len(),
        });
    }
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by(|&a, &b| ids[a].cmp(&ids[b]));

    let mut permuted: Vec<Option<String>> = order.iter().map(|&i| current[i].clone()).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    permuted.shuffle(&mut rng);

    let mut labels = vec![None; current.len()];
    for (&row, label) in order.iter().zip(permuted) {
        labels[row] = label;
    }

    let mut shuffled = df.clone();
    shuffled.replace(label_column, Series::new(PlSmallStr::from(label_column), labels))?;
    Ok(shuffled)
}

fn require_columns(df: &DataFrame, columns: &[&String], table: &str) -> MapResult<()> {
    let present: HashSet<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    for column in columns {
        if !present.contains(column.as_str()) {
            return Err(MapError::InvalidConfiguration(format!(
                "column {column} not found in {table} table"
            )));
        }
    }
    Ok(())
}

struct Pipeline<'a> {
    config: &'a PipelineConfig,
    pos: GroupingPredicate,
    neg: GroupingPredicate,
    null_model: NullModel,
    results: MapResults,
}

impl Pipeline<'_> {
    fn evaluate(&mut self, table: &DataFrame, label: &str, shuffled: bool) -> MapResult<()> {
        let config = self.config;
        let ids = profile_ids(table, config.id_column.as_deref())?;
        let labels = string_values(table, &config.label_column)?;

        let members: Vec<usize> = (0..table.height())
            .filter(|&i| labels[i].as_deref() == Some(label))
            .collect();
        let evaluated: Vec<usize> = if config.keep_profile_scores {
            (0..table.height()).collect()
        } else {
            members.clone()
        };

        let mut cached: Option<(PairSet, Vec<RankConfig>)> = None;
        for &subset in &config.feature_subsets {
            let (subset_meta, feats) = split_data(table, subset)?;
            let profiles = Profiles::new(subset_meta, feats, ids.clone())?;
            debug!("{subset}: {} profiles x {} features", profiles.len(), profiles.feats.ncols());

            // metadata columns are the same for every subset
            let (pairs, configs) = match cached.take() {
                Some(built) => built,
                None => {
                    let pairs = PairSet::build(&profiles.meta, &self.pos, &self.neg)?;
                    let excluded = pairs.n_excluded();
                    if excluded > 0 {
                        debug!(
                            "{label} (shuffled={shuffled}): {excluded} of {} profiles have no positive or negative partners",
                            pairs.len()
                        );
                    }
                    let configs = evaluated.iter().map(|&i| rank_config(&pairs, i)).collect();
                    (pairs, configs)
                }
            };

            let scores = score_profiles(&profiles, &pairs, &evaluated);
            let p_values = self.null_model.p_values(&scores, &configs)?;

            let mut aps = Vec::with_capacity(members.len());
            let mut scored_configs = Vec::with_capacity(members.len());
            for (k, &i) in evaluated.iter().enumerate() {
                if labels[i].as_deref() != Some(label) {
                    continue;
                }
                if let Ok(ap) = scores[k] {
                    aps.push(ap);
                    scored_configs.push(configs[k]);
                }
            }

            let map = mean_average_precision(&aps);
            let p_value = map.and_then(|observed| {
                let seed = derive_seed(
                    config.random_seed,
                    &[
                        MAP_STREAM,
                        stable_hash(label),
                        stable_hash(subset.tag()),
                        shuffled as u64,
                    ],
                );
                self.null_model.map_p_value(&scored_configs, observed, seed)
            });

            match map {
                Some(value) => info!(
                    "{label} [{subset}, shuffled={shuffled}]: MAP {value:.4}, p {:.4} ({} of {} profiles scored)",
                    p_value.unwrap_or(f64::NAN),
                    aps.len(),
                    members.len()
                ),
                None => warn!(
                    "{label} [{subset}, shuffled={shuffled}]: none of {} profiles could be scored",
                    members.len()
                ),
            }

            self.results.rows.push(ResultRow {
                label: label.to_string(),
                feature_subset: subset,
                shuffled,
                mean_average_precision: map,
                p_value,
                q_value: None,
                n_profiles: members.len(),
                n_scored: aps.len(),
            });

            if config.keep_profile_scores {
                for (k, &i) in evaluated.iter().enumerate() {
                    self.results.profile_scores.push(ProfileScore {
                        target_label: label.to_string(),
                        label: labels[i].clone().unwrap_or_default(),
                        profile_id: profiles.ids[i].clone(),
                        feature_subset: subset,
                        shuffled,
                        n_positive: configs[k].0,
                        n_negative: configs[k].1 - configs[k].0,
                        average_precision: scores[k],
                        p_value: p_values[k],
                    });
                }
            }
            cached = Some((pairs, configs));
        }
        Ok(())
    }
}

/// Evaluate every phenotype of `training` against `controls`.
///
/// `controls` must carry every column of `training` (its label column
/// holding the control label); columns are cast to the training dtypes.
pub fn run_map_pipeline(
    training: &DataFrame,
    controls: &DataFrame,
    config: &PipelineConfig,
) -> MapResult<MapResults> {
    config.validate()?;

    let pos = config.positive_predicate();
    let neg = config.negative_predicate();
    let mut required: Vec<&String> = vec![&config.label_column];
    required.extend(config.id_column.iter());
    required.extend(pos.fields());
    required.extend(neg.fields());
    require_columns(training, &required, "training")?;
    require_columns(controls, &required, "control")?;

    let labels = unique_labels(training, &config.label_column)?;
    info!(
        "Evaluating {} phenotypes against {} control cells ({} feature subsets, null size {})",
        labels.len(),
        controls.height(),
        config.feature_subsets.len(),
        config.null_size
    );

    let mut pipeline = Pipeline {
        config,
        pos,
        neg,
        null_model: NullModel::new(
            config.null_size,
            config.batch_size,
            config.random_seed,
            config.max_null_draws,
        ),
        results: MapResults::default(),
    };

    for label in &labels {
        let selected = select_label(training, &config.label_column, label)?;
        let table = comparison_table(&selected, controls)?;
        info!("Phenotype {label}: {} cells + {} controls", selected.height(), controls.height());

        pipeline.evaluate(&table, label, false)?;
        if config.include_shuffled {
            let seed = derive_seed(config.random_seed, &[SHUFFLE_STREAM, stable_hash(label)]);
            let ids = profile_ids(&table, config.id_column.as_deref())?;
            let shuffled = shuffle_labels(&table, &config.label_column, &ids, seed)?;
            pipeline.evaluate(&shuffled, label, true)?;
        }
    }

    let mut results = pipeline.results;
    assign_q_values(&mut results.rows);
    info!(
        "Finished {} result rows, {} null rankings sampled",
        results.rows.len(),
        pipeline.null_model.draws()
    );
    Ok(results)
}
