use gbdt::config::Config as GBDTConfig;
use gbdt::decision_tree::{DataVec, ValueType};
use gbdt::gradient_boost::GBDT;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use super::traits::{Classifier, IntoDataVec};
use crate::config::{ModelConfig, ModelOverrides};
use crate::data_loader::{FeatureTable, TargetVector};
use crate::error::{CrisisError, Result};
use crate::metrics;

/// Rounds without improvement tolerated before early stopping.
pub const DEFAULT_PATIENCE: usize = 10;

const ARTIFACT_VERSION: u32 = 1;
const BINARY_LOSS: &str = "LogLikelyhood";

/// Untrained crisis classifier: hyperparameters only.
///
/// Inference lives on [`TrainedCrisisModel`], so it cannot be reached before
/// training or loading:
///
/// ```compile_fail
/// use crisis_gbdt::{Classifier, CrisisModel, FeatureTable, ModelConfig};
///
/// fn score(features: &FeatureTable) {
///     let model = CrisisModel::new(ModelConfig::default());
///     let _ = model.predict_proba(features);
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CrisisModel {
    config: ModelConfig,
}

impl CrisisModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn with_overrides(overrides: ModelOverrides) -> Self {
        Self::new(ModelConfig::default().with_overrides(overrides))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Trains on the full `n_estimators` rounds without validation.
    pub fn fit(&self, features: &FeatureTable, targets: &TargetVector) -> Result<TrainedCrisisModel> {
        self.train(features, targets, &[], None)
    }

    /// Fits the ensemble on (X, y).
    ///
    /// With validation pairs the eval metric is tracked on the last pair after
    /// every round, and training stops once it has not improved for
    /// `patience` rounds (default [`DEFAULT_PATIENCE`]). The ensemble from the
    /// best round is kept.
    #[instrument(skip_all, fields(rows = features.height(), features = features.width()))]
    pub fn train(
        &self,
        features: &FeatureTable,
        targets: &TargetVector,
        validation: &[(FeatureTable, TargetVector)],
        patience: Option<usize>,
    ) -> Result<TrainedCrisisModel> {
        self.config.validate()?;
        if features.height() == 0 || features.width() == 0 {
            return Err(CrisisError::Computation(format!(
                "Cannot train on an empty feature table ({} rows, {} columns)",
                features.height(),
                features.width()
            )));
        }
        ensure_finite(features, "Training")?;
        if let Some((valid_features, _)) = validation.last() {
            ensure_finite(valid_features, "Validation")?;
        }
        let labels = targets.labels()?;
        if !(labels.contains(&0) && labels.contains(&1)) {
            return Err(CrisisError::Computation(
                "Training target must contain both classes".to_string(),
            ));
        }

        info!(params = ?self.config, "Training GBDT model");
        let feature_names = features.feature_names();
        let knobs = TrainerKnobs::resolve(&self.config);
        let train_data = features.to_data_vec(Some(&labels))?;
        let trainer = Trainer {
            config: &self.config,
            knobs,
            n_features: feature_names.len(),
            train_data: &train_data,
        };

        let (ensemble, best_iteration) = match validation.last() {
            Some((valid_features, valid_targets)) => {
                let valid_data = valid_features.select(&feature_names)?.to_data_vec(None)?;
                let valid_labels = valid_targets.labels()?;
                if valid_labels.len() != valid_data.len() {
                    return Err(CrisisError::Computation(format!(
                        "Validation feature rows ({}) and target rows ({}) differ",
                        valid_data.len(),
                        valid_labels.len()
                    )));
                }
                let patience = patience.unwrap_or(DEFAULT_PATIENCE).max(1);
                let (ensemble, best) =
                    trainer.fit_with_early_stopping(&valid_data, &valid_labels, patience)?;
                (ensemble, Some(best))
            }
            None => (trainer.fit_rounds(self.config.n_estimators), None),
        };

        let importances = permutation_importance(&ensemble, &train_data, &labels, &self.config)?;
        info!(best_iteration = ?best_iteration, "Training completed");

        Ok(TrainedCrisisModel {
            config: self.config.clone(),
            feature_names,
            importances,
            best_iteration,
            ensemble,
        })
    }
}

/// `gbdt` settings taken from the pass-through trainer map.
#[derive(Debug, Clone, Copy, Default)]
struct TrainerKnobs {
    min_leaf_size: Option<usize>,
    data_sample_ratio: Option<f64>,
    feature_sample_ratio: Option<f64>,
    training_optimization_level: Option<u8>,
    debug: Option<bool>,
}

impl TrainerKnobs {
    fn resolve(config: &ModelConfig) -> Self {
        let mut knobs = TrainerKnobs::default();
        for (key, value) in &config.trainer {
            let applied = match key.as_str() {
                "min_leaf_size" => value.as_usize().map(|v| knobs.min_leaf_size = Some(v)),
                "data_sample_ratio" => value.as_f64().map(|v| knobs.data_sample_ratio = Some(v)),
                "feature_sample_ratio" => {
                    value.as_f64().map(|v| knobs.feature_sample_ratio = Some(v))
                }
                "training_optimization_level" => value
                    .as_usize()
                    .and_then(|v| u8::try_from(v).ok())
                    .map(|v| knobs.training_optimization_level = Some(v)),
                "debug" => value.as_bool().map(|v| knobs.debug = Some(v)),
                _ => {
                    warn!(key = %key, value = ?value, "gbdt has no such parameter, ignoring it");
                    continue;
                }
            };
            if applied.is_none() {
                warn!(key = %key, value = ?value, "Unusable value for trainer parameter, ignoring it");
            }
        }
        if knobs.data_sample_ratio.is_some_and(|r| r < 1.0)
            || knobs.feature_sample_ratio.is_some_and(|r| r < 1.0)
        {
            warn!("gbdt subsampling is not seeded, training will not be reproducible");
        }
        knobs
    }
}

struct Trainer<'a> {
    config: &'a ModelConfig,
    knobs: TrainerKnobs,
    n_features: usize,
    train_data: &'a DataVec,
}

impl Trainer<'_> {
    fn gbdt_config(&self, iterations: usize) -> GBDTConfig {
        let mut cfg = GBDTConfig::new();
        cfg.set_feature_size(self.n_features);
        cfg.set_max_depth(self.config.max_depth);
        cfg.set_iterations(iterations);
        cfg.set_shrinkage(self.config.learning_rate);
        cfg.set_loss(BINARY_LOSS);
        cfg.set_debug(self.knobs.debug.unwrap_or(false));
        cfg.set_data_sample_ratio(self.knobs.data_sample_ratio.unwrap_or(1.0));
        cfg.set_feature_sample_ratio(self.knobs.feature_sample_ratio.unwrap_or(1.0));
        cfg.set_training_optimization_level(self.knobs.training_optimization_level.unwrap_or(2));
        if let Some(min_leaf_size) = self.knobs.min_leaf_size {
            cfg.set_min_leaf_size(min_leaf_size);
        }
        cfg
    }

    fn fit_rounds(&self, iterations: usize) -> GBDT {
        let mut gbdt = GBDT::new(&self.gbdt_config(iterations));
        // fit overwrites residuals in place
        let mut data = self.train_data.clone();
        gbdt.fit(&mut data);
        gbdt
    }

    /// Grows the ensemble one round at a time, scoring each size on the
    /// validation rows. Training is deterministic, so an ensemble of `k`
    /// rounds equals the first `k` trees of a longer run.
    ///
    /// `gbdt` cannot resume a fit, so round `k` refits `k` trees from scratch
    /// and the whole search costs O(n_estimators²) tree fits in the worst
    /// case. `patience` bounds how far past the best round it runs.
    fn fit_with_early_stopping(
        &self,
        valid_data: &DataVec,
        valid_labels: &[u8],
        patience: usize,
    ) -> Result<(GBDT, usize)> {
        let metric = self.config.eval_metric;
        let mut best: Option<(GBDT, f64, usize)> = None;

        for rounds in 1..=self.config.n_estimators {
            let candidate = self.fit_rounds(rounds);
            let probabilities = to_probabilities(candidate.predict(valid_data));
            let score = metrics::metric_value(metric, valid_labels, &probabilities)?;
            debug!(round = rounds, ?metric, score, "Validation score");

            let improved = match &best {
                Some((_, best_score, _)) => metrics::improves(metric, score, *best_score),
                None => true,
            };
            if improved {
                best = Some((candidate, score, rounds));
            }
            let best_round = best.as_ref().map_or(rounds, |(_, _, round)| *round);
            if rounds - best_round >= patience {
                info!(round = rounds, best_round, "Stopping early, no improvement");
                break;
            }
        }

        best.map(|(ensemble, _, round)| (ensemble, round))
            .ok_or_else(|| CrisisError::Computation("No boosting round completed".to_string()))
    }
}

/// The trainer panics on NaN and infinite inputs, so they are rejected up front.
fn ensure_finite(features: &FeatureTable, role: &str) -> Result<()> {
    match features.first_non_finite()? {
        Some((column, row)) => Err(CrisisError::Computation(format!(
            "{role} features hold a non-finite value in column '{column}' at row {row}"
        ))),
        None => Ok(()),
    }
}

/// Mean increase in training log loss when a feature column is shuffled,
/// normalised to sum to one.
fn permutation_importance(
    ensemble: &GBDT,
    data: &DataVec,
    labels: &[u8],
    config: &ModelConfig,
) -> Result<Vec<f64>> {
    let n_features = data.first().map_or(0, |row| row.feature.len());
    let baseline = metrics::log_loss(labels, &to_probabilities(ensemble.predict(data)))?;
    let repeats = config.importance_repeats.max(1);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_jobs.unwrap_or(0))
        .build()
        .map_err(|e| CrisisError::Computation(format!("Failed to build thread pool: {e}")))?;

    let raw: Vec<f64> = pool.install(|| {
        (0..n_features)
            .into_par_iter()
            .map(|feature| {
                let mut rng = StdRng::seed_from_u64(config.random_state.wrapping_add(feature as u64));
                let mut increase = 0.0;
                for _ in 0..repeats {
                    let mut column: Vec<ValueType> = data.iter().map(|row| row.feature[feature]).collect();
                    column.shuffle(&mut rng);
                    let mut permuted = data.clone();
                    for (row, value) in permuted.iter_mut().zip(column) {
                        row.feature[feature] = value;
                    }
                    let probabilities = to_probabilities(ensemble.predict(&permuted));
                    increase += metrics::log_loss(labels, &probabilities)? - baseline;
                }
                Ok((increase / repeats as f64).max(0.0))
            })
            .collect::<Result<Vec<f64>>>()
    })?;

    let total: f64 = raw.iter().sum();
    Ok(if total > 0.0 {
        raw.iter().map(|v| v / total).collect()
    } else {
        raw
    })
}

fn to_probabilities(predicted: Vec<ValueType>) -> Vec<f64> {
    predicted.into_iter().map(f64::from).collect()
}

/// A trained ensemble together with everything needed to use it again.
pub struct TrainedCrisisModel {
    config: ModelConfig,
    feature_names: Vec<String>,
    importances: Vec<f64>,
    best_iteration: Option<usize>,
    ensemble: GBDT,
}

impl fmt::Debug for TrainedCrisisModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainedCrisisModel")
            .field("config", &self.config)
            .field("feature_names", &self.feature_names)
            .field("best_iteration", &self.best_iteration)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    format_version: u32,
    config: &'a ModelConfig,
    feature_names: &'a [String],
    importances: &'a [f64],
    best_iteration: Option<usize>,
    ensemble: &'a GBDT,
}

/// On-disk form of a trained model.
#[derive(Deserialize)]
struct ModelArtifact {
    format_version: u32,
    config: ModelConfig,
    feature_names: Vec<String>,
    importances: Vec<f64>,
    best_iteration: Option<usize>,
    ensemble: GBDT,
}

impl TrainedCrisisModel {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Round kept by early stopping, if validation data was supplied.
    pub fn best_iteration(&self) -> Option<usize> {
        self.best_iteration
    }

    /// Features by descending importance; ties keep column order.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.importances.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Writes the model as JSON, creating missing parent directories.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let artifact = ArtifactRef {
            format_version: ARTIFACT_VERSION,
            config: &self.config,
            feature_names: &self.feature_names,
            importances: &self.importances,
            best_iteration: self.best_iteration,
            ensemble: &self.ensemble,
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &artifact)?;

        info!("Model saved to {}", path.display());
        Ok(())
    }

    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CrisisError::not_found(path));
        }

        let reader = BufReader::new(File::open(path)?);
        let artifact: ModelArtifact = serde_json::from_reader(reader)?;
        if artifact.format_version != ARTIFACT_VERSION {
            return Err(CrisisError::Config(format!(
                "Unsupported model format version {}",
                artifact.format_version
            )));
        }
        if artifact.importances.len() != artifact.feature_names.len() {
            return Err(CrisisError::Config(
                "Model file has mismatched feature names and importances".to_string(),
            ));
        }

        info!("Model loaded from {}", path.display());
        Ok(Self {
            config: artifact.config,
            feature_names: artifact.feature_names,
            importances: artifact.importances,
            best_iteration: artifact.best_iteration,
            ensemble: artifact.ensemble,
        })
    }
}

impl Classifier for TrainedCrisisModel {
    fn predict_proba(&self, features: &FeatureTable) -> Result<Vec<f64>> {
        let data = features.select(&self.feature_names)?.to_data_vec(None)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(to_probabilities(self.ensemble.predict(&data)))
    }
}
