use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CrisisError, Result};

/// Top-level pipeline configuration, read from a TOML file by the binary.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub data: DataParams,
    #[serde(default)]
    pub feature_params: FeatureParams,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub output: OutputParams,
}

#[derive(Debug, Deserialize)]
pub struct DataParams {
    pub path: PathBuf,
    #[serde(default = "default_target_column")]
    pub target_column: String,
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default)]
    pub drop_columns: Vec<String>,
    #[serde(default = "default_true")]
    pub drop_missing: bool,
    #[serde(default = "default_fill_strategy")]
    pub fill_strategy: String,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
}

/// Rolling-window feature settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub close_column: String,
    pub volatility_window: usize,
    pub momentum_window: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            close_column: "Close".to_string(),
            volatility_window: 20,
            momentum_window: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputParams {
    pub model_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub early_stopping_rounds: usize,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/gbdt_crisis_model.json"),
            report_path: None,
            early_stopping_rounds: 10,
        }
    }
}

fn default_target_column() -> String {
    "target".to_string()
}

fn default_date_column() -> String {
    "Date".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fill_strategy() -> String {
    "ffill".to_string()
}

fn default_test_fraction() -> f64 {
    0.2
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CrisisError::not_found(path));
        }
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Training objective. Only binary classification is supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    #[default]
    #[serde(rename = "binary:logistic")]
    BinaryLogistic,
}

/// Metric monitored on validation data during early stopping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalMetric {
    #[default]
    LogLoss,
    Auc,
    Error,
}

impl EvalMetric {
    /// Whether a larger value of this metric is better.
    pub fn maximize(self) -> bool {
        matches!(self, EvalMetric::Auc)
    }
}

/// A trainer-specific value forwarded to the `gbdt` config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrainerParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl TrainerParam {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TrainerParam::Int(v) => Some(*v as f64),
            TrainerParam::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            TrainerParam::Int(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TrainerParam::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Resolved hyperparameters of the crisis classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of boosting rounds. Default 100.
    pub n_estimators: usize,
    /// Maximum tree depth. Default 5.
    pub max_depth: u32,
    /// Shrinkage applied to every tree. Default 0.1.
    pub learning_rate: f32,
    pub objective: Objective,
    /// Default `logloss`.
    pub eval_metric: EvalMetric,
    /// Worker threads used during training; `None` uses every core.
    pub n_jobs: Option<usize>,
    /// Seed for the wrapper's random choices. Default 42.
    pub random_state: u64,
    /// Shuffles per feature when measuring importance. Default 3.
    pub importance_repeats: usize,
    /// Knobs forwarded to the `gbdt` trainer.
    pub trainer: BTreeMap<String, TrainerParam>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 5,
            learning_rate: 0.1,
            objective: Objective::BinaryLogistic,
            eval_metric: EvalMetric::LogLoss,
            n_jobs: None,
            random_state: 42,
            importance_repeats: 3,
            trainer: BTreeMap::new(),
        }
    }
}

/// Caller-supplied overrides; unset fields keep the `ModelConfig` defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub n_estimators: Option<usize>,
    pub max_depth: Option<u32>,
    pub learning_rate: Option<f32>,
    pub objective: Option<Objective>,
    pub eval_metric: Option<EvalMetric>,
    pub n_jobs: Option<usize>,
    pub random_state: Option<u64>,
    pub importance_repeats: Option<usize>,
    pub trainer: BTreeMap<String, TrainerParam>,
}

impl ModelConfig {
    pub fn with_overrides(mut self, overrides: ModelOverrides) -> Self {
        if let Some(v) = overrides.n_estimators {
            self.n_estimators = v;
        }
        if let Some(v) = overrides.max_depth {
            self.max_depth = v;
        }
        if let Some(v) = overrides.learning_rate {
            self.learning_rate = v;
        }
        if let Some(v) = overrides.objective {
            self.objective = v;
        }
        if let Some(v) = overrides.eval_metric {
            self.eval_metric = v;
        }
        if overrides.n_jobs.is_some() {
            self.n_jobs = overrides.n_jobs;
        }
        if let Some(v) = overrides.random_state {
            self.random_state = v;
        }
        if let Some(v) = overrides.importance_repeats {
            self.importance_repeats = v;
        }
        self.trainer.extend(overrides.trainer);
        self
    }

    /// Checks value ranges the trainer would otherwise panic on.
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(CrisisError::Config("n_estimators must be at least 1".to_string()));
        }
        if self.max_depth == 0 {
            return Err(CrisisError::Config("max_depth must be at least 1".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(CrisisError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ModelConfig::default();
        assert_eq!(config.n_estimators, 100);
        assert_eq!(config.max_depth, 5);
        assert!((config.learning_rate - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.eval_metric, EvalMetric::LogLoss);
        assert_eq!(config.random_state, 42);
        assert!(config.n_jobs.is_none());
    }

    #[test]
    fn test_overrides_keep_unspecified_defaults() {
        let overrides = ModelOverrides {
            max_depth: Some(3),
            n_jobs: Some(2),
            ..Default::default()
        };
        let config = ModelConfig::default().with_overrides(overrides);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.n_jobs, Some(2));
        assert_eq!(config.n_estimators, 100);
        assert_eq!(config.random_state, 42);
    }

    #[test]
    fn test_parse_pipeline_config() {
        let raw = r#"
            [data]
            path = "data/market_data.csv"
            target_column = "Crisis_Label"
            drop_columns = ["Volume"]

            [model]
            n_estimators = 50
            eval_metric = "auc"

            [model.trainer]
            min_leaf_size = 4
            feature_sample_ratio = 0.8
        "#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.data.target_column, "Crisis_Label");
        assert_eq!(config.data.date_column, "Date");
        assert!(config.data.drop_missing);
        assert_eq!(config.feature_params, FeatureParams::default());
        assert_eq!(config.model.n_estimators, Some(50));
        assert_eq!(config.model.eval_metric, Some(EvalMetric::Auc));
        assert_eq!(config.model.trainer.get("min_leaf_size"), Some(&TrainerParam::Int(4)));
        assert_eq!(
            config.model.trainer.get("feature_sample_ratio"),
            Some(&TrainerParam::Float(0.8))
        );
        assert_eq!(config.output.early_stopping_rounds, 10);
    }

    #[test]
    fn test_validate_rejects_zero_rounds() {
        let config = ModelConfig {
            n_estimators: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CrisisError::Config(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let result = PipelineConfig::load("does/not/exist.toml");
        assert!(matches!(result, Err(CrisisError::NotFound { .. })));
    }
}
