pub mod config;
pub mod data_loader;
pub mod error;
pub mod feature_engineering;
pub mod metrics;
pub mod models;

pub use config::{ModelConfig, ModelOverrides, PipelineConfig};
pub use data_loader::{DataLoader, FeatureTable, FillStrategy, LoaderStage, MarketSeries, TargetVector};
pub use error::{CrisisError, Result};
pub use feature_engineering::FeatureEngineer;
pub use metrics::EvaluationReport;
pub use models::{Classifier, CrisisModel, TrainedCrisisModel};
