//! The crisis classifier and the traits its inference surface is built on.
pub mod gbdt;
pub mod traits;

pub use self::gbdt::{CrisisModel, TrainedCrisisModel, DEFAULT_PATIENCE};
pub use self::traits::{Classifier, IntoDataVec};
