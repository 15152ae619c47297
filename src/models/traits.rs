use gbdt::decision_tree::{Data, DataVec, ValueType};
use polars::prelude::*;

use crate::data_loader::{FeatureTable, TargetVector};
use crate::error::{CrisisError, Result};
use crate::metrics::{self, EvaluationReport};

/// A fitted binary classifier over a `FeatureTable`.
pub trait Classifier {
    /// Probability of the positive (crisis) class for every row.
    fn predict_proba(&self, features: &FeatureTable) -> Result<Vec<f64>>;

    /// Hard 0/1 label for every row.
    fn predict(&self, features: &FeatureTable) -> Result<Vec<u8>> {
        Ok(metrics::threshold(&self.predict_proba(features)?))
    }

    fn evaluate(&self, features: &FeatureTable, targets: &TargetVector) -> Result<EvaluationReport> {
        if features.height() != targets.len() {
            return Err(CrisisError::Computation(format!(
                "Feature rows ({}) and target rows ({}) differ",
                features.height(),
                targets.len()
            )));
        }
        let actual = targets.labels()?;
        let probabilities = self.predict_proba(features)?;
        EvaluationReport::compute(&actual, &probabilities)
    }
}

/// Conversion of a feature table into the row-major layout `gbdt` trains on.
pub trait IntoDataVec {
    /// Builds test rows, or training rows when `labels` are given.
    fn to_data_vec(&self, labels: Option<&[u8]>) -> Result<DataVec>;
}

impl IntoDataVec for FeatureTable {
    fn to_data_vec(&self, labels: Option<&[u8]>) -> Result<DataVec> {
        if let Some(labels) = labels {
            if labels.len() != self.height() {
                return Err(CrisisError::Computation(format!(
                    "Feature rows ({}) and labels ({}) differ",
                    self.height(),
                    labels.len()
                )));
            }
        }

        let columns: Vec<Vec<ValueType>> = self
            .frame()
            .get_columns()
            .iter()
            .map(|column| {
                let dtype = column.dtype();
                if !(dtype.is_numeric() || dtype == &DataType::Boolean) {
                    return Err(CrisisError::Config(format!(
                        "Feature column '{}' has non-numeric type {dtype}",
                        column.name()
                    )));
                }
                // nulls become 0.0, the trainer has no missing-value handling
                let values = column
                    .cast(&DataType::Float64)?
                    .f64()?
                    .into_iter()
                    .map(|value| value.map_or(0.0, |v| v as ValueType))
                    .collect();
                Ok(values)
            })
            .collect::<Result<_>>()?;

        // Transpose to row-major
        let data_vec = (0..self.height())
            .map(|row| {
                let feature: Vec<ValueType> = columns.iter().map(|values| values[row]).collect();
                match labels {
                    // LogLikelyhood loss in gbdt expects labels of -1 and 1
                    Some(labels) => {
                        let label = if labels[row] == 1 { 1.0 } else { -1.0 };
                        Data::new_training_data(feature, 1.0, label, None)
                    }
                    None => Data::new_test_data(feature, None),
                }
            })
            .collect();

        Ok(data_vec)
    }
}
