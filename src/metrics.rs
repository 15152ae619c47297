use serde::Serialize;
use std::cmp::Ordering;

use crate::config::EvalMetric;
use crate::error::{CrisisError, Result};

/// Probability at or above which a row is labelled a crisis.
pub const DECISION_THRESHOLD: f64 = 0.5;

const LOG_LOSS_EPS: f64 = 1e-15;

/// Counts of a binary classifier's outcomes, laid out as `[[tn, fp], [fn, tp]]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn from_labels(actual: &[u8], predicted: &[u8]) -> Result<Self> {
        check_lengths(actual.len(), predicted.len())?;
        let mut matrix = ConfusionMatrix {
            true_negative: 0,
            false_positive: 0,
            false_negative: 0,
            true_positive: 0,
        };
        for (&truth, &guess) in actual.iter().zip(predicted) {
            match (truth, guess) {
                (0, 0) => matrix.true_negative += 1,
                (0, _) => matrix.false_positive += 1,
                (_, 0) => matrix.false_negative += 1,
                _ => matrix.true_positive += 1,
            }
        }
        Ok(matrix)
    }

    pub fn as_table(&self) -> [[usize; 2]; 2] {
        [
            [self.true_negative, self.false_positive],
            [self.false_negative, self.true_positive],
        ]
    }

    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    pub support: usize,
}

impl ClassMetrics {
    fn from_counts(hits: usize, predicted: usize, support: usize) -> Self {
        let precision = ratio(hits, predicted);
        let recall = ratio(hits, support);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1_score,
            support,
        }
    }
}

/// Per-class precision/recall/F1 with accuracy and averages, keyed the way
/// scikit-learn's dictionary report is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    #[serde(rename = "0")]
    pub negative: ClassMetrics,
    #[serde(rename = "1")]
    pub positive: ClassMetrics,
    pub accuracy: f64,
    #[serde(rename = "macro avg")]
    pub macro_avg: ClassMetrics,
    #[serde(rename = "weighted avg")]
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    pub fn from_confusion(matrix: &ConfusionMatrix) -> Self {
        let negative = ClassMetrics::from_counts(
            matrix.true_negative,
            matrix.true_negative + matrix.false_negative,
            matrix.true_negative + matrix.false_positive,
        );
        let positive = ClassMetrics::from_counts(
            matrix.true_positive,
            matrix.true_positive + matrix.false_positive,
            matrix.true_positive + matrix.false_negative,
        );
        let total = matrix.total();

        let macro_avg = ClassMetrics {
            precision: (negative.precision + positive.precision) / 2.0,
            recall: (negative.recall + positive.recall) / 2.0,
            f1_score: (negative.f1_score + positive.f1_score) / 2.0,
            support: total,
        };
        let weight = |n: f64, p: f64| {
            if total == 0 {
                0.0
            } else {
                (n * negative.support as f64 + p * positive.support as f64) / total as f64
            }
        };
        let weighted_avg = ClassMetrics {
            precision: weight(negative.precision, positive.precision),
            recall: weight(negative.recall, positive.recall),
            f1_score: weight(negative.f1_score, positive.f1_score),
            support: total,
        };

        Self {
            negative,
            positive,
            accuracy: ratio(matrix.true_negative + matrix.true_positive, total),
            macro_avg,
            weighted_avg,
        }
    }
}

/// Everything `evaluate` reports, computed together or not at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub roc_auc: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub report: ClassificationReport,
}

impl EvaluationReport {
    pub fn compute(actual: &[u8], probabilities: &[f64]) -> Result<Self> {
        let roc_auc = roc_auc(actual, probabilities)?;
        let predicted = threshold(probabilities);
        let confusion_matrix = ConfusionMatrix::from_labels(actual, &predicted)?;
        let report = ClassificationReport::from_confusion(&confusion_matrix);
        Ok(Self {
            roc_auc,
            confusion_matrix,
            report,
        })
    }
}

pub fn threshold(probabilities: &[f64]) -> Vec<u8> {
    probabilities
        .iter()
        .map(|&p| u8::from(p >= DECISION_THRESHOLD))
        .collect()
}

/// Area under the ROC curve via the rank-sum statistic, averaging tied ranks.
pub fn roc_auc(actual: &[u8], scores: &[f64]) -> Result<f64> {
    check_lengths(actual.len(), scores.len())?;
    if scores.iter().any(|s| s.is_nan()) {
        return Err(CrisisError::Computation("ROC-AUC scores contain NaN".to_string()));
    }
    let positives = actual.iter().filter(|&&label| label == 1).count();
    let negatives = actual.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(CrisisError::Computation(
            "Only one class present in y_true. ROC AUC score is not defined in that case"
                .to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && scores[order[end + 1]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based; tied scores share the mean rank
        let rank = (start + end) as f64 / 2.0 + 1.0;
        positive_rank_sum += rank
            * order[start..=end]
                .iter()
                .filter(|&&row| actual[row] == 1)
                .count() as f64;
        start = end + 1;
    }

    let positives = positives as f64;
    Ok((positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives as f64))
}

pub fn log_loss(actual: &[u8], probabilities: &[f64]) -> Result<f64> {
    check_lengths(actual.len(), probabilities.len())?;
    if actual.is_empty() {
        return Err(CrisisError::Computation("Log loss of an empty set".to_string()));
    }
    let total: f64 = actual
        .iter()
        .zip(probabilities)
        .map(|(&label, &p)| {
            let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            if label == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    Ok(total / actual.len() as f64)
}

pub fn error_rate(actual: &[u8], probabilities: &[f64]) -> Result<f64> {
    check_lengths(actual.len(), probabilities.len())?;
    if actual.is_empty() {
        return Err(CrisisError::Computation("Error rate of an empty set".to_string()));
    }
    let wrong = actual
        .iter()
        .zip(threshold(probabilities))
        .filter(|(truth, guess)| **truth != *guess)
        .count();
    Ok(ratio(wrong, actual.len()))
}

pub fn metric_value(metric: EvalMetric, actual: &[u8], probabilities: &[f64]) -> Result<f64> {
    match metric {
        EvalMetric::LogLoss => log_loss(actual, probabilities),
        EvalMetric::Auc => roc_auc(actual, probabilities),
        EvalMetric::Error => error_rate(actual, probabilities),
    }
}

/// Whether `candidate` beats `best` for `metric`.
pub fn improves(metric: EvalMetric, candidate: f64, best: f64) -> bool {
    match (metric.maximize(), candidate.partial_cmp(&best)) {
        (true, Some(Ordering::Greater)) => true,
        (false, Some(Ordering::Less)) => true,
        _ => false,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn check_lengths(actual: usize, predicted: usize) -> Result<()> {
    if actual != predicted {
        return Err(CrisisError::Computation(format!(
            "Found inconsistent numbers of samples: {actual} labels, {predicted} predictions"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roc_auc_perfect_and_inverted() {
        let labels = [0, 0, 1, 1];
        assert_eq!(roc_auc(&labels, &[0.1, 0.2, 0.8, 0.9]).unwrap(), 1.0);
        assert_eq!(roc_auc(&labels, &[0.9, 0.8, 0.2, 0.1]).unwrap(), 0.0);
    }

    #[test]
    fn test_roc_auc_with_ties() {
        // matches sklearn.metrics.roc_auc_score([0, 0, 1, 1], [0.1, 0.4, 0.35, 0.8])
        let auc = roc_auc(&[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert!((auc - 0.75).abs() < 1e-12);

        let all_tied = roc_auc(&[0, 1, 0, 1], &[0.5, 0.5, 0.5, 0.5]).unwrap();
        assert!((all_tied - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_roc_auc_single_class_fails() {
        let result = roc_auc(&[0, 0, 0], &[0.1, 0.2, 0.3]);
        assert!(matches!(result, Err(CrisisError::Computation(_))));
    }

    #[test]
    fn test_confusion_matrix_layout() {
        let matrix = ConfusionMatrix::from_labels(&[0, 0, 1, 1, 1], &[0, 1, 0, 1, 1]).unwrap();
        assert_eq!(matrix.as_table(), [[1, 1], [1, 2]]);
        assert_eq!(matrix.total(), 5);
    }

    #[test]
    fn test_classification_report() {
        let matrix = ConfusionMatrix::from_labels(&[0, 0, 1, 1, 1], &[0, 1, 0, 1, 1]).unwrap();
        let report = ClassificationReport::from_confusion(&matrix);

        assert!((report.accuracy - 0.6).abs() < 1e-12);
        assert!((report.positive.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.positive.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((report.negative.precision - 0.5).abs() < 1e-12);
        assert_eq!(report.negative.support, 2);
        assert_eq!(report.weighted_avg.support, 5);
    }

    #[test]
    fn test_zero_division_yields_zero() {
        let matrix = ConfusionMatrix::from_labels(&[0, 1], &[0, 0]).unwrap();
        let report = ClassificationReport::from_confusion(&matrix);
        assert_eq!(report.positive.precision, 0.0);
        assert_eq!(report.positive.f1_score, 0.0);
    }

    #[test]
    fn test_log_loss_and_error() {
        let loss = log_loss(&[1, 0], &[0.9, 0.1]).unwrap();
        assert!((loss - -(0.9f64.ln())).abs() < 1e-12);
        assert_eq!(error_rate(&[1, 0, 1], &[0.9, 0.6, 0.2]).unwrap(), 2.0 / 3.0);
    }

    #[test]
    fn test_improves_respects_direction() {
        assert!(improves(EvalMetric::LogLoss, 0.2, 0.3));
        assert!(!improves(EvalMetric::LogLoss, 0.3, 0.3));
        assert!(improves(EvalMetric::Auc, 0.9, 0.8));
        assert!(!improves(EvalMetric::Error, 0.5, 0.1));
    }

    #[test]
    fn test_report_serializes_like_sklearn() {
        let report = EvaluationReport::compute(&[0, 1], &[0.2, 0.7]).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["report"]["macro avg"]["f1-score"].is_number());
        assert_eq!(json["confusion_matrix"]["true_positive"], 1);
    }
}
