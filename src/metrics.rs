// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::LabelEncoder;
use crate::scoring::ScoreTensor;
use crate::{PureResult, TensorError};
use std::collections::BTreeSet;

/// ROC-AUC via the rank statistic, with average ranks for tied scores.
/// Fails when only one outcome is present; a degenerate AUC must not be
/// silently reported as 0.5.
pub fn roc_auc(y_true: &[bool], scores: &[f32]) -> PureResult<f32> {
    if y_true.len() != scores.len() {
        return Err(TensorError::DataLength {
            expected: y_true.len(),
            got: scores.len(),
        });
    }
    let positives = y_true.iter().filter(|&&y| y).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(TensorError::DegenerateMetric { label: "roc_auc" });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &index in &order[i..=j] {
            ranks[index] = rank;
        }
        i = j + 1;
    }

    let rank_sum: f64 = y_true
        .iter()
        .zip(ranks.iter())
        .filter_map(|(&y, &rank)| y.then_some(rank))
        .sum();
    let auc = (rank_sum - (positives * (positives + 1)) as f64 / 2.0)
        / (positives * negatives) as f64;
    Ok(auc as f32)
}

/// Partial ROC-AUC restricted to false-positive rates below `max_fpr`,
/// standardized so a random ranking still maps to 0.5 (McClish correction).
pub fn partial_roc_auc(y_true: &[bool], scores: &[f32], max_fpr: f32) -> PureResult<f32> {
    if !(0.0..=1.0).contains(&max_fpr) || max_fpr == 0.0 {
        return Err(TensorError::NonFiniteValue {
            label: "max_fpr",
            value: max_fpr,
        });
    }
    if y_true.len() != scores.len() {
        return Err(TensorError::DataLength {
            expected: y_true.len(),
            got: scores.len(),
        });
    }
    let positives = y_true.iter().filter(|&&y| y).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(TensorError::DegenerateMetric {
            label: "partial_roc_auc",
        });
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let max_fpr = max_fpr as f64;
    let mut area = 0.0f64;
    let mut prev_fpr = 0.0f64;
    let mut prev_tpr = 0.0f64;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut crossed = false;

    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        for &index in &order[i..=j] {
            if y_true[index] {
                tp += 1;
            } else {
                fp += 1;
            }
        }
        let fpr = fp as f64 / negatives as f64;
        let tpr = tp as f64 / positives as f64;
        if fpr >= max_fpr {
            let tpr_at_cut = if fpr > prev_fpr {
                prev_tpr + (max_fpr - prev_fpr) / (fpr - prev_fpr) * (tpr - prev_tpr)
            } else {
                tpr
            };
            area += (max_fpr - prev_fpr) * (prev_tpr + tpr_at_cut) / 2.0;
            crossed = true;
            break;
        }
        area += (fpr - prev_fpr) * (prev_tpr + tpr) / 2.0;
        prev_fpr = fpr;
        prev_tpr = tpr;
        i = j + 1;
    }
    if !crossed {
        area += (max_fpr - prev_fpr) * prev_tpr;
    }

    let min_area = 0.5 * max_fpr * max_fpr;
    let max_area = max_fpr;
    let standardized = 0.5 * (1.0 + (area - min_area) / (max_area - min_area));
    Ok(standardized as f32)
}

/// Harmonic mean; zero elements collapse the aggregate to zero, which is the
/// wanted penalty for a completely failed section.
pub fn harmonic_mean(values: &[f32]) -> PureResult<f32> {
    if values.is_empty() {
        return Err(TensorError::EmptyInput("harmonic_mean"));
    }
    for &value in values {
        if value < 0.0 || !value.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "harmonic_mean",
                value,
            });
        }
    }
    if values.iter().any(|&v| v == 0.0) {
        return Ok(0.0);
    }
    let inverse_sum: f64 = values.iter().map(|&v| 1.0 / v as f64).sum();
    Ok((values.len() as f64 / inverse_sum) as f32)
}

/// Metrics for one section id (e.g. `bearing_00`), overall and restricted
/// to each domain.
#[derive(Debug, Clone)]
pub struct CategoryMetrics {
    pub category: String,
    pub auc: f32,
    pub p_auc: f32,
    pub auc_source: f32,
    pub p_auc_source: f32,
    pub auc_target: f32,
    pub p_auc_target: f32,
}

/// Harmonic means across every section: the final 6-tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub auc_source: f32,
    pub p_auc_source: f32,
    pub auc_target: f32,
    pub p_auc_target: f32,
    pub auc: f32,
    pub p_auc: f32,
}

pub const PARTIAL_AUC_MAX_FPR: f32 = 0.1;

/// Scores each section id present in the normal evaluation pool against the
/// anomalous pool.
///
/// Per section, the per-sample anomaly score is the branch minimum at the
/// true class column; ground truth is pool membership (normal = 0,
/// anomalous = 1).
#[allow(clippy::too_many_arguments)]
pub fn evaluate_sections(
    eval_scores: &ScoreTensor,
    eval_labels: &[usize],
    eval_source: &[bool],
    unknown_scores: &ScoreTensor,
    unknown_labels: &[usize],
    unknown_source: &[bool],
    encoder: &LabelEncoder,
) -> PureResult<Vec<CategoryMetrics>> {
    if eval_labels.len() != eval_source.len() || unknown_labels.len() != unknown_source.len() {
        return Err(TensorError::DataLength {
            expected: eval_labels.len(),
            got: eval_source.len(),
        });
    }

    let sections: BTreeSet<usize> = eval_labels.iter().copied().collect();
    let mut results = Vec::with_capacity(sections.len());
    for class in sections {
        let mut y_pred = Vec::new();
        let mut y_true = Vec::new();
        let mut source = Vec::new();
        for (sample, &label) in eval_labels.iter().enumerate() {
            if label == class {
                y_pred.push(eval_scores.score_for(sample, class)?);
                y_true.push(false);
                source.push(eval_source[sample]);
            }
        }
        for (sample, &label) in unknown_labels.iter().enumerate() {
            if label == class {
                y_pred.push(unknown_scores.score_for(sample, class)?);
                y_true.push(true);
                source.push(unknown_source[sample]);
            }
        }

        let auc = roc_auc(&y_true, &y_pred)?;
        let p_auc = partial_roc_auc(&y_true, &y_pred, PARTIAL_AUC_MAX_FPR)?;

        let (mut src_true, mut src_pred) = (Vec::new(), Vec::new());
        let (mut tgt_true, mut tgt_pred) = (Vec::new(), Vec::new());
        for i in 0..y_true.len() {
            if source[i] {
                src_true.push(y_true[i]);
                src_pred.push(y_pred[i]);
            } else {
                tgt_true.push(y_true[i]);
                tgt_pred.push(y_pred[i]);
            }
        }

        results.push(CategoryMetrics {
            category: encoder.inverse(class)?.to_string(),
            auc,
            p_auc,
            auc_source: roc_auc(&src_true, &src_pred)?,
            p_auc_source: partial_roc_auc(&src_true, &src_pred, PARTIAL_AUC_MAX_FPR)?,
            auc_target: roc_auc(&tgt_true, &tgt_pred)?,
            p_auc_target: partial_roc_auc(&tgt_true, &tgt_pred, PARTIAL_AUC_MAX_FPR)?,
        });
    }
    Ok(results)
}

/// Harmonic-mean AUC/pAUC per machine category (the section-id prefix
/// before the first underscore).
pub fn machine_means(metrics: &[CategoryMetrics]) -> PureResult<Vec<(String, f32, f32)>> {
    let machines: BTreeSet<&str> = metrics
        .iter()
        .map(|m| m.category.split('_').next().unwrap_or(m.category.as_str()))
        .collect();
    let mut means = Vec::with_capacity(machines.len());
    for machine in machines {
        let aucs: Vec<f32> = metrics
            .iter()
            .filter(|m| m.category.split('_').next() == Some(machine))
            .map(|m| m.auc)
            .collect();
        let p_aucs: Vec<f32> = metrics
            .iter()
            .filter(|m| m.category.split('_').next() == Some(machine))
            .map(|m| m.p_auc)
            .collect();
        means.push((
            machine.to_string(),
            harmonic_mean(&aucs)?,
            harmonic_mean(&p_aucs)?,
        ));
    }
    Ok(means)
}

/// Collapses per-section metrics into the final 6-tuple of harmonic means.
pub fn summarize(metrics: &[CategoryMetrics]) -> PureResult<EvaluationSummary> {
    let collect = |f: fn(&CategoryMetrics) -> f32| -> Vec<f32> { metrics.iter().map(f).collect() };
    Ok(EvaluationSummary {
        auc_source: harmonic_mean(&collect(|m| m.auc_source))?,
        p_auc_source: harmonic_mean(&collect(|m| m.p_auc_source))?,
        auc_target: harmonic_mean(&collect(|m| m.auc_target))?,
        p_auc_target: harmonic_mean(&collect(|m| m.p_auc_target))?,
        auc: harmonic_mean(&collect(|m| m.auc))?,
        p_auc: harmonic_mean(&collect(|m| m.p_auc))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roc_auc_perfect_and_inverted_rankings() {
        let y_true = [false, false, true, true];
        assert_eq!(roc_auc(&y_true, &[0.1, 0.2, 0.8, 0.9]).unwrap(), 1.0);
        assert_eq!(roc_auc(&y_true, &[0.9, 0.8, 0.2, 0.1]).unwrap(), 0.0);
    }

    #[test]
    fn roc_auc_handles_ties_with_average_ranks() {
        let y_true = [false, true, false, true];
        let scores = [0.5, 0.5, 0.2, 0.8];
        let auc = roc_auc(&y_true, &scores).unwrap();
        assert!((auc - 0.875).abs() < 1e-6);
    }

    #[test]
    fn degenerate_labels_fail_loudly() {
        assert!(matches!(
            roc_auc(&[true, true], &[0.1, 0.2]),
            Err(TensorError::DegenerateMetric { .. })
        ));
        assert!(matches!(
            partial_roc_auc(&[false, false], &[0.1, 0.2], 0.1),
            Err(TensorError::DegenerateMetric { .. })
        ));
    }

    #[test]
    fn partial_auc_bounds() {
        let y_true = [false, false, true, true];
        let perfect = partial_roc_auc(&y_true, &[0.1, 0.2, 0.8, 0.9], 0.1).unwrap();
        assert!((perfect - 1.0).abs() < 1e-6);
        let inverted = partial_roc_auc(&y_true, &[0.9, 0.8, 0.2, 0.1], 0.1).unwrap();
        assert!(inverted < 0.51);
    }

    #[test]
    fn harmonic_mean_properties() {
        assert!((harmonic_mean(&[0.7, 0.7, 0.7]).unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(harmonic_mean(&[0.9, 0.0, 0.8]).unwrap(), 0.0);
        assert!(harmonic_mean(&[]).is_err());
        assert!(harmonic_mean(&[-0.1]).is_err());
        let skew = harmonic_mean(&[0.2, 0.9]).unwrap();
        assert!(skew < 0.55);
    }
}
