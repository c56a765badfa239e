// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Scales every row to unit Euclidean norm.
pub fn length_norm(embeddings: &Tensor) -> PureResult<Tensor> {
    let (rows, cols) = embeddings.shape();
    let mut out = embeddings.clone();
    {
        let data = out.data_mut();
        for r in 0..rows {
            let row = &mut data[r * cols..(r + 1) * cols];
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
            for value in row.iter_mut() {
                *value /= norm;
            }
        }
    }
    Ok(out)
}

/// Cosine distance `2 * (1 - a·b)` for unit-norm vectors; range [0, 4].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    2.0 * (1.0 - dot)
}

fn min_cosine_distance(sample: &[f32], references: &Tensor) -> PureResult<f32> {
    let rows = references.shape().0;
    if rows == 0 {
        return Err(TensorError::EmptyInput("reference_set"));
    }
    let mut best = f32::MAX;
    for r in 0..rows {
        let distance = cosine_distance(sample, references.row(r)?);
        if distance < best {
            best = distance;
        }
    }
    Ok(best)
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Lloyd's k-means with deterministic seeding.
///
/// The first centre is a seeded random row; the rest are farthest-point
/// picks. Clusters that empty out during iteration are re-seeded on the
/// point farthest from its assigned centre. When fewer rows than `k` exist,
/// every row becomes its own centre.
pub fn kmeans(data: &Tensor, k: usize, iterations: usize, seed: u64) -> PureResult<Tensor> {
    let (rows, cols) = data.shape();
    if rows == 0 || k == 0 {
        return Err(TensorError::EmptyInput("kmeans"));
    }
    let k = k.min(rows);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut centers = Tensor::zeros(k, cols)?;
    let mut chosen = vec![rng.gen_range(0..rows)];
    centers.data_mut()[..cols].copy_from_slice(data.row(chosen[0])?);
    while chosen.len() < k {
        let mut farthest = 0usize;
        let mut farthest_distance = -1.0f32;
        for r in 0..rows {
            let nearest = chosen
                .iter()
                .map(|&c| squared_euclidean(data.row(r).unwrap_or(&[]), data.row(c).unwrap_or(&[])))
                .fold(f32::MAX, f32::min);
            if nearest > farthest_distance {
                farthest_distance = nearest;
                farthest = r;
            }
        }
        let index = chosen.len();
        centers.data_mut()[index * cols..(index + 1) * cols].copy_from_slice(data.row(farthest)?);
        chosen.push(farthest);
    }

    let mut assignment = vec![0usize; rows];
    for _ in 0..iterations {
        let mut changed = false;
        for r in 0..rows {
            let mut best = 0usize;
            let mut best_distance = f32::MAX;
            for c in 0..k {
                let distance = squared_euclidean(data.row(r)?, centers.row(c)?);
                if distance < best_distance {
                    best_distance = distance;
                    best = c;
                }
            }
            if assignment[r] != best {
                assignment[r] = best;
                changed = true;
            }
        }

        let mut sums = vec![0.0f32; k * cols];
        let mut counts = vec![0usize; k];
        for r in 0..rows {
            let c = assignment[r];
            counts[c] += 1;
            for (slot, value) in sums[c * cols..(c + 1) * cols]
                .iter_mut()
                .zip(data.row(r)?.iter())
            {
                *slot += value;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed the dead cluster on the worst-fitting point.
                let mut farthest = 0usize;
                let mut farthest_distance = -1.0f32;
                for r in 0..rows {
                    let distance =
                        squared_euclidean(data.row(r)?, centers.row(assignment[r])?);
                    if distance > farthest_distance {
                        farthest_distance = distance;
                        farthest = r;
                    }
                }
                let row = data.row(farthest)?.to_vec();
                centers.data_mut()[c * cols..(c + 1) * cols].copy_from_slice(&row);
                changed = true;
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            for (slot, value) in centers.data_mut()[c * cols..(c + 1) * cols]
                .iter_mut()
                .zip(sums[c * cols..(c + 1) * cols].iter())
            {
                *slot = value * inv;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(centers)
}

/// Reference-set branch: distances to raw target-domain rows or to
/// source-domain centroids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Target = 0,
    Source = 1,
}

/// Accumulator for per-sample, per-class, per-branch anomaly scores.
///
/// Slots start infinite; a branch that never receives a reference set stays
/// infinite and loses the branch minimum to the recorded one.
#[derive(Debug, Clone)]
pub struct ScoreTensor {
    samples: usize,
    classes: usize,
    data: Vec<f32>,
}

impl ScoreTensor {
    pub fn new(samples: usize, classes: usize) -> Self {
        Self {
            samples,
            classes,
            data: vec![f32::INFINITY; samples * classes * 2],
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    fn index(&self, sample: usize, class: usize, branch: Branch) -> PureResult<usize> {
        if sample >= self.samples || class >= self.classes {
            return Err(TensorError::InvalidDimensions {
                rows: sample,
                cols: class,
            });
        }
        Ok((sample * self.classes + class) * 2 + branch as usize)
    }

    /// Adds into the slot when ensembling, otherwise overwrites it. The first
    /// write to a slot always overwrites its unrecorded marker.
    pub fn record(
        &mut self,
        sample: usize,
        class: usize,
        branch: Branch,
        value: f32,
        ensemble: bool,
    ) -> PureResult<()> {
        let index = self.index(sample, class, branch)?;
        if ensemble && self.data[index].is_finite() {
            self.data[index] += value;
        } else {
            self.data[index] = value;
        }
        Ok(())
    }

    pub fn get(&self, sample: usize, class: usize, branch: Branch) -> PureResult<f32> {
        Ok(self.data[self.index(sample, class, branch)?])
    }

    /// Final anomaly score at a class column: minimum over the recorded
    /// branches. A cell neither branch ever scored is an error, not a score.
    pub fn score_for(&self, sample: usize, class: usize) -> PureResult<f32> {
        let target = self.get(sample, class, Branch::Target)?;
        let source = self.get(sample, class, Branch::Source)?;
        let best = target.min(source);
        if !best.is_finite() {
            return Err(TensorError::EmptyInput("score_branches"));
        }
        Ok(best)
    }
}

/// A split's length-normalised embeddings aligned with its class labels.
#[derive(Debug, Clone, Copy)]
pub struct SplitView<'a> {
    pub embeddings: &'a Tensor,
    pub labels: &'a [usize],
}

impl<'a> SplitView<'a> {
    pub fn new(embeddings: &'a Tensor, labels: &'a [usize]) -> PureResult<Self> {
        if embeddings.shape().0 != labels.len() {
            return Err(TensorError::DataLength {
                expected: embeddings.shape().0,
                got: labels.len(),
            });
        }
        Ok(Self { embeddings, labels })
    }

    fn class_indices(&self, class: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, &label)| (label == class).then_some(i))
            .collect()
    }
}

/// Per-class nearest-prototype scorer.
///
/// For each class present in the training split it clusters the
/// source-domain rows into `subclusters` centroids and keeps target-domain
/// rows verbatim as the second reference set, then writes the minimum cosine
/// distance against each set into every split's score tensor.
#[derive(Debug, Clone)]
pub struct ClusterScorer {
    subclusters: usize,
    kmeans_iterations: usize,
    seed: u64,
    ensemble: bool,
}

impl ClusterScorer {
    pub fn new(subclusters: usize, seed: u64, ensemble: bool) -> PureResult<Self> {
        if subclusters == 0 {
            return Err(TensorError::EmptyInput("subclusters"));
        }
        Ok(Self {
            subclusters,
            kmeans_iterations: 100,
            seed,
            ensemble,
        })
    }

    pub fn score_splits(
        &self,
        train: SplitView<'_>,
        train_source: &[bool],
        splits: &mut [(SplitView<'_>, &mut ScoreTensor)],
        num_classes: usize,
    ) -> PureResult<()> {
        if train_source.len() != train.labels.len() {
            return Err(TensorError::DataLength {
                expected: train.labels.len(),
                got: train_source.len(),
            });
        }
        for class in 0..num_classes {
            let class_rows = train.class_indices(class);
            if class_rows.is_empty() {
                continue;
            }
            let source_rows: Vec<usize> = class_rows
                .iter()
                .copied()
                .filter(|&i| train_source[i])
                .collect();
            let target_rows: Vec<usize> = class_rows
                .iter()
                .copied()
                .filter(|&i| !train_source[i])
                .collect();

            let source_refs = if source_rows.is_empty() {
                None
            } else {
                Some(kmeans(
                    &train.embeddings.select_rows(&source_rows)?,
                    self.subclusters,
                    self.kmeans_iterations,
                    self.seed,
                )?)
            };
            let target_refs = if target_rows.is_empty() {
                None
            } else {
                Some(train.embeddings.select_rows(&target_rows)?)
            };

            for (view, scores) in splits.iter_mut() {
                for sample in view.class_indices(class) {
                    let row = view.embeddings.row(sample)?;
                    if let Some(refs) = &target_refs {
                        let distance = min_cosine_distance(row, refs)?;
                        scores.record(sample, class, Branch::Target, distance, self.ensemble)?;
                    }
                    if let Some(refs) = &source_refs {
                        let distance = min_cosine_distance(row, refs)?;
                        scores.record(sample, class, Branch::Source, distance, self.ensemble)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_norm_produces_unit_rows() {
        let mat = Tensor::from_vec(2, 2, vec![3.0, 4.0, 0.5, 0.0]).unwrap();
        let normed = length_norm(&mat).unwrap();
        for r in 0..2 {
            let norm: f32 = normed.row(r).unwrap().iter().map(|v| v * v).sum();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn cosine_distance_properties() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = [-1.0f32, 0.0];
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - cosine_distance(&b, &a)).abs() < 1e-6);
        assert!((cosine_distance(&a, &c) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn kmeans_is_deterministic_for_a_fixed_seed() {
        let data = Tensor::from_fn(20, 3, |r, c| ((r * 7 + c * 13) % 11) as f32).unwrap();
        let a = kmeans(&data, 4, 50, 0).unwrap();
        let b = kmeans(&data, 4, 50, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kmeans_caps_clusters_at_row_count() {
        let data = Tensor::from_vec(2, 2, vec![0.0, 0.0, 1.0, 1.0]).unwrap();
        let centers = kmeans(&data, 8, 10, 0).unwrap();
        assert_eq!(centers.shape(), (2, 2));
    }

    #[test]
    fn kmeans_separates_two_obvious_groups() {
        let mut values = Vec::new();
        for i in 0..5 {
            values.extend_from_slice(&[i as f32 * 0.01, 0.0]);
        }
        for i in 0..5 {
            values.extend_from_slice(&[10.0 + i as f32 * 0.01, 0.0]);
        }
        let data = Tensor::from_vec(10, 2, values).unwrap();
        let centers = kmeans(&data, 2, 50, 1).unwrap();
        let mut xs: Vec<f32> = (0..2).map(|c| centers.row(c).unwrap()[0]).collect();
        xs.sort_by(f32::total_cmp);
        assert!(xs[0] < 1.0 && xs[1] > 9.0);
    }

    #[test]
    fn score_tensor_accumulates_only_when_ensembling() {
        let mut scores = ScoreTensor::new(1, 1);
        scores.record(0, 0, Branch::Source, 1.5, true).unwrap();
        scores.record(0, 0, Branch::Source, 1.5, true).unwrap();
        assert_eq!(scores.get(0, 0, Branch::Source).unwrap(), 3.0);
        scores.record(0, 0, Branch::Source, 0.25, false).unwrap();
        assert_eq!(scores.get(0, 0, Branch::Source).unwrap(), 0.25);
    }

    #[test]
    fn unrecorded_branch_never_wins_the_minimum() {
        let mut scores = ScoreTensor::new(1, 1);
        scores.record(0, 0, Branch::Source, 1.75, false).unwrap();
        assert_eq!(scores.score_for(0, 0).unwrap(), 1.75);
    }

    #[test]
    fn fully_unscored_cell_is_an_error() {
        let scores = ScoreTensor::new(1, 1);
        assert!(scores.score_for(0, 0).is_err());
    }

    #[test]
    fn source_only_training_rows_still_yield_a_real_distance() {
        // Class 0 has only source rows, both along e1; the eval sample sits
        // on an orthogonal axis and must keep its full cosine distance.
        let train = Tensor::from_vec(2, 4, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap();
        let train_labels = vec![0usize, 0];
        let train_source = vec![true, true];

        let eval = Tensor::from_vec(1, 4, vec![0.0, 0.0, 0.0, 1.0]).unwrap();
        let eval_labels = vec![0usize];
        let mut scores = ScoreTensor::new(1, 1);

        let scorer = ClusterScorer::new(2, 0, false).unwrap();
        let train_view = SplitView::new(&train, &train_labels).unwrap();
        let eval_view = SplitView::new(&eval, &eval_labels).unwrap();
        scorer
            .score_splits(
                train_view,
                &train_source,
                &mut [(eval_view, &mut scores)],
                1,
            )
            .unwrap();

        assert!((scores.get(0, 0, Branch::Source).unwrap() - 2.0).abs() < 1e-5);
        assert!((scores.score_for(0, 0).unwrap() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn scorer_writes_both_branches_for_matching_classes() {
        // Class 0: four source rows near +x, one target row near +y.
        let train = Tensor::from_vec(
            5,
            2,
            vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        let train_labels = vec![0usize; 5];
        let train_source = vec![true, true, true, true, false];

        let eval = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let eval_labels = vec![0usize, 0];
        let mut scores = ScoreTensor::new(2, 1);

        let scorer = ClusterScorer::new(2, 0, false).unwrap();
        let train_view = SplitView::new(&train, &train_labels).unwrap();
        let eval_view = SplitView::new(&eval, &eval_labels).unwrap();
        scorer
            .score_splits(
                train_view,
                &train_source,
                &mut [(eval_view, &mut scores)],
                1,
            )
            .unwrap();

        // Sample 0 sits on the source prototypes, sample 1 on the target row.
        assert!(scores.get(0, 0, Branch::Source).unwrap() < 1e-5);
        assert!(scores.get(1, 0, Branch::Target).unwrap() < 1e-5);
        assert!(scores.score_for(0, 0).unwrap() < 1e-5);
        assert!(scores.get(1, 0, Branch::Source).unwrap() > 1.0);
    }
}
