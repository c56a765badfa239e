// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

const PROBABILITY_FLOOR: f32 = 1e-7;

/// Fixed projection head over sub-cluster centres.
///
/// Each class owns `subclusters` unit-norm centre vectors drawn once at
/// construction and never updated; only the embedding is trained against
/// them. Logits are scaled cosine similarities with the AdaCos constant
/// `sqrt(2) * ln(classes * subclusters - 1)`, softmaxed over every centre,
/// then summed within each class to produce class probabilities.
pub struct SubclusterProjection {
    centers: Parameter,
    classes: usize,
    subclusters: usize,
    scale: f32,
}

impl core::fmt::Debug for SubclusterProjection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "SubclusterProjection(classes={},subclusters={},scale={})",
            self.classes, self.subclusters, self.scale
        )
    }
}

impl SubclusterProjection {
    pub fn new(
        name: impl Into<String>,
        classes: usize,
        subclusters: usize,
        embedding_dim: usize,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if classes == 0 || subclusters == 0 || embedding_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: classes * subclusters,
                cols: embedding_dim,
            });
        }
        let total = classes * subclusters;
        if total < 2 {
            return Err(TensorError::InvalidDimensions {
                rows: total,
                cols: embedding_dim,
            });
        }
        let mut data = Vec::with_capacity(total * embedding_dim);
        for _ in 0..total * embedding_dim {
            let sample: f32 = StandardNormal.sample(rng);
            data.push(sample);
        }
        let mut centers = Tensor::from_vec(total, embedding_dim, data)?;
        {
            let values = centers.data_mut();
            for r in 0..total {
                let row = &mut values[r * embedding_dim..(r + 1) * embedding_dim];
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
                for value in row.iter_mut() {
                    *value /= norm;
                }
            }
        }
        let scale = 2.0f32.sqrt() * ((total - 1) as f32).ln();
        Ok(Self {
            centers: Parameter::new(format!("{}::centers", name.into()), centers),
            classes,
            subclusters,
            scale,
        })
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    fn check_embedding(&self, embeddings: &Tensor) -> PureResult<()> {
        if embeddings.shape().1 != self.centers.value().shape().1 {
            return Err(TensorError::ShapeMismatch {
                left: embeddings.shape(),
                right: self.centers.value().shape(),
            });
        }
        Ok(())
    }

    /// Softmax over scaled centre similarities, `(batch, classes * subclusters)`.
    fn subcluster_softmax(&self, embeddings: &Tensor) -> PureResult<Tensor> {
        self.check_embedding(embeddings)?;
        let logits = embeddings
            .matmul(&self.centers.value().transpose())?
            .scale(self.scale)?;
        let (batch, cols) = logits.shape();
        let mut soft = Tensor::zeros(batch, cols)?;
        {
            let soft_data = soft.data_mut();
            for b in 0..batch {
                let row = logits.row(b)?;
                let max = row.iter().copied().fold(f32::MIN, f32::max);
                let mut total = 0.0f32;
                for (slot, value) in soft_data[b * cols..(b + 1) * cols]
                    .iter_mut()
                    .zip(row.iter())
                {
                    *slot = (value - max).exp();
                    total += *slot;
                }
                for slot in soft_data[b * cols..(b + 1) * cols].iter_mut() {
                    *slot /= total;
                }
            }
        }
        Ok(soft)
    }

    fn class_probabilities(&self, soft: &Tensor) -> PureResult<Tensor> {
        let (batch, _) = soft.shape();
        let mut probs = Tensor::zeros(batch, self.classes)?;
        {
            let probs_data = probs.data_mut();
            for b in 0..batch {
                let row = soft.row(b)?;
                for c in 0..self.classes {
                    let mass: f32 = row
                        [c * self.subclusters..(c + 1) * self.subclusters]
                        .iter()
                        .sum();
                    probs_data[b * self.classes + c] = mass.clamp(PROBABILITY_FLOOR, 1.0);
                }
            }
        }
        Ok(probs)
    }

    /// Weighted categorical cross-entropy over class probabilities plus the
    /// gradient with respect to the embeddings. Labels may carry mixed mass
    /// but each row is expected to sum to one.
    pub fn loss_and_grad(
        &self,
        embeddings: &Tensor,
        labels: &Tensor,
        weights: &[f32],
    ) -> PureResult<(f32, Tensor)> {
        let (batch, _) = embeddings.shape();
        if labels.shape() != (batch, self.classes) {
            return Err(TensorError::ShapeMismatch {
                left: labels.shape(),
                right: (batch, self.classes),
            });
        }
        if weights.len() != batch {
            return Err(TensorError::DataLength {
                expected: batch,
                got: weights.len(),
            });
        }
        if batch == 0 {
            return Err(TensorError::EmptyInput("projection_loss"));
        }

        let soft = self.subcluster_softmax(embeddings)?;
        let probs = self.class_probabilities(&soft)?;
        let cols = self.classes * self.subclusters;

        let mut loss = 0.0f32;
        let mut grad_logits = Tensor::zeros(batch, cols)?;
        {
            let grad_data = grad_logits.data_mut();
            for b in 0..batch {
                let label_row = labels.row(b)?;
                let prob_row = probs.row(b)?;
                let soft_row = soft.row(b)?;
                let mut sample_loss = 0.0f32;
                for c in 0..self.classes {
                    if label_row[c] != 0.0 {
                        sample_loss -= label_row[c] * prob_row[c].ln();
                    }
                }
                loss += weights[b] * sample_loss;

                let factor = weights[b] / batch as f32;
                for j in 0..cols {
                    let class = j / self.subclusters;
                    grad_data[b * cols + j] =
                        factor * soft_row[j] * (1.0 - label_row[class] / prob_row[class]);
                }
            }
        }
        loss /= batch as f32;

        let grad_embeddings = grad_logits
            .matmul(self.centers.value())?
            .scale(self.scale)?;
        Ok((loss, grad_embeddings))
    }
}

impl Module for SubclusterProjection {
    /// Class probabilities for a batch of embeddings.
    fn forward(&self, embeddings: &Tensor) -> PureResult<Tensor> {
        let soft = self.subcluster_softmax(embeddings)?;
        self.class_probabilities(&soft)
    }

    /// The head carries no label context here; gradients flow through
    /// [`SubclusterProjection::loss_and_grad`] instead.
    fn backward(&mut self, _input: &Tensor, _grad_output: &Tensor) -> PureResult<Tensor> {
        Err(TensorError::InvalidValue {
            label: "projection_backward",
        })
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.centers)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.centers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn probabilities_form_a_distribution() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = SubclusterProjection::new("head", 3, 4, 8, &mut rng).unwrap();
        let emb = Tensor::random_uniform(5, 8, -1.0, 1.0, &mut rng).unwrap();
        let probs = head.forward(&emb).unwrap();
        assert_eq!(probs.shape(), (5, 3));
        for b in 0..5 {
            let total: f32 = probs.row(b).unwrap().iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn centers_are_unit_norm_and_fixed() {
        let mut rng = StdRng::seed_from_u64(1);
        let head = SubclusterProjection::new("head", 2, 2, 16, &mut rng).unwrap();
        head.visit_parameters(&mut |param| {
            let (rows, cols) = param.value().shape();
            assert_eq!((rows, cols), (4, 16));
            for r in 0..rows {
                let norm: f32 = param.value().row(r).unwrap().iter().map(|v| v * v).sum();
                assert!((norm - 1.0).abs() < 1e-4);
            }
            assert!(param.gradient().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn gradient_descends_the_loss() {
        let mut rng = StdRng::seed_from_u64(2);
        let head = SubclusterProjection::new("head", 2, 2, 4, &mut rng).unwrap();
        let emb = Tensor::random_uniform(3, 4, -0.5, 0.5, &mut rng).unwrap();
        let labels =
            Tensor::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
        let weights = [1.0, 1.0, 1.0];
        let (loss, grad) = head.loss_and_grad(&emb, &labels, &weights).unwrap();
        let mut stepped = emb.clone();
        stepped.add_scaled(&grad, -0.05).unwrap();
        let (new_loss, _) = head.loss_and_grad(&stepped, &labels, &weights).unwrap();
        assert!(new_loss < loss);
    }

    #[test]
    fn zero_weight_samples_do_not_pull() {
        let mut rng = StdRng::seed_from_u64(3);
        let head = SubclusterProjection::new("head", 2, 1, 4, &mut rng).unwrap();
        let emb = Tensor::random_uniform(2, 4, -0.5, 0.5, &mut rng).unwrap();
        let labels = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let (_, grad) = head.loss_and_grad(&emb, &labels, &[0.0, 1.0]).unwrap();
        for value in grad.row(0).unwrap() {
            assert_eq!(*value, 0.0);
        }
    }
}
