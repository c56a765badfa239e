// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::TrainPhase;
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::Rng;

/// Convex-combination augmentation over raw input rows.
///
/// Each sample independently decides whether to blend with its mirror
/// partner (row `batch - 1 - i`); the same blending factor is applied to the
/// label row, keeping label mass at 1. Runs ahead of feature extraction, so
/// no gradient path is required.
#[derive(Debug, Clone, Copy)]
pub struct MixupLayer {
    prob: f32,
}

impl MixupLayer {
    pub fn new(prob: f32) -> PureResult<Self> {
        if !(0.0..=1.0).contains(&prob) {
            return Err(TensorError::NonFiniteValue {
                label: "mixup_prob",
                value: prob,
            });
        }
        Ok(Self { prob })
    }

    pub fn apply(
        &self,
        inputs: &Tensor,
        labels: &Tensor,
        phase: TrainPhase,
        rng: &mut StdRng,
    ) -> PureResult<(Tensor, Tensor)> {
        let (batch, cols) = inputs.shape();
        if labels.shape().0 != batch {
            return Err(TensorError::ShapeMismatch {
                left: labels.shape(),
                right: (batch, labels.shape().1),
            });
        }
        if phase == TrainPhase::Eval {
            return Ok((inputs.clone(), labels.clone()));
        }

        let label_cols = labels.shape().1;
        let mut mixed_inputs = inputs.clone();
        let mut mixed_labels = labels.clone();
        {
            let input_data = mixed_inputs.data_mut();
            for i in 0..batch {
                if rng.gen::<f32>() >= self.prob {
                    continue;
                }
                let lambda: f32 = rng.gen::<f32>();
                let partner = batch - 1 - i;
                for c in 0..cols {
                    input_data[i * cols + c] = lambda * inputs.data()[i * cols + c]
                        + (1.0 - lambda) * inputs.data()[partner * cols + c];
                }
                let label_data = mixed_labels.data_mut();
                for c in 0..label_cols {
                    label_data[i * label_cols + c] = lambda * labels.data()[i * label_cols + c]
                        + (1.0 - lambda) * labels.data()[partner * label_cols + c];
                }
            }
        }
        Ok((mixed_inputs, mixed_labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn mixup_eval_is_identity() {
        let mixup = MixupLayer::new(1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let x = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let (mx, my) = mixup.apply(&x, &y, TrainPhase::Eval, &mut rng).unwrap();
        assert_eq!(mx, x);
        assert_eq!(my, y);
    }

    #[test]
    fn mixup_train_stays_convex() {
        let mixup = MixupLayer::new(1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let x = Tensor::from_vec(4, 1, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let y = Tensor::from_vec(
            4,
            2,
            vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        )
        .unwrap();
        let (mx, my) = mixup.apply(&x, &y, TrainPhase::Train, &mut rng).unwrap();
        for i in 0..4 {
            let lo = x.data()[i].min(x.data()[3 - i]);
            let hi = x.data()[i].max(x.data()[3 - i]);
            assert!(mx.data()[i] >= lo && mx.data()[i] <= hi);
            let mass: f32 = my.row(i).unwrap().iter().sum();
            assert!((mass - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn mixup_zero_probability_never_blends() {
        let mixup = MixupLayer::new(0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let x = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = Tensor::from_vec(2, 1, vec![1.0, 1.0]).unwrap();
        let (mx, _) = mixup.apply(&x, &y, TrainPhase::Train, &mut rng).unwrap();
        assert_eq!(mx, x);
    }
}
