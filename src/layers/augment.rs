// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::TrainPhase;
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::Rng;
use std::cell::RefCell;

/// Self-supervised branch shuffling.
///
/// During training each sample keeps its spectrogram embedding with
/// probability `prob`; otherwise it receives the embedding of its mirror
/// partner (row `batch - 1 - i`) while the waveform-spectrum embedding stays
/// put, producing deliberately inconsistent branch pairs. Labels are widened
/// to three class groups: kept pairs carry `[y, 0, 0]`, shuffled pairs carry
/// `[0, y/2, y_rev/2]` so the auxiliary head must recognise both identities
/// of a mismatched pair. Evaluation keeps embeddings untouched and emits
/// `[y, 0, 0]`.
///
/// The per-sample keep decisions are cached so the gradient of the shuffle
/// can be undone in [`SelfSupAugment::backward`].
#[derive(Debug)]
pub struct SelfSupAugment {
    prob: f32,
    decisions: RefCell<Vec<bool>>,
}

impl SelfSupAugment {
    pub fn new(prob: f32) -> PureResult<Self> {
        if !(0.0..=1.0).contains(&prob) {
            return Err(TensorError::NonFiniteValue {
                label: "augment_prob",
                value: prob,
            });
        }
        Ok(Self {
            prob,
            decisions: RefCell::new(Vec::new()),
        })
    }

    /// Returns `(spec_out, fft_out, labels_out)` with labels widened to
    /// `3 * labels.cols()`.
    pub fn apply(
        &self,
        emb_spec: &Tensor,
        emb_fft: &Tensor,
        labels: &Tensor,
        phase: TrainPhase,
        rng: &mut StdRng,
    ) -> PureResult<(Tensor, Tensor, Tensor)> {
        let (batch, spec_cols) = emb_spec.shape();
        if emb_fft.shape().0 != batch || labels.shape().0 != batch {
            return Err(TensorError::ShapeMismatch {
                left: emb_fft.shape(),
                right: (batch, emb_fft.shape().1),
            });
        }
        let classes = labels.shape().1;
        let mut widened = Tensor::zeros(batch, classes * 3)?;

        if phase == TrainPhase::Eval {
            let data = widened.data_mut();
            for i in 0..batch {
                for c in 0..classes {
                    data[i * classes * 3 + c] = labels.data()[i * classes + c];
                }
            }
            self.decisions.borrow_mut().clear();
            return Ok((emb_spec.clone(), emb_fft.clone(), widened));
        }

        let mut decisions = Vec::with_capacity(batch);
        for _ in 0..batch {
            decisions.push(rng.gen::<f32>() < self.prob);
        }

        let mut spec_out = Tensor::zeros(batch, spec_cols)?;
        {
            let out_data = spec_out.data_mut();
            let label_data = widened.data_mut();
            for i in 0..batch {
                let partner = batch - 1 - i;
                if decisions[i] {
                    out_data[i * spec_cols..(i + 1) * spec_cols]
                        .copy_from_slice(emb_spec.row(i)?);
                    for c in 0..classes {
                        label_data[i * classes * 3 + c] = labels.data()[i * classes + c];
                    }
                } else {
                    out_data[i * spec_cols..(i + 1) * spec_cols]
                        .copy_from_slice(emb_spec.row(partner)?);
                    for c in 0..classes {
                        label_data[i * classes * 3 + classes + c] =
                            0.5 * labels.data()[i * classes + c];
                        label_data[i * classes * 3 + 2 * classes + c] =
                            0.5 * labels.data()[partner * classes + c];
                    }
                }
            }
        }
        *self.decisions.borrow_mut() = decisions;
        Ok((spec_out, emb_fft.clone(), widened))
    }

    /// Routes the gradient of the shuffled spectrogram embedding back to the
    /// rows that produced it. The waveform-spectrum branch is untouched by
    /// the forward pass, so its gradient passes through unchanged.
    pub fn backward(&self, grad_spec: &Tensor) -> PureResult<Tensor> {
        let decisions = self.decisions.borrow();
        let (batch, cols) = grad_spec.shape();
        if decisions.len() != batch {
            return Err(TensorError::ShapeMismatch {
                left: (decisions.len(), 1),
                right: (batch, 1),
            });
        }
        let mut grad_input = Tensor::zeros(batch, cols)?;
        {
            let grad_data = grad_input.data_mut();
            for j in 0..batch {
                let partner = batch - 1 - j;
                if decisions[j] {
                    for c in 0..cols {
                        grad_data[j * cols + c] += grad_spec.data()[j * cols + c];
                    }
                }
                if !decisions[partner] {
                    for c in 0..cols {
                        grad_data[j * cols + c] += grad_spec.data()[partner * cols + c];
                    }
                }
            }
        }
        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn fixtures() -> (Tensor, Tensor, Tensor) {
        let spec = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let fft = Tensor::from_vec(2, 2, vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let labels = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        (spec, fft, labels)
    }

    #[test]
    fn eval_widens_labels_without_shuffling() {
        let aug = SelfSupAugment::new(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let (spec, fft, labels) = fixtures();
        let (s, f, y) = aug
            .apply(&spec, &fft, &labels, TrainPhase::Eval, &mut rng)
            .unwrap();
        assert_eq!(s, spec);
        assert_eq!(f, fft);
        assert_eq!(y.shape(), (2, 6));
        assert_eq!(y.row(0).unwrap(), &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn always_shuffle_reverses_and_splits_labels() {
        let aug = SelfSupAugment::new(0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let (spec, fft, labels) = fixtures();
        let (s, f, y) = aug
            .apply(&spec, &fft, &labels, TrainPhase::Train, &mut rng)
            .unwrap();
        assert_eq!(s.row(0).unwrap(), spec.row(1).unwrap());
        assert_eq!(s.row(1).unwrap(), spec.row(0).unwrap());
        assert_eq!(f, fft);
        assert_eq!(y.row(0).unwrap(), &[0.0, 0.0, 0.5, 0.0, 0.0, 0.5]);
        let mass: f32 = y.row(0).unwrap().iter().sum();
        assert!((mass - 1.0).abs() < 1e-6);
    }

    #[test]
    fn backward_inverts_the_shuffle() {
        let aug = SelfSupAugment::new(0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let (spec, fft, labels) = fixtures();
        let _ = aug
            .apply(&spec, &fft, &labels, TrainPhase::Train, &mut rng)
            .unwrap();
        let grad = Tensor::from_vec(2, 2, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let grad_in = aug.backward(&grad).unwrap();
        // Every output row was its partner's input, so gradients swap back.
        assert_eq!(grad_in.row(0).unwrap(), &[0.3, 0.4]);
        assert_eq!(grad_in.row(1).unwrap(), &[0.1, 0.2]);
    }

    #[test]
    fn keep_all_is_identity_in_both_directions() {
        let aug = SelfSupAugment::new(1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let (spec, fft, labels) = fixtures();
        let (s, _, y) = aug
            .apply(&spec, &fft, &labels, TrainPhase::Train, &mut rng)
            .unwrap();
        assert_eq!(s, spec);
        assert_eq!(y.row(1).unwrap(), &[0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let grad = fft.clone();
        assert_eq!(aug.backward(&grad).unwrap(), grad);
    }
}
