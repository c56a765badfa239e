// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, TrainPhase};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

const DEFAULT_MOMENTUM: f32 = 0.1;
const DEFAULT_EPS: f32 = 1e-5;

/// Batch normalisation over flat feature vectors.
///
/// Training mode normalises with batch statistics and folds them into the
/// running estimates; evaluation mode normalises with the running estimates
/// alone. The phase is toggled through [`Module::set_phase`].
#[derive(Debug)]
pub struct BatchNorm1d {
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    last_mean: RefCell<Vec<f32>>,
    last_inv_std: RefCell<Vec<f32>>,
    momentum: f32,
    eps: f32,
    training: Cell<bool>,
    features: usize,
}

impl BatchNorm1d {
    pub fn new(name: impl Into<String>, features: usize) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, features, vec![1.0; features])?;
        let beta = Tensor::zeros(1, features)?;
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            running_mean: RefCell::new(vec![0.0; features]),
            running_var: RefCell::new(vec![1.0; features]),
            last_mean: RefCell::new(vec![0.0; features]),
            last_inv_std: RefCell::new(vec![1.0; features]),
            momentum: DEFAULT_MOMENTUM,
            eps: DEFAULT_EPS,
            training: Cell::new(true),
            features,
        })
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    fn check_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.features {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.features),
            });
        }
        Ok(())
    }
}

impl Module for BatchNorm1d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let (batch, features) = input.shape();
        if batch == 0 {
            return Err(TensorError::EmptyInput("batch_norm_forward"));
        }
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut out = Tensor::zeros(batch, features)?;

        if self.training.get() {
            let mut mean = vec![0.0f32; features];
            let mut var = vec![0.0f32; features];
            for row in 0..batch {
                for (f, m) in mean.iter_mut().enumerate() {
                    *m += input.data()[row * features + f];
                }
            }
            for m in mean.iter_mut() {
                *m /= batch as f32;
            }
            for row in 0..batch {
                for (f, v) in var.iter_mut().enumerate() {
                    let diff = input.data()[row * features + f] - mean[f];
                    *v += diff * diff;
                }
            }
            for v in var.iter_mut() {
                *v /= batch as f32;
            }

            let mut inv_std = vec![0.0f32; features];
            for (f, slot) in inv_std.iter_mut().enumerate() {
                *slot = 1.0 / (var[f] + self.eps).sqrt();
            }

            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for f in 0..features {
                    running_mean[f] =
                        (1.0 - self.momentum) * running_mean[f] + self.momentum * mean[f];
                    running_var[f] =
                        (1.0 - self.momentum) * running_var[f] + self.momentum * var[f];
                }
            }
            self.last_mean.borrow_mut().copy_from_slice(&mean);
            self.last_inv_std.borrow_mut().copy_from_slice(&inv_std);

            let out_data = out.data_mut();
            for row in 0..batch {
                for f in 0..features {
                    let normed = (input.data()[row * features + f] - mean[f]) * inv_std[f];
                    out_data[row * features + f] = gamma[f] * normed + beta[f];
                }
            }
        } else {
            let running_mean = self.running_mean.borrow();
            let running_var = self.running_var.borrow();
            let out_data = out.data_mut();
            for row in 0..batch {
                for f in 0..features {
                    let inv_std = 1.0 / (running_var[f] + self.eps).sqrt();
                    let normed = (input.data()[row * features + f] - running_mean[f]) * inv_std;
                    out_data[row * features + f] = gamma[f] * normed + beta[f];
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if !self.training.get() {
            return Err(TensorError::InvalidValue {
                label: "batch_norm_eval_backward",
            });
        }
        self.check_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (batch, features) = input.shape();
        let mean = self.last_mean.borrow().clone();
        let inv_std = self.last_inv_std.borrow().clone();
        let gamma = self.gamma.value().data().to_vec();

        let mut grad_gamma = vec![0.0f32; features];
        let mut grad_beta = vec![0.0f32; features];
        let mut sum_grad = vec![0.0f32; features];
        let mut sum_grad_norm = vec![0.0f32; features];
        for row in 0..batch {
            for f in 0..features {
                let idx = row * features + f;
                let normed = (input.data()[idx] - mean[f]) * inv_std[f];
                let g = grad_output.data()[idx];
                grad_gamma[f] += g * normed;
                grad_beta[f] += g;
                sum_grad[f] += g * gamma[f];
                sum_grad_norm[f] += g * gamma[f] * normed;
            }
        }

        let mut grad_input = Tensor::zeros(batch, features)?;
        {
            let grad_data = grad_input.data_mut();
            for row in 0..batch {
                for f in 0..features {
                    let idx = row * features + f;
                    let normed = (input.data()[idx] - mean[f]) * inv_std[f];
                    let g = grad_output.data()[idx] * gamma[f];
                    grad_data[idx] = (batch as f32 * g
                        - sum_grad[f]
                        - normed * sum_grad_norm[f])
                        / batch as f32
                        * inv_std[f];
                }
            }
        }

        let inv_batch = 1.0 / batch as f32;
        let grad_gamma = Tensor::from_vec(1, features, grad_gamma)?.scale(inv_batch)?;
        let grad_beta = Tensor::from_vec(1, features, grad_beta)?.scale(inv_batch)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        self.beta.accumulate_euclidean(&grad_beta)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        Ok(())
    }

    fn set_phase(&self, phase: TrainPhase) {
        self.training.set(phase == TrainPhase::Train);
    }
}

/// Batch normalisation over channel-major feature maps.
///
/// Inputs are `(batch, channels * spatial)` with each channel occupying a
/// contiguous block of `spatial` values, so statistics for a channel pool
/// every spatial position across the batch. Normalising a spectrogram along
/// its frequency axis is expressed as `channels = freq_bins`,
/// `spatial = frames`.
#[derive(Debug)]
pub struct BatchNorm2d {
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    last_mean: RefCell<Vec<f32>>,
    last_inv_std: RefCell<Vec<f32>>,
    momentum: f32,
    eps: f32,
    training: Cell<bool>,
    channels: usize,
    spatial: usize,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize, spatial: usize) -> PureResult<Self> {
        if channels == 0 || spatial == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: spatial,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![1.0; channels]),
            last_mean: RefCell::new(vec![0.0; channels]),
            last_inv_std: RefCell::new(vec![1.0; channels]),
            momentum: DEFAULT_MOMENTUM,
            eps: DEFAULT_EPS,
            training: Cell::new(true),
            channels,
            spatial,
        })
    }

    fn check_input(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.channels * self.spatial {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.channels * self.spatial),
            });
        }
        Ok(())
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let (batch, cols) = input.shape();
        if batch == 0 {
            return Err(TensorError::EmptyInput("batch_norm2d_forward"));
        }
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let count = (batch * self.spatial) as f32;
        let mut out = Tensor::zeros(batch, cols)?;

        if self.training.get() {
            let mut mean = vec![0.0f32; self.channels];
            let mut var = vec![0.0f32; self.channels];
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    for value in &row[c * self.spatial..(c + 1) * self.spatial] {
                        mean[c] += value;
                    }
                }
            }
            for m in mean.iter_mut() {
                *m /= count;
            }
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    for value in &row[c * self.spatial..(c + 1) * self.spatial] {
                        let diff = value - mean[c];
                        var[c] += diff * diff;
                    }
                }
            }
            for v in var.iter_mut() {
                *v /= count;
            }

            let mut inv_std = vec![0.0f32; self.channels];
            for (c, slot) in inv_std.iter_mut().enumerate() {
                *slot = 1.0 / (var[c] + self.eps).sqrt();
            }

            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for c in 0..self.channels {
                    running_mean[c] =
                        (1.0 - self.momentum) * running_mean[c] + self.momentum * mean[c];
                    running_var[c] =
                        (1.0 - self.momentum) * running_var[c] + self.momentum * var[c];
                }
            }
            self.last_mean.borrow_mut().copy_from_slice(&mean);
            self.last_inv_std.borrow_mut().copy_from_slice(&inv_std);

            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    for s in 0..self.spatial {
                        let idx = c * self.spatial + s;
                        let normed = (row[idx] - mean[c]) * inv_std[c];
                        out_row[idx] = gamma[c] * normed + beta[c];
                    }
                }
            }
        } else {
            let running_mean = self.running_mean.borrow();
            let running_var = self.running_var.borrow();
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    let inv_std = 1.0 / (running_var[c] + self.eps).sqrt();
                    for s in 0..self.spatial {
                        let idx = c * self.spatial + s;
                        let normed = (row[idx] - running_mean[c]) * inv_std;
                        out_row[idx] = gamma[c] * normed + beta[c];
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if !self.training.get() {
            return Err(TensorError::InvalidValue {
                label: "batch_norm_eval_backward",
            });
        }
        self.check_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (batch, cols) = input.shape();
        let mean = self.last_mean.borrow().clone();
        let inv_std = self.last_inv_std.borrow().clone();
        let gamma = self.gamma.value().data().to_vec();
        let count = (batch * self.spatial) as f32;

        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];
        let mut sum_grad = vec![0.0f32; self.channels];
        let mut sum_grad_norm = vec![0.0f32; self.channels];
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
            for c in 0..self.channels {
                for s in 0..self.spatial {
                    let idx = c * self.spatial + s;
                    let normed = (row[idx] - mean[c]) * inv_std[c];
                    let g = grad_row[idx];
                    grad_gamma[c] += g * normed;
                    grad_beta[c] += g;
                    sum_grad[c] += g * gamma[c];
                    sum_grad_norm[c] += g * gamma[c] * normed;
                }
            }
        }

        let mut grad_input = Tensor::zeros(batch, cols)?;
        {
            let grad_data = grad_input.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_data[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    for s in 0..self.spatial {
                        let idx = c * self.spatial + s;
                        let normed = (row[idx] - mean[c]) * inv_std[c];
                        let g = grad_row[idx] * gamma[c];
                        grad_in_row[idx] = (count * g
                            - sum_grad[c]
                            - normed * sum_grad_norm[c])
                            / count
                            * inv_std[c];
                    }
                }
            }
        }

        let inv_count = 1.0 / count;
        let grad_gamma = Tensor::from_vec(1, self.channels, grad_gamma)?.scale(inv_count)?;
        let grad_beta = Tensor::from_vec(1, self.channels, grad_beta)?.scale(inv_count)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        self.beta.accumulate_euclidean(&grad_beta)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        Ok(())
    }

    fn set_phase(&self, phase: TrainPhase) {
        self.training.set(phase == TrainPhase::Train);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_norm_training_normalises_batch() {
        let bn = BatchNorm1d::new("bn", 2).unwrap();
        let input = Tensor::from_vec(4, 2, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0])
            .unwrap();
        let out = bn.forward(&input).unwrap();
        for f in 0..2 {
            let mut mean = 0.0;
            for row in 0..4 {
                mean += out.data()[row * 2 + f];
            }
            assert!((mean / 4.0).abs() < 1e-5);
        }
    }

    #[test]
    fn batch_norm_eval_uses_running_stats() {
        let bn = BatchNorm1d::new("bn", 1).unwrap();
        let input = Tensor::from_vec(2, 1, vec![5.0, 7.0]).unwrap();
        let _ = bn.forward(&input).unwrap();
        bn.set_phase(TrainPhase::Eval);
        let probe = Tensor::from_vec(1, 1, vec![6.0]).unwrap();
        let out = bn.forward(&probe).unwrap();
        // Running mean moved 10% toward 6.0, so 6.0 does not map to zero.
        assert!(out.data()[0].abs() > 1e-3);
    }

    #[test]
    fn batch_norm_eval_backward_fails() {
        let mut bn = BatchNorm1d::new("bn", 1).unwrap();
        let input = Tensor::from_vec(2, 1, vec![1.0, 2.0]).unwrap();
        let _ = bn.forward(&input).unwrap();
        bn.set_phase(TrainPhase::Eval);
        let grad = Tensor::from_vec(2, 1, vec![0.1, 0.2]).unwrap();
        assert!(bn.backward(&input, &grad).is_err());
    }

    #[test]
    fn batch_norm2d_pools_channel_statistics() {
        let bn = BatchNorm2d::new("bn2", 2, 3).unwrap();
        let input = Tensor::from_vec(
            2,
            6,
            vec![
                1.0, 2.0, 3.0, 10.0, 20.0, 30.0, //
                4.0, 5.0, 6.0, 40.0, 50.0, 60.0,
            ],
        )
        .unwrap();
        let out = bn.forward(&input).unwrap();
        for c in 0..2 {
            let mut mean = 0.0;
            for b in 0..2 {
                for s in 0..3 {
                    mean += out.data()[b * 6 + c * 3 + s];
                }
            }
            assert!((mean / 6.0).abs() < 1e-5);
        }
    }

    #[test]
    fn batch_norm2d_backward_gradient_sums_to_zero() {
        let mut bn = BatchNorm2d::new("bn2", 1, 2).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let _ = bn.forward(&input).unwrap();
        let grad = Tensor::from_vec(2, 2, vec![0.5, -0.25, 0.75, 0.1]).unwrap();
        let grad_in = bn.backward(&input, &grad).unwrap();
        let total: f32 = grad_in.data().iter().sum();
        assert!(total.abs() < 1e-4);
    }
}
