// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Adam with bias-corrected first and second moments, keyed by parameter
/// name so the same optimizer instance can serve a module tree across steps.
/// Parameters without an accumulated gradient are left untouched.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: i32,
    moments: HashMap<String, (Tensor, Tensor)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(TensorError::NonFiniteValue {
                label: "learning_rate",
                value: learning_rate,
            });
        }
        Ok(Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            moments: HashMap::new(),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Applies one update to every parameter that accumulated a gradient and
    /// clears the accumulators.
    pub fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        self.timestep += 1;
        let bias1 = 1.0 - self.beta1.powi(self.timestep);
        let bias2 = 1.0 - self.beta2.powi(self.timestep);
        let beta1 = self.beta1;
        let beta2 = self.beta2;
        let epsilon = self.epsilon;
        let learning_rate = self.learning_rate;
        let moments = &mut self.moments;

        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let (rows, cols) = grad.shape();
            let entry = match moments.get_mut(param.name()) {
                Some(entry) => entry,
                None => {
                    moments.insert(
                        param.name().to_string(),
                        (Tensor::zeros(rows, cols)?, Tensor::zeros(rows, cols)?),
                    );
                    moments
                        .get_mut(param.name())
                        .ok_or(TensorError::EmptyInput("adam_moments"))?
                }
            };
            if entry.0.shape() != grad.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: entry.0.shape(),
                    right: grad.shape(),
                });
            }

            let value = param.value_mut().data_mut();
            let first = entry.0.data_mut();
            let second = entry.1.data_mut();
            for i in 0..rows * cols {
                let g = grad.data()[i];
                first[i] = beta1 * first[i] + (1.0 - beta1) * g;
                second[i] = beta2 * second[i] + (1.0 - beta2) * g * g;
                let m_hat = first[i] / bias1;
                let v_hat = second[i] / bias2;
                value[i] -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            }
            param.zero_gradient();
            Ok(())
        })
    }
}
