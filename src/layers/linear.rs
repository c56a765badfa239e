// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Fully-connected layer with Glorot-uniform initialised weights.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let limit = (6.0 / (input_dim + output_dim) as f32).sqrt();
        let weights = Tensor::random_uniform(input_dim, output_dim, -limit, limit, rng)?;
        let bias = Tensor::zeros(1, output_dim)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weights),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let batch = input.shape().0 as f32;
        let grad_w = input.transpose().matmul(grad_output)?.scale(1.0 / batch)?;
        self.weight.accumulate_euclidean(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?.scale(1.0 / batch)?;
        self.bias.accumulate_euclidean(&grad_b)?;

        let weight_t = self.weight.value().transpose();
        let grad_input = grad_output.matmul(&weight_t)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn linear_forward_matches_manual() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new("fc", 3, 2, &mut rng).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let mut expected = input.matmul(layer.weight.value()).unwrap();
        expected.add_row_inplace(layer.bias.value().data()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn linear_backward_moves_weights() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Linear::new("fc", 4, 3, &mut rng).unwrap();
        let input =
            Tensor::from_vec(2, 4, vec![0.1, 0.2, -0.3, 0.4, -0.5, 0.6, 0.7, -0.8]).unwrap();
        let output = layer.forward(&input).unwrap();
        let grad = output.scale(1.0 / input.shape().0 as f32).unwrap();
        let _ = layer.backward(&input, &grad).unwrap();
        let before = layer.weight().value().clone();
        layer.apply_step(0.01).unwrap();
        assert_ne!(before, *layer.weight().value());
    }
}
