// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, TrainPhase};
use crate::{PureResult, Tensor};

/// Ordered container that chains module forward/backward passes.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn push<M: Module + 'static>(&mut self, module: M) {
        self.layers.push(Box::new(module));
    }

    pub fn push_boxed(&mut self, module: Box<dyn Module>) {
        self.layers.push(module);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.forward(&current)?;
        }
        Ok(current)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        // Recompute intermediate activations so each layer sees its own input.
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.clone());
        for layer in &self.layers {
            let next = layer.forward(activations.last().ok_or(
                crate::TensorError::EmptyInput("sequential_backward"),
            )?)?;
            activations.push(next);
        }

        let mut grad = grad_output.clone();
        for (index, layer) in self.layers.iter_mut().enumerate().rev() {
            grad = layer.backward(&activations[index], &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_phase(&self, phase: TrainPhase) {
        for layer in &self.layers {
            layer.set_phase(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Linear, Relu};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sequential_chains_layers() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut net = Sequential::new();
        net.push(Linear::new("a", 3, 4, &mut rng).unwrap());
        net.push(Relu::new());
        net.push(Linear::new("b", 4, 2, &mut rng).unwrap());
        let input = Tensor::from_vec(2, 3, vec![0.1, -0.2, 0.3, 0.4, 0.5, -0.6]).unwrap();
        let output = net.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 2));
    }

    #[test]
    fn sequential_backward_updates_every_layer() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut net = Sequential::new();
        net.push(Linear::new("a", 2, 3, &mut rng).unwrap());
        net.push(Relu::new());
        net.push(Linear::new("b", 3, 1, &mut rng).unwrap());
        let input = Tensor::from_vec(2, 2, vec![1.0, -1.0, 0.5, 0.25]).unwrap();
        let output = net.forward(&input).unwrap();
        let grad = output.scale(0.5).unwrap();
        let grad_in = net.backward(&input, &grad).unwrap();
        assert_eq!(grad_in.shape(), input.shape());

        let mut grads = 0usize;
        net.visit_parameters(&mut |param| {
            if param.gradient().is_some() {
                grads += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(grads, 4);
    }
}
