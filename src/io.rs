// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Flat tensor payload used by snapshots. Kept independent of [`Tensor`] so
/// the on-disk format stays stable even if the in-memory layout changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        let (rows, cols) = tensor.shape();
        Self {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    pub fn to_tensor(&self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data.clone())
    }
}

/// Serializable collection of named parameter tensors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub parameters: HashMap<String, StoredTensor>,
}

impl ModuleSnapshot {
    pub fn capture(module: &dyn Module) -> PureResult<Self> {
        let mut snapshot = Self::default();
        module.visit_parameters(&mut |param| {
            snapshot.parameters.insert(
                param.name().to_string(),
                StoredTensor::from_tensor(param.value()),
            );
            Ok(())
        })?;
        Ok(snapshot)
    }

    pub fn restore(&self, module: &mut dyn Module) -> PureResult<()> {
        let mut state = HashMap::with_capacity(self.parameters.len());
        for (name, stored) in &self.parameters {
            state.insert(name.clone(), stored.to_tensor()?);
        }
        module.load_state_dict(&state)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> PureResult<()> {
        let encoded =
            serde_json::to_vec_pretty(self).map_err(|err| TensorError::SerializationError {
                message: err.to_string(),
            })?;
        fs::write(path, encoded).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })
    }

    pub fn load_json(path: impl AsRef<Path>) -> PureResult<Self> {
        let bytes = fs::read(path).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })
    }

    pub fn save_bincode(&self, path: impl AsRef<Path>) -> PureResult<()> {
        let encoded = bincode::serialize(self).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })?;
        fs::write(path, encoded).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })
    }

    pub fn load_bincode(path: impl AsRef<Path>) -> PureResult<Self> {
        let bytes = fs::read(path).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        bincode::deserialize(&bytes).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })
    }
}

/// Writes the module's parameters to a compact binary checkpoint.
pub fn save_state_dict_bincode(module: &dyn Module, path: impl AsRef<Path>) -> PureResult<()> {
    ModuleSnapshot::capture(module)?.save_bincode(path)
}

/// Restores parameters written by [`save_state_dict_bincode`].
pub fn load_state_dict_bincode(module: &mut dyn Module, path: impl AsRef<Path>) -> PureResult<()> {
    ModuleSnapshot::load_bincode(path)?.restore(module)
}

/// Writes the module's parameters as readable JSON, useful for inspection.
pub fn save_state_dict_json(module: &dyn Module, path: impl AsRef<Path>) -> PureResult<()> {
    ModuleSnapshot::capture(module)?.save_json(path)
}

/// Restores parameters written by [`save_state_dict_json`].
pub fn load_state_dict_json(module: &mut dyn Module, path: impl AsRef<Path>) -> PureResult<()> {
    ModuleSnapshot::load_json(path)?.restore(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Linear, Sequential};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_network(seed: u64) -> Sequential {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut net = Sequential::new();
        net.push(Linear::new("a", 3, 4, &mut rng).unwrap());
        net.push(Linear::new("b", 4, 2, &mut rng).unwrap());
        net
    }

    #[test]
    fn bincode_roundtrip_restores_parameters() {
        let source = toy_network(0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        save_state_dict_bincode(&source, &path).unwrap();

        let mut target = toy_network(99);
        load_state_dict_bincode(&mut target, &path).unwrap();
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
    }

    #[test]
    fn json_roundtrip_restores_parameters() {
        let source = toy_network(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        save_state_dict_json(&source, &path).unwrap();

        let mut target = toy_network(2);
        load_state_dict_json(&mut target, &path).unwrap();
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
    }

    #[test]
    fn restore_rejects_missing_parameters() {
        let snapshot = ModuleSnapshot::default();
        let mut target = toy_network(3);
        assert!(matches!(
            snapshot.restore(&mut target),
            Err(TensorError::MissingParameter { .. })
        ));
    }
}
