// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::batch_indices;
use crate::io::{load_state_dict_bincode, save_state_dict_bincode};
use crate::model::EmbeddingNet;
use crate::optim::Adam;
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use std::path::PathBuf;
use tracing::info;

/// Deterministic checkpoint key for one (aeon, sample-rate, ensemble) cell.
pub fn checkpoint_name(aeon: usize, sample_rate: u32, ensemble_index: usize) -> String {
    format!("wts_{aeon}k_{sample_rate}_{ensemble_index}.ckpt")
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub sample_rate: u32,
    pub checkpoint_dir: PathBuf,
}

impl TrainerConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            sample_rate: 16_000,
            checkpoint_dir: checkpoint_dir.into(),
        }
    }
}

/// Losses observed during one epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub validation_loss: f32,
}

/// One split's fit inputs, aligned by row.
#[derive(Debug, Clone, Copy)]
pub struct FitData<'a> {
    pub waveforms: &'a Tensor,
    pub labels: &'a Tensor,
    pub weights: &'a [f32],
}

impl<'a> FitData<'a> {
    pub fn new(waveforms: &'a Tensor, labels: &'a Tensor, weights: &'a [f32]) -> PureResult<Self> {
        let rows = waveforms.shape().0;
        if labels.shape().0 != rows || weights.len() != rows {
            return Err(TensorError::DataLength {
                expected: rows,
                got: labels.shape().0.min(weights.len()),
            });
        }
        Ok(Self {
            waveforms,
            labels,
            weights,
        })
    }

    fn batch(&self, indices: &[usize]) -> PureResult<(Tensor, Tensor, Vec<f32>)> {
        let waveforms = self.waveforms.select_rows(indices)?;
        let labels = self.labels.select_rows(indices)?;
        let weights = indices.iter().map(|&i| self.weights[i]).collect();
        Ok((waveforms, labels, weights))
    }
}

/// Runs the fixed-epoch fit over source-domain samples, or restores the
/// model from an existing checkpoint instead. The checkpoint is the only
/// recovery mechanism; there is no mid-training resume.
#[derive(Debug)]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> PureResult<Self> {
        if config.epochs == 0 || config.batch_size == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: config.epochs,
                cols: config.batch_size,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn fit_or_restore(
        &self,
        model: &mut EmbeddingNet,
        train: FitData<'_>,
        validation: FitData<'_>,
        aeon: usize,
        ensemble_index: usize,
        rng: &mut StdRng,
    ) -> PureResult<Vec<EpochStats>> {
        let path = self
            .config
            .checkpoint_dir
            .join(checkpoint_name(aeon, self.config.sample_rate, ensemble_index));
        if path.is_file() {
            info!(checkpoint = %path.display(), "restoring existing checkpoint");
            load_state_dict_bincode(model, &path)?;
            return Ok(Vec::new());
        }

        let mut optimizer = Adam::new(self.config.learning_rate)?;
        let samples = train.waveforms.shape().0;
        if samples == 0 {
            return Err(TensorError::EmptyInput("fit_inputs"));
        }

        let mut history = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            let mut train_loss = 0.0f32;
            let batches = batch_indices(samples, self.config.batch_size, rng);
            let batch_count = batches.len();
            for indices in batches {
                let (waveforms, labels, weights) = train.batch(&indices)?;
                train_loss += model.train_step(&waveforms, &labels, &weights, rng)?;
                optimizer.step(model)?;
            }
            train_loss /= batch_count as f32;

            let validation_loss = self.validation_pass(model, validation, rng)?;
            info!(
                epoch = epoch + 1,
                train_loss, validation_loss, "epoch complete"
            );
            history.push(EpochStats {
                epoch: epoch + 1,
                train_loss,
                validation_loss,
            });
        }

        save_state_dict_bincode(model, &path)?;
        info!(checkpoint = %path.display(), "saved checkpoint");
        Ok(history)
    }

    fn validation_pass(
        &self,
        model: &EmbeddingNet,
        validation: FitData<'_>,
        rng: &mut StdRng,
    ) -> PureResult<f32> {
        let samples = validation.waveforms.shape().0;
        if samples == 0 {
            return Err(TensorError::EmptyInput("validation_inputs"));
        }
        let mut total = 0.0f32;
        let mut seen = 0usize;
        let mut start = 0usize;
        while start < samples {
            let end = (start + self.config.batch_size).min(samples);
            let indices: Vec<usize> = (start..end).collect();
            let (waveforms, labels, weights) = validation.batch(&indices)?;
            total += model.validation_loss(&waveforms, &labels, &weights, rng)? * indices.len() as f32;
            seen += indices.len();
            start = end;
        }
        Ok(total / seen as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EmbeddingNetConfig;
    use rand::SeedableRng;

    fn tiny_model(rng: &mut StdRng) -> EmbeddingNet {
        let config = EmbeddingNetConfig {
            waveform_len: 1_024,
            fft_bins: 256,
            fft_size: 64,
            hop_size: 32,
            fft_conv_channels: 2,
            fft_dense_units: 4,
            stem_channels: 2,
            branch_dim: 4,
            num_classes: 2,
            subclusters: 2,
            mixup_prob: 0.5,
            augment_prob: 0.5,
        };
        EmbeddingNet::new(config, rng).unwrap()
    }

    fn toy_fit_inputs(rng: &mut StdRng) -> (Tensor, Tensor, Vec<f32>) {
        let waveforms = Tensor::random_uniform(4, 1_024, -1.0, 1.0, rng).unwrap();
        let labels = Tensor::from_vec(
            4,
            2,
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        (waveforms, labels, vec![1.0; 4])
    }

    #[test]
    fn checkpoint_names_are_deterministic() {
        assert_eq!(checkpoint_name(1, 16_000, 3), "wts_1k_16000_3.ckpt");
    }

    #[test]
    fn fit_writes_a_checkpoint_and_restores_from_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrainerConfig::new(dir.path());
        config.epochs = 1;
        config.batch_size = 2;
        let trainer = Trainer::new(config).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let mut model = tiny_model(&mut rng);
        let (waveforms, labels, weights) = toy_fit_inputs(&mut rng);
        let train = FitData::new(&waveforms, &labels, &weights).unwrap();

        let history = trainer
            .fit_or_restore(&mut model, train, train, 1, 1, &mut rng)
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].train_loss.is_finite());
        assert!(dir
            .path()
            .join(checkpoint_name(1, 16_000, 1))
            .is_file());

        // Second call restores instead of training.
        let restored = trainer
            .fit_or_restore(&mut model, train, train, 1, 1, &mut rng)
            .unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn trainer_rejects_zero_epochs() {
        let mut config = TrainerConfig::new(".");
        config.epochs = 0;
        assert!(Trainer::new(config).is_err());
    }
}
