// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::model::{EmbeddingNet, EmbeddingNetConfig};
use crate::module::{Module, TrainPhase};
use crate::scoring::{length_norm, ClusterScorer, ScoreTensor, SplitView};
use crate::trainer::{FitData, Trainer, TrainerConfig};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

const CLUSTER_SEED: u64 = 0;

#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Independently trained members whose distances are summed.
    pub size: usize,
    /// Outer training rounds per member; each gets its own checkpoint.
    pub aeons: usize,
    pub base_seed: u64,
    pub trainer: TrainerConfig,
}

impl EnsembleConfig {
    pub fn new(trainer: TrainerConfig) -> Self {
        Self {
            size: 10,
            aeons: 1,
            base_seed: 0,
            trainer,
        }
    }
}

/// Fit inputs plus the per-row metadata the scorer needs.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSplit<'a> {
    pub fit: FitData<'a>,
    pub class_labels: &'a [usize],
    pub source: &'a [bool],
}

impl<'a> TrainingSplit<'a> {
    pub fn new(
        fit: FitData<'a>,
        class_labels: &'a [usize],
        source: &'a [bool],
    ) -> PureResult<Self> {
        let rows = fit.waveforms.shape().0;
        if class_labels.len() != rows || source.len() != rows {
            return Err(TensorError::DataLength {
                expected: rows,
                got: class_labels.len().min(source.len()),
            });
        }
        Ok(Self {
            fit,
            class_labels,
            source,
        })
    }
}

/// A split to be scored against the training references.
#[derive(Debug, Clone, Copy)]
pub struct ScoredSplit<'a> {
    pub waveforms: &'a Tensor,
    pub class_labels: &'a [usize],
}

/// Trains `size` members from distinct seeds and accumulates every member's
/// nearest-prototype distances into one score tensor per split. With a
/// single member the scores are written rather than summed.
#[derive(Debug)]
pub struct Ensemble {
    config: EnsembleConfig,
}

impl Ensemble {
    pub fn new(config: EnsembleConfig) -> PureResult<Self> {
        if config.size == 0 || config.aeons == 0 {
            return Err(TensorError::EmptyInput("ensemble_config"));
        }
        Ok(Self { config })
    }

    pub fn run(
        &self,
        model_config: &EmbeddingNetConfig,
        train: TrainingSplit<'_>,
        validation: FitData<'_>,
        splits: &[ScoredSplit<'_>],
    ) -> PureResult<Vec<ScoreTensor>> {
        let num_classes = model_config.num_classes;
        let accumulate = self.config.size > 1;
        let mut scores: Vec<ScoreTensor> = splits
            .iter()
            .map(|split| ScoreTensor::new(split.waveforms.shape().0, num_classes))
            .collect();
        let trainer = Trainer::new(self.config.trainer.clone())?;
        let scorer = ClusterScorer::new(model_config.subclusters, CLUSTER_SEED, accumulate)?;

        // Only source-domain rows carry the supervised fit signal; target
        // rows join again below as raw reference embeddings.
        let source_rows: Vec<usize> = train
            .source
            .iter()
            .enumerate()
            .filter_map(|(i, &is_source)| is_source.then_some(i))
            .collect();
        if source_rows.is_empty() {
            return Err(TensorError::EmptyInput("source_training_rows"));
        }
        let fit_waveforms = train.fit.waveforms.select_rows(&source_rows)?;
        let fit_labels = train.fit.labels.select_rows(&source_rows)?;
        let fit_weights: Vec<f32> = source_rows.iter().map(|&i| train.fit.weights[i]).collect();
        let source_fit = FitData::new(&fit_waveforms, &fit_labels, &fit_weights)?;

        for member in 0..self.config.size {
            let mut rng = StdRng::seed_from_u64(self.config.base_seed + member as u64);
            let mut model = EmbeddingNet::new(model_config.clone(), &mut rng)?;
            for aeon in 1..=self.config.aeons {
                trainer.fit_or_restore(
                    &mut model,
                    source_fit,
                    validation,
                    aeon,
                    member + 1,
                    &mut rng,
                )?;
            }

            model.set_phase(TrainPhase::Eval);
            let train_embeddings = length_norm(&model.embed(train.fit.waveforms)?)?;
            let train_view = SplitView::new(&train_embeddings, train.class_labels)?;
            let embeddings = splits
                .iter()
                .map(|split| Ok(length_norm(&model.embed(split.waveforms)?)?))
                .collect::<PureResult<Vec<Tensor>>>()?;

            let mut pairs = embeddings
                .iter()
                .zip(splits.iter())
                .zip(scores.iter_mut())
                .map(|((emb, split), tensor)| {
                    Ok((SplitView::new(emb, split.class_labels)?, tensor))
                })
                .collect::<PureResult<Vec<_>>>()?;
            scorer.score_splits(train_view, train.source, &mut pairs, num_classes)?;
            info!(member = member + 1, total = self.config.size, "member scored");
        }
        Ok(scores)
    }
}
