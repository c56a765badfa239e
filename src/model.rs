// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::features::{subtract_temporal_mean, FftMagnitude, MagnitudeSpectrogram};
use crate::head::SubclusterProjection;
use crate::layers::{
    same_padding_1d, same_padding_2d, BatchNorm1d, BatchNorm2d, Conv1d, Conv2d, Linear,
    MaxPool2d, MixupLayer, Relu, SelfSupAugment, Sequential,
};
use crate::module::{Module, Parameter, TrainPhase};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;

/// Pre-activation residual block over channel-major feature maps.
///
/// `h = BN(x); r = Conv(ReLU(BN(Conv(ReLU(h))))); out = r + shortcut(h)`
/// where the shortcut is the identity, or max-pool plus a 1x1 projection when
/// the block halves the spatial extent and changes channel width.
pub struct ResidualBlock {
    bn_in: BatchNorm2d,
    conv1: Conv2d,
    bn_mid: BatchNorm2d,
    conv2: Conv2d,
    shortcut: Option<(MaxPool2d, Conv2d)>,
    relu: Relu,
}

impl ResidualBlock {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        input_hw: (usize, usize),
        downsample: bool,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let name = name.into();
        let bn_in = BatchNorm2d::new(
            format!("{name}::bn_in"),
            in_channels,
            input_hw.0 * input_hw.1,
        )?;
        let stride = if downsample { (2, 2) } else { (1, 1) };
        let pad = same_padding_2d(input_hw, (3, 3), stride);
        let conv1 = Conv2d::new(
            format!("{name}::conv1"),
            in_channels,
            out_channels,
            (3, 3),
            stride,
            pad,
            input_hw,
            rng,
        )?;
        let mid_hw = conv1.output_hw()?;
        let bn_mid =
            BatchNorm2d::new(format!("{name}::bn_mid"), out_channels, mid_hw.0 * mid_hw.1)?;
        let pad = same_padding_2d(mid_hw, (3, 3), (1, 1));
        let conv2 = Conv2d::new(
            format!("{name}::conv2"),
            out_channels,
            out_channels,
            (3, 3),
            (1, 1),
            pad,
            mid_hw,
            rng,
        )?;
        let shortcut = if downsample {
            let pool_pad = same_padding_2d(input_hw, (2, 2), (2, 2));
            let pool = MaxPool2d::new(in_channels, (2, 2), (2, 2), pool_pad, input_hw)?;
            let pooled_hw = pool.output_hw()?;
            if pooled_hw != mid_hw {
                return Err(TensorError::ShapeMismatch {
                    left: pooled_hw,
                    right: mid_hw,
                });
            }
            let project = Conv2d::new(
                format!("{name}::project"),
                in_channels,
                out_channels,
                (1, 1),
                (1, 1),
                (0, 0),
                pooled_hw,
                rng,
            )?;
            Some((pool, project))
        } else {
            if in_channels != out_channels {
                return Err(TensorError::ShapeMismatch {
                    left: (in_channels, 0),
                    right: (out_channels, 0),
                });
            }
            None
        };
        Ok(Self {
            bn_in,
            conv1,
            bn_mid,
            conv2,
            shortcut,
            relu: Relu::new(),
        })
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.conv2.output_hw()
    }
}

impl Module for ResidualBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let h = self.bn_in.forward(input)?;
        let a = self.relu.forward(&h)?;
        let b = self.conv1.forward(&a)?;
        let c = self.bn_mid.forward(&b)?;
        let d = self.relu.forward(&c)?;
        let branch = self.conv2.forward(&d)?;
        let shortcut = match &self.shortcut {
            Some((pool, project)) => project.forward(&pool.forward(&h)?)?,
            None => h,
        };
        let mut out = branch;
        out.add_scaled(&shortcut, 1.0)?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        // Rebuild the forward activations; the pool also refreshes its argmax
        // cache before the gradient is routed through it.
        let h = self.bn_in.forward(input)?;
        let a = self.relu.forward(&h)?;
        let b = self.conv1.forward(&a)?;
        let c = self.bn_mid.forward(&b)?;
        let d = self.relu.forward(&c)?;

        let grad_d = self.conv2.backward(&d, grad_output)?;
        let grad_c = self.relu.backward(&c, &grad_d)?;
        let grad_b = self.bn_mid.backward(&b, &grad_c)?;
        let grad_a = self.conv1.backward(&a, &grad_b)?;
        let mut grad_h = self.relu.backward(&h, &grad_a)?;

        match &mut self.shortcut {
            Some((pool, project)) => {
                let pooled = pool.forward(&h)?;
                let grad_pooled = project.backward(&pooled, grad_output)?;
                let grad_short = pool.backward(&h, &grad_pooled)?;
                grad_h.add_scaled(&grad_short, 1.0)?;
            }
            None => {
                grad_h.add_scaled(grad_output, 1.0)?;
            }
        }
        self.bn_in.backward(input, &grad_h)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn_in.visit_parameters(visitor)?;
        self.conv1.visit_parameters(visitor)?;
        self.bn_mid.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        if let Some((_, project)) = &self.shortcut {
            project.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn_in.visit_parameters_mut(visitor)?;
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn_mid.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        if let Some((_, project)) = &mut self.shortcut {
            project.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_phase(&self, phase: TrainPhase) {
        self.bn_in.set_phase(phase);
        self.bn_mid.set_phase(phase);
    }
}

/// Dimensions and probabilities of the dual-branch embedding network. The
/// defaults mirror the full-size pipeline; tests shrink the waveform and
/// channel widths.
#[derive(Debug, Clone)]
pub struct EmbeddingNetConfig {
    pub waveform_len: usize,
    pub fft_bins: usize,
    pub fft_size: usize,
    pub hop_size: usize,
    pub fft_conv_channels: usize,
    pub fft_dense_units: usize,
    pub stem_channels: usize,
    pub branch_dim: usize,
    pub num_classes: usize,
    pub subclusters: usize,
    pub mixup_prob: f32,
    pub augment_prob: f32,
}

impl EmbeddingNetConfig {
    pub fn new(num_classes: usize) -> Self {
        Self {
            waveform_len: 192_000,
            fft_bins: 8_000,
            fft_size: 1_024,
            hop_size: 512,
            fft_conv_channels: 128,
            fft_dense_units: 128,
            stem_channels: 16,
            branch_dim: 256,
            num_classes,
            subclusters: 32,
            mixup_prob: 0.5,
            augment_prob: 0.5,
        }
    }

    /// Dimension of the concatenated embedding.
    pub fn embedding_dim(&self) -> usize {
        2 * self.branch_dim
    }
}

/// Dual-branch embedding network.
///
/// One branch consumes the truncated full-signal magnitude spectrum through
/// strided 1-D convolutions and dense blocks; the other consumes the
/// normalised magnitude spectrogram through a residual 2-D stack. Both
/// project to `branch_dim` and concatenate (spectrum first) into the final
/// embedding. Training couples the embedding to two fixed sub-cluster
/// projection heads, one on the mixed labels and one on the widened
/// self-supervised labels.
pub struct EmbeddingNet {
    config: EmbeddingNetConfig,
    fft_feature: FftMagnitude,
    spec_feature: MagnitudeSpectrogram,
    fft_branch: Sequential,
    spec_branch: Sequential,
    mixup: MixupLayer,
    augment: SelfSupAugment,
    head_main: SubclusterProjection,
    head_aux: SubclusterProjection,
}

impl EmbeddingNet {
    pub fn new(config: EmbeddingNetConfig, rng: &mut StdRng) -> PureResult<Self> {
        let fft_feature = FftMagnitude::new(config.fft_bins, config.waveform_len)?;
        let spec_feature =
            MagnitudeSpectrogram::new(config.fft_size, config.hop_size, config.waveform_len)?;
        let fft_branch = Self::build_fft_branch(&config, rng)?;
        let spec_branch = Self::build_spec_branch(&config, &spec_feature, rng)?;
        let mixup = MixupLayer::new(config.mixup_prob)?;
        let augment = SelfSupAugment::new(config.augment_prob)?;
        let head_main = SubclusterProjection::new(
            "head::main",
            config.num_classes,
            config.subclusters,
            config.embedding_dim(),
            rng,
        )?;
        let head_aux = SubclusterProjection::new(
            "head::aux",
            config.num_classes * 3,
            config.subclusters,
            config.embedding_dim(),
            rng,
        )?;
        Ok(Self {
            config,
            fft_feature,
            spec_feature,
            fft_branch,
            spec_branch,
            mixup,
            augment,
            head_main,
            head_aux,
        })
    }

    pub fn config(&self) -> &EmbeddingNetConfig {
        &self.config
    }

    fn build_fft_branch(config: &EmbeddingNetConfig, rng: &mut StdRng) -> PureResult<Sequential> {
        let mut seq = Sequential::new();
        let mut width = config.fft_bins;
        let mut in_channels = 1;
        for (index, (kernel, stride)) in [(256, 64), (64, 32), (16, 4)].into_iter().enumerate() {
            let pad = same_padding_1d(width, kernel, stride);
            seq.push(Conv1d::new(
                format!("fft::conv{index}"),
                in_channels,
                config.fft_conv_channels,
                kernel,
                stride,
                pad,
                rng,
            )?);
            seq.push(Relu::new());
            width = width.div_ceil(stride);
            in_channels = config.fft_conv_channels;
        }

        let mut dim = config.fft_conv_channels * width;
        for index in 0..4 {
            seq.push(Linear::new(
                format!("fft::dense{index}"),
                dim,
                config.fft_dense_units,
                rng,
            )?);
            seq.push(BatchNorm1d::new(
                format!("fft::bn{index}"),
                config.fft_dense_units,
            )?);
            seq.push(Relu::new());
            dim = config.fft_dense_units;
        }
        seq.push(Linear::new("fft::proj", dim, config.branch_dim, rng)?);
        Ok(seq)
    }

    fn build_spec_branch(
        config: &EmbeddingNetConfig,
        spec_feature: &MagnitudeSpectrogram,
        rng: &mut StdRng,
    ) -> PureResult<Sequential> {
        let freq = spec_feature.freq_bins();
        let frames = spec_feature.frames();
        let stem = config.stem_channels;

        let mut seq = Sequential::new();
        // Per-frequency normalisation: every bin behaves like a channel.
        seq.push(BatchNorm2d::new("spec::freq_norm", freq, frames)?);

        let mut hw = (freq, frames);
        let pad = same_padding_2d(hw, (7, 7), (2, 2));
        seq.push(Conv2d::new(
            "spec::stem",
            1,
            stem,
            (7, 7),
            (2, 2),
            pad,
            hw,
            rng,
        )?);
        hw = (hw.0.div_ceil(2), hw.1.div_ceil(2));
        seq.push(BatchNorm2d::new("spec::stem_bn", stem, hw.0 * hw.1)?);
        seq.push(Relu::new());
        let pool = MaxPool2d::new(stem, (3, 3), (2, 2), (0, 0), hw)?;
        hw = pool.output_hw()?;
        seq.push(pool);

        let mut in_channels = stem;
        for (stage, out_channels) in
            [stem, stem * 2, stem * 4, stem * 8].into_iter().enumerate()
        {
            let downsample = stage > 0;
            let first = ResidualBlock::new(
                format!("spec::stage{stage}a"),
                in_channels,
                out_channels,
                hw,
                downsample,
                rng,
            )?;
            hw = first.output_hw()?;
            seq.push(first);
            seq.push(ResidualBlock::new(
                format!("spec::stage{stage}b"),
                out_channels,
                out_channels,
                hw,
                false,
                rng,
            )?);
            in_channels = out_channels;
        }

        // Collapse the remaining time axis; frequency positions survive.
        let pool_pad = same_padding_2d(hw, (1, 18), (1, 18));
        let pool = MaxPool2d::new(in_channels, (1, 18), (1, 18), pool_pad, hw)?;
        hw = pool.output_hw()?;
        seq.push(pool);

        let flat = in_channels * hw.0 * hw.1;
        seq.push(BatchNorm1d::new("spec::flat_bn", flat)?);
        seq.push(Linear::new("spec::proj", flat, config.branch_dim, rng)?);
        Ok(seq)
    }

    fn extract_features(&self, waveforms: &Tensor) -> PureResult<(Tensor, Tensor)> {
        let fft = self.fft_feature.extract(waveforms)?;
        let spec = self.spec_feature.extract(waveforms)?;
        let spec = subtract_temporal_mean(
            &spec,
            self.spec_feature.freq_bins(),
            self.spec_feature.frames(),
        )?;
        Ok((fft, spec))
    }

    /// Concatenated embedding for a batch of raw waveforms, using the current
    /// phase of the batch-norm layers.
    pub fn embed(&self, waveforms: &Tensor) -> PureResult<Tensor> {
        let (fft_feat, spec_feat) = self.extract_features(waveforms)?;
        let emb_fft = self.fft_branch.forward(&fft_feat)?;
        let emb_spec = self.spec_branch.forward(&spec_feat)?;
        Tensor::cat_cols(&emb_fft, &emb_spec)
    }

    /// One optimisation-ready pass: mixup, feature extraction, both branches,
    /// both heads, and gradient accumulation into every branch parameter.
    /// Returns the summed main and auxiliary losses.
    pub fn train_step(
        &mut self,
        waveforms: &Tensor,
        labels: &Tensor,
        weights: &[f32],
        rng: &mut StdRng,
    ) -> PureResult<f32> {
        if labels.shape() != (waveforms.shape().0, self.config.num_classes) {
            return Err(TensorError::ShapeMismatch {
                left: labels.shape(),
                right: (waveforms.shape().0, self.config.num_classes),
            });
        }
        self.set_phase(TrainPhase::Train);

        let (mixed, mixed_labels) =
            self.mixup.apply(waveforms, labels, TrainPhase::Train, rng)?;
        let (fft_feat, spec_feat) = self.extract_features(&mixed)?;
        let emb_fft = self.fft_branch.forward(&fft_feat)?;
        let emb_spec = self.spec_branch.forward(&spec_feat)?;

        let (spec_ssl, fft_ssl, ssl_labels) =
            self.augment
                .apply(&emb_spec, &emb_fft, &mixed_labels, TrainPhase::Train, rng)?;

        let main_embedding = Tensor::cat_cols(&emb_fft, &emb_spec)?;
        let ssl_embedding = Tensor::cat_cols(&fft_ssl, &spec_ssl)?;

        let (main_loss, main_grad) =
            self.head_main
                .loss_and_grad(&main_embedding, &mixed_labels, weights)?;
        let (ssl_loss, ssl_grad) =
            self.head_aux
                .loss_and_grad(&ssl_embedding, &ssl_labels, weights)?;

        let dim = self.config.branch_dim;
        let mut grad_fft = main_grad.slice_cols(0, dim)?;
        let mut grad_spec = main_grad.slice_cols(dim, 2 * dim)?;

        // Auxiliary gradients: the spectrogram half is un-shuffled first.
        let ssl_grad_fft = ssl_grad.slice_cols(0, dim)?;
        let ssl_grad_spec = self.augment.backward(&ssl_grad.slice_cols(dim, 2 * dim)?)?;
        grad_fft.add_scaled(&ssl_grad_fft, 1.0)?;
        grad_spec.add_scaled(&ssl_grad_spec, 1.0)?;

        self.fft_branch.backward(&fft_feat, &grad_fft)?;
        self.spec_branch.backward(&spec_feat, &grad_spec)?;
        Ok(main_loss + ssl_loss)
    }

    /// Loss over a held-out batch with evaluation-phase statistics. No
    /// gradients are accumulated.
    pub fn validation_loss(
        &self,
        waveforms: &Tensor,
        labels: &Tensor,
        weights: &[f32],
        rng: &mut StdRng,
    ) -> PureResult<f32> {
        self.set_phase(TrainPhase::Eval);
        let (fft_feat, spec_feat) = self.extract_features(waveforms)?;
        let emb_fft = self.fft_branch.forward(&fft_feat)?;
        let emb_spec = self.spec_branch.forward(&spec_feat)?;
        let (spec_ssl, fft_ssl, ssl_labels) =
            self.augment
                .apply(&emb_spec, &emb_fft, labels, TrainPhase::Eval, rng)?;

        let main_embedding = Tensor::cat_cols(&emb_fft, &emb_spec)?;
        let ssl_embedding = Tensor::cat_cols(&fft_ssl, &spec_ssl)?;
        let (main_loss, _) = self
            .head_main
            .loss_and_grad(&main_embedding, labels, weights)?;
        let (ssl_loss, _) = self
            .head_aux
            .loss_and_grad(&ssl_embedding, &ssl_labels, weights)?;
        Ok(main_loss + ssl_loss)
    }
}

impl Module for EmbeddingNet {
    fn forward(&self, waveforms: &Tensor) -> PureResult<Tensor> {
        self.embed(waveforms)
    }

    /// Raw waveforms are leaves of the computation; gradients stop at the
    /// feature extractors inside [`EmbeddingNet::train_step`].
    fn backward(&mut self, _input: &Tensor, _grad_output: &Tensor) -> PureResult<Tensor> {
        Err(TensorError::InvalidValue {
            label: "waveform_gradient",
        })
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.fft_branch.visit_parameters(visitor)?;
        self.spec_branch.visit_parameters(visitor)?;
        self.head_main.visit_parameters(visitor)?;
        self.head_aux.visit_parameters(visitor)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.fft_branch.visit_parameters_mut(visitor)?;
        self.spec_branch.visit_parameters_mut(visitor)?;
        self.head_main.visit_parameters_mut(visitor)?;
        self.head_aux.visit_parameters_mut(visitor)?;
        Ok(())
    }

    fn set_phase(&self, phase: TrainPhase) {
        self.fft_branch.set_phase(phase);
        self.spec_branch.set_phase(phase);
    }
}
