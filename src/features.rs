// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const ZERO_GUARD: f32 = 1e-16;

/// Magnitude of the full discrete Fourier transform, truncated to a fixed
/// prefix of frequency bins. The whole waveform transforms at once; no
/// framing or windowing is involved.
///
/// Waveform length is fixed at construction so a too-short signal is rejected
/// before any training starts.
pub struct FftMagnitude {
    bins: usize,
    waveform_len: usize,
    plan: Arc<dyn Fft<f32>>,
}

impl core::fmt::Debug for FftMagnitude {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FftMagnitude(bins={},waveform_len={})",
            self.bins, self.waveform_len
        )
    }
}

impl FftMagnitude {
    pub fn new(bins: usize, waveform_len: usize) -> PureResult<Self> {
        if bins == 0 || waveform_len == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: bins,
                cols: waveform_len,
            });
        }
        if waveform_len < bins {
            return Err(TensorError::InvalidDimensions {
                rows: waveform_len,
                cols: bins,
            });
        }
        let plan = FftPlanner::new().plan_fft_forward(waveform_len);
        Ok(Self {
            bins,
            waveform_len,
            plan,
        })
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Transforms `(batch, waveform_len)` waveforms into `(batch, bins)`
    /// magnitude prefixes.
    pub fn extract(&self, waveforms: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = waveforms.shape();
        if cols != self.waveform_len {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.waveform_len),
            });
        }
        let mut out = Tensor::zeros(batch, self.bins)?;
        let mut buffer = vec![Complex32::new(0.0, 0.0); self.waveform_len];
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = waveforms.row(b)?;
                for (slot, value) in buffer.iter_mut().zip(row.iter()) {
                    *slot = Complex32::new(*value, 0.0);
                }
                self.plan.process(&mut buffer);
                for (f, slot) in out_data[b * self.bins..(b + 1) * self.bins]
                    .iter_mut()
                    .enumerate()
                {
                    *slot = buffer[f].norm();
                }
            }
        }
        Ok(out)
    }
}

/// Short-time magnitude spectrogram with a rectangular window and no
/// end-padding. Output rows are frequency-major: bin `f` occupies the
/// contiguous block `[f * frames, (f + 1) * frames)`, which lets downstream
/// layers treat frequency bins as channels.
pub struct MagnitudeSpectrogram {
    fft_size: usize,
    hop_size: usize,
    waveform_len: usize,
    plan: Arc<dyn Fft<f32>>,
}

impl core::fmt::Debug for MagnitudeSpectrogram {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "MagnitudeSpectrogram(fft_size={},hop_size={},waveform_len={})",
            self.fft_size, self.hop_size, self.waveform_len
        )
    }
}

impl MagnitudeSpectrogram {
    pub fn new(fft_size: usize, hop_size: usize, waveform_len: usize) -> PureResult<Self> {
        if fft_size == 0 || hop_size == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: fft_size,
                cols: hop_size,
            });
        }
        if waveform_len < fft_size {
            return Err(TensorError::InvalidDimensions {
                rows: waveform_len,
                cols: fft_size,
            });
        }
        let plan = FftPlanner::new().plan_fft_forward(fft_size);
        Ok(Self {
            fft_size,
            hop_size,
            waveform_len,
            plan,
        })
    }

    pub fn freq_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn frames(&self) -> usize {
        (self.waveform_len - self.fft_size) / self.hop_size + 1
    }

    /// Transforms `(batch, waveform_len)` waveforms into
    /// `(batch, freq_bins * frames)` frequency-major magnitudes.
    pub fn extract(&self, waveforms: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = waveforms.shape();
        if cols != self.waveform_len {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, self.waveform_len),
            });
        }
        let freq_bins = self.freq_bins();
        let frames = self.frames();
        let mut out = Tensor::zeros(batch, freq_bins * frames)?;
        let mut buffer = vec![Complex32::new(0.0, 0.0); self.fft_size];
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = waveforms.row(b)?;
                let out_row = &mut out_data[b * freq_bins * frames..(b + 1) * freq_bins * frames];
                for t in 0..frames {
                    let start = t * self.hop_size;
                    for (slot, value) in buffer
                        .iter_mut()
                        .zip(row[start..start + self.fft_size].iter())
                    {
                        *slot = Complex32::new(*value, 0.0);
                    }
                    self.plan.process(&mut buffer);
                    for f in 0..freq_bins {
                        out_row[f * frames + t] = buffer[f].norm();
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Subtracts, per frequency bin, the mean over time computed while skipping
/// exact-zero time steps. Zero steps come from zero-padded waveforms and
/// would otherwise drag the mean down. The subtraction itself applies to
/// every time step, zeros included.
pub fn subtract_temporal_mean(
    spectrogram: &Tensor,
    freq_bins: usize,
    frames: usize,
) -> PureResult<Tensor> {
    let (batch, cols) = spectrogram.shape();
    if cols != freq_bins * frames {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, freq_bins * frames),
        });
    }
    let mut out = spectrogram.clone();
    {
        let data = out.data_mut();
        for b in 0..batch {
            let row = &mut data[b * cols..(b + 1) * cols];
            for f in 0..freq_bins {
                let bin = &mut row[f * frames..(f + 1) * frames];
                let mut sum = 0.0f32;
                let mut count = 0.0f32;
                for value in bin.iter() {
                    if *value > 0.0 {
                        sum += value;
                        count += 1.0;
                    }
                }
                let mean = sum / (count + ZERO_GUARD);
                for value in bin.iter_mut() {
                    *value -= mean;
                }
            }
        }
    }
    Ok(out)
}
