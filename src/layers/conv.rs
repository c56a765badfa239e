// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use std::cell::RefCell;

fn validate_positive(value: usize, _label: &str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

/// Padding that keeps `out = ceil(width / stride)` for the given kernel,
/// matching the "same" convolution convention.
pub fn same_padding_1d(width: usize, kernel: usize, stride: usize) -> usize {
    let out = width.div_ceil(stride);
    ((out - 1) * stride + kernel).saturating_sub(width).div_ceil(2)
}

/// Two-dimensional "same" padding, per axis.
pub fn same_padding_2d(
    input_hw: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
) -> (usize, usize) {
    (
        same_padding_1d(input_hw.0, kernel.0, stride.0),
        same_padding_1d(input_hw.1, kernel.1, stride.1),
    )
}

fn glorot_weight(
    out_channels: usize,
    span: usize,
    rng: &mut StdRng,
) -> PureResult<Tensor> {
    let limit = (6.0 / (out_channels + span) as f32).sqrt();
    Tensor::random_uniform(out_channels, span, -limit, limit, rng)
}

/// One-dimensional convolution over `(batch, channels * width)` tensors with
/// channel-major flattening.
#[derive(Debug)]
pub struct Conv1d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl Conv1d {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel_size, "kernel_size")?;
        validate_positive(stride, "stride")?;
        let name = name.into();
        let span = in_channels * kernel_size;
        let weight = glorot_weight(out_channels, span, rng)?;
        let bias = Tensor::zeros(1, out_channels)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        })
    }

    fn infer_width(&self, cols: usize) -> PureResult<usize> {
        if cols % self.in_channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.in_channels),
            });
        }
        Ok(cols / self.in_channels)
    }

    fn output_width(&self, input_width: usize) -> PureResult<usize> {
        let numer = input_width + 2 * self.padding;
        if numer < self.kernel_size {
            return Err(TensorError::InvalidDimensions {
                rows: input_width,
                cols: self.kernel_size,
            });
        }
        Ok((numer - self.kernel_size) / self.stride + 1)
    }
}

impl Module for Conv1d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let width = self.infer_width(cols)?;
        let out_width = self.output_width(width)?;
        let mut out = Tensor::zeros(batch, self.out_channels * out_width)?;
        let span = self.in_channels * self.kernel_size;
        let weight_data = self.weight.value().data().to_vec();
        let bias_data = self.bias.value().data().to_vec();
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for oc in 0..self.out_channels {
                    let weight_row = &weight_data[oc * span..(oc + 1) * span];
                    for ow in 0..out_width {
                        let mut acc = bias_data[oc];
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * width;
                            for k in 0..self.kernel_size {
                                let pos = ow * self.stride + k;
                                if pos < self.padding {
                                    continue;
                                }
                                let idx = pos - self.padding;
                                if idx >= width {
                                    continue;
                                }
                                acc += row[channel_offset + idx]
                                    * weight_row[ic * self.kernel_size + k];
                            }
                        }
                        out_row[oc * out_width + ow] = acc;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let width = self.infer_width(cols)?;
        let out_width = self.output_width(width)?;
        if grad_output.shape() != (batch, self.out_channels * out_width) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * out_width),
            });
        }
        let span = self.in_channels * self.kernel_size;
        let mut grad_weight = Tensor::zeros(self.out_channels, span)?;
        let mut grad_bias = vec![0.0f32; self.out_channels];
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let weight_data = self.weight.value().data().to_vec();
        let grad_out_cols = grad_output.shape().1;
        {
            let grad_weight_data = grad_weight.data_mut();
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let grad_row = &grad_output.data()[b * grad_out_cols..(b + 1) * grad_out_cols];
                let grad_in_row = &mut grad_input_data[b * cols..(b + 1) * cols];
                for oc in 0..self.out_channels {
                    let weight_row = &weight_data[oc * span..(oc + 1) * span];
                    for ow in 0..out_width {
                        let go = grad_row[oc * out_width + ow];
                        grad_bias[oc] += go;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * width;
                            for k in 0..self.kernel_size {
                                let pos = ow * self.stride + k;
                                if pos < self.padding {
                                    continue;
                                }
                                let idx = pos - self.padding;
                                if idx >= width {
                                    continue;
                                }
                                let weight_idx = ic * self.kernel_size + k;
                                grad_weight_data[oc * span + weight_idx] +=
                                    go * row[channel_offset + idx];
                                grad_in_row[channel_offset + idx] +=
                                    go * weight_row[weight_idx];
                            }
                        }
                    }
                }
            }
        }
        let inv_batch = 1.0 / batch as f32;
        let grad_weight = grad_weight.scale(inv_batch)?;
        let grad_bias = Tensor::from_vec(1, self.out_channels, grad_bias)?.scale(inv_batch)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
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

/// Two-dimensional convolution over `(batch, channels * height * width)`
/// tensors, evaluated as im2col followed by a dense contraction.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let weight = glorot_weight(out_channels, span, rng)?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Shape errors should surface at construction, not at inference.
        conv.output_hw()?;
        Ok(conv)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let offset = row_index * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    column_data[offset + col_idx] = if idx_h < 0
                                        || idx_w < 0
                                        || idx_h >= h as isize
                                        || idx_w >= w as isize
                                    {
                                        0.0
                                    } else {
                                        row[channel_offset
                                            + idx_h as usize * w
                                            + idx_w as usize]
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        if cols.shape() != (batch * oh * ow, kernel_elems) {
            return Err(TensorError::ShapeMismatch {
                left: cols.shape(),
                right: (batch * oh * ow, kernel_elems),
            });
        }
        let mut output =
            Tensor::zeros(batch, self.in_channels * self.input_hw.0 * self.input_hw.1)?;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let output_cols = output.shape().1;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        grad_in_row[channel_offset
                                            + idx_h as usize * w
                                            + idx_w as usize] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// Rearranges `(batch * oh * ow, out_channels)` GEMM output into the
    /// channel-major `(batch, out_channels * oh * ow)` layout.
    fn scatter_channels(
        &self,
        gemm: &Tensor,
        batch: usize,
        oh: usize,
        ow: usize,
    ) -> PureResult<Tensor> {
        let spatial = oh * ow;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let bias_data = self.bias.value().data().to_vec();
        let out_cols = out.shape().1;
        {
            let gemm_data = gemm.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for pos in 0..spatial {
                    let gemm_row = &gemm_data
                        [(b * spatial + pos) * self.out_channels..][..self.out_channels];
                    for oc in 0..self.out_channels {
                        out_row[oc * spatial + pos] = gemm_row[oc] + bias_data[oc];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Inverse of [`Conv2d::scatter_channels`] for the incoming gradient.
    fn gather_channels(
        &self,
        grad_output: &Tensor,
        batch: usize,
        oh: usize,
        ow: usize,
    ) -> PureResult<Tensor> {
        let spatial = oh * ow;
        let mut matrix = Tensor::zeros(batch * spatial, self.out_channels)?;
        let grad_cols = grad_output.shape().1;
        {
            let grad_data = grad_output.data();
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
                for pos in 0..spatial {
                    let offset = (b * spatial + pos) * self.out_channels;
                    for oc in 0..self.out_channels {
                        matrix_data[offset + oc] = grad_row[oc * spatial + pos];
                    }
                }
            }
        }
        Ok(matrix)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let expected_cols = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected_cols {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, expected_cols),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        let gemm = patches.matmul(&self.weight.value().transpose())?;
        self.scatter_channels(&gemm, batch, oh, ow)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let expected_cols = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected_cols {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, expected_cols),
            });
        }
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = self.gather_channels(grad_output, batch, oh, ow)?;
        let grad_weight = grad_matrix
            .transpose()
            .matmul(&patches)?
            .scale(1.0 / batch as f32)?;
        let bias_sums = grad_matrix.sum_axis0();
        let grad_bias =
            Tensor::from_vec(1, self.out_channels, bias_sums)?.scale(1.0 / batch as f32)?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        let grad_input = self.col2im(&grad_patches, batch, oh, ow)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
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

/// Max pooling over 2D feature maps with cached argmax indices.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
    last_indices: RefCell<Vec<usize>>,
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        Ok(Self {
            channels,
            kernel,
            stride,
            padding,
            input_hw,
            last_indices: RefCell::new(Vec::new()),
        })
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let expected = self.channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, expected),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let mut indices = self.last_indices.borrow_mut();
        indices.clear();
        indices.resize(batch * self.channels * oh * ow, 0);
        let (h, w) = self.input_hw;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut best = f32::MIN;
                            let mut best_idx = channel_offset;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let pos_h = oh_idx * self.stride.0 + kh;
                                    let pos_w = ow_idx * self.stride.1 + kw;
                                    if pos_h < self.padding.0 || pos_w < self.padding.1 {
                                        continue;
                                    }
                                    let idx_h = pos_h - self.padding.0;
                                    let idx_w = pos_w - self.padding.1;
                                    if idx_h >= h || idx_w >= w {
                                        continue;
                                    }
                                    let index = channel_offset + idx_h * w + idx_w;
                                    if row[index] > best {
                                        best = row[index];
                                        best_idx = index;
                                    }
                                }
                            }
                            let out_index = c * (oh * ow) + oh_idx * ow + ow_idx;
                            out_row[out_index] = best;
                            indices[b * self.channels * oh * ow + out_index] = best_idx;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        let (oh, ow) = self.output_hw()?;
        if cols != self.channels * oh * ow {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * oh * ow),
            });
        }
        let mut grad_input =
            Tensor::zeros(batch, self.channels * self.input_hw.0 * self.input_hw.1)?;
        let indices = self.last_indices.borrow();
        let grad_input_cols = grad_input.shape().1;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row =
                    &mut grad_input_data[b * grad_input_cols..(b + 1) * grad_input_cols];
                for idx in 0..cols {
                    grad_in_row[indices[b * cols + idx]] += grad_row[idx];
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
