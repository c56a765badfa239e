// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by tensor arithmetic and the pipeline stages built on it.
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("invalid tensor dimensions rows={rows} cols={cols}")]
    InvalidDimensions { rows: usize, cols: usize },
    #[error("tensor data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    #[error("tensor shape mismatch: left={left:?} right={right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    #[error("missing parameter {name}")]
    MissingParameter { name: String },
    #[error("io failure: {message}")]
    IoError { message: String },
    #[error("serialization failure: {message}")]
    SerializationError { message: String },
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    #[error("non-finite value for {label}: {value}")]
    NonFiniteValue { label: &'static str, value: f32 },
    #[error("degenerate metric input: {label}")]
    DegenerateMetric { label: &'static str },
    #[error("unknown label {label}")]
    UnknownLabel { label: String },
    #[error("invalid stage {stage}")]
    InvalidStage { stage: String },
}

/// Convenience alias used across the crate.
pub type PureResult<T> = Result<T, TensorError>;

/// A simple 2-D row-major tensor of `f32` values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Creates a tensor from raw data. The vector must hold `rows * cols` values.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Constructs a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Ok(Self { rows, cols, data })
    }

    /// Samples a uniform distribution in `[min, max)` using the provided RNG so
    /// initialisation stays reproducible per ensemble iteration.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(rng.gen_range(min..max));
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Immutable view of the underlying buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the underlying buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrows a single row.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::InvalidDimensions {
                rows: index,
                cols: self.rows,
            });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    /// Dense matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut out = vec![0.0f32; self.rows * other.cols];
        for r in 0..self.rows {
            let lhs_row = &self.data[r * self.cols..(r + 1) * self.cols];
            let out_row = &mut out[r * other.cols..(r + 1) * other.cols];
            for (k, &lhs) in lhs_row.iter().enumerate() {
                if lhs == 0.0 {
                    continue;
                }
                let rhs_row = &other.data[k * other.cols..(k + 1) * other.cols];
                for (o, &rhs) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *o += lhs * rhs;
                }
            }
        }
        Tensor::from_vec(self.rows, other.cols, out)
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.rows * self.cols];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Returns a copy scaled by `factor`.
    pub fn scale(&self, factor: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|v| v * factor).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Adds `other * factor` in place.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (lhs, rhs) in self.data.iter_mut().zip(other.data.iter()) {
            *lhs += rhs * factor;
        }
        Ok(())
    }

    /// Adds a row vector to every row of the tensor.
    pub fn add_row_inplace(&mut self, row: &[f32]) -> PureResult<()> {
        if row.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: row.len(),
            });
        }
        for chunk in self.data.chunks_exact_mut(self.cols) {
            for (value, add) in chunk.iter_mut().zip(row.iter()) {
                *value += add;
            }
        }
        Ok(())
    }

    /// Column sums over the batch dimension.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for chunk in self.data.chunks_exact(self.cols) {
            for (sum, value) in sums.iter_mut().zip(chunk.iter()) {
                *sum += value;
            }
        }
        sums
    }

    /// Stacks tensors along the row axis.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let first = tensors.first().ok_or(TensorError::EmptyInput("cat_rows"))?;
        let cols = first.cols;
        let mut data = Vec::new();
        let mut rows = 0;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            rows += tensor.rows;
            data.extend_from_slice(&tensor.data);
        }
        Tensor::from_vec(rows, cols, data)
    }

    /// Concatenates two tensors along the column axis.
    pub fn cat_cols(left: &Tensor, right: &Tensor) -> PureResult<Tensor> {
        if left.rows != right.rows {
            return Err(TensorError::ShapeMismatch {
                left: left.shape(),
                right: right.shape(),
            });
        }
        let cols = left.cols + right.cols;
        let mut data = Vec::with_capacity(left.rows * cols);
        for r in 0..left.rows {
            data.extend_from_slice(&left.data[r * left.cols..(r + 1) * left.cols]);
            data.extend_from_slice(&right.data[r * right.cols..(r + 1) * right.cols]);
        }
        Tensor::from_vec(left.rows, cols, data)
    }

    /// Copies the columns in `start..end` into a new tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::InvalidDimensions {
                rows: start,
                cols: end,
            });
        }
        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            data.extend_from_slice(&self.data[r * self.cols + start..r * self.cols + end]);
        }
        Tensor::from_vec(self.rows, width, data)
    }

    /// Gathers the listed rows into a new tensor, in order.
    pub fn select_rows(&self, indices: &[usize]) -> PureResult<Tensor> {
        if indices.is_empty() {
            return Err(TensorError::EmptyInput("select_rows"));
        }
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &index in indices {
            data.extend_from_slice(self.row(index)?);
        }
        Tensor::from_vec(indices.len(), self.cols, data)
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows * cols != self.rows * self.cols {
            return Err(TensorError::DataLength {
                expected: self.rows * self.cols,
                got: rows * cols,
            });
        }
        Tensor::from_vec(rows, cols, self.data.clone())
    }

    /// Sum of squared elements.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}
