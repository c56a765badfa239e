// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Anomalous-sound detection for machine condition monitoring.
//!
//! The pipeline embeds raw recordings with a dual-branch convolutional
//! network trained on auxiliary classification targets, then scores each
//! clip by its cosine distance to per-class reference prototypes. Training,
//! clustering and evaluation are all seeded and reproducible.

pub mod dataset;
pub mod ensemble;
pub mod features;
pub mod head;
pub mod io;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod module;
pub mod optim;
pub mod resolver;
pub mod scoring;
pub mod submission;
pub mod tensor;
pub mod trainer;

pub use module::{Module, Parameter, TrainPhase};
pub use tensor::{PureResult, Tensor, TensorError};
