// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod augment;
pub mod conv;
pub mod linear;
pub mod mixup;
pub mod normalization;
pub mod sequential;

pub use activation::Relu;
pub use augment::SelfSupAugment;
pub use conv::{same_padding_1d, same_padding_2d, Conv1d, Conv2d, MaxPool2d};
pub use linear::Linear;
pub use mixup::MixupLayer;
pub use normalization::{BatchNorm1d, BatchNorm2d};
pub use sequential::Sequential;
