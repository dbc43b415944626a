//! Tensor kernels for reference-frame conditioning

pub mod attention;
pub mod normalization;

pub use attention::{joint_attention, scaled_attention};
pub use normalization::{adain_transfer, feature_stats, ADAIN_EPS};

use burn::prelude::*;

/// `from + (to - from) * weight`, with `weight` broadcast over `from`
pub fn lerp<B: Backend, const D: usize>(from: Tensor<B, D>, to: Tensor<B, D>, weight: Tensor<B, D>) -> Tensor<B, D> {
    from.clone() + (to - from) * weight
}
