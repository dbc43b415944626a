//! Feature statistics for adaptive instance normalization
//!
//! Statistics are taken per row and channel over the token axis of a
//! `[rows, tokens, channels]` tensor.

use burn::prelude::*;

/// Epsilon added to the variance before taking the square root
pub const ADAIN_EPS: f64 = 1e-6;

/// Per-channel mean and standard deviation over the token axis.
///
/// Both results have shape `[rows, 1, channels]`.
pub fn feature_stats<B: Backend>(x: Tensor<B, 3>, eps: f64) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let mean = x.clone().mean_dim(1);
    let variance = (x - mean.clone()).powf_scalar(2.0).mean_dim(1);
    let std = (variance + eps).sqrt();
    (mean, std)
}

/// Renormalize `x` to the given statistics
pub fn adain_transfer<B: Backend>(
    x: Tensor<B, 3>,
    target_mean: Tensor<B, 3>,
    target_std: Tensor<B, 3>,
    eps: f64,
) -> Tensor<B, 3> {
    let (mean, std) = feature_stats(x.clone(), eps);
    (x - mean) / std * target_std + target_mean
}
