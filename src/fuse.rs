//! Fusion of overlapping window outputs
//!
//! Each window gets a per-position weight profile. Outputs are accumulated per
//! sequence frame and renormalized so the weights covering a frame sum to one.

use burn::prelude::*;

use crate::config::{ContextError, FuseMethod};
use crate::schedule::ContextWindow;

/// Weight profile for one window.
///
/// Pyramid ramps each edge over the overlap shared with the neighbour on that
/// side, from `1 / (overlap + 1)` at the edge up to 1. An edge without a
/// neighbour keeps full weight.
pub fn fuse_weights(method: FuseMethod, len: usize, left_overlap: usize, right_overlap: usize) -> Vec<f32> {
    match method {
        FuseMethod::Flat => vec![1.0; len],
        FuseMethod::Pyramid => (0..len)
            .map(|i| {
                let left = ramp(i, left_overlap);
                let right = ramp(len - 1 - i, right_overlap);
                left.min(right)
            })
            .collect(),
    }
}

fn ramp(distance: usize, overlap: usize) -> f32 {
    if overlap == 0 {
        return 1.0;
    }
    ((distance + 1) as f32 / (overlap + 1) as f32).min(1.0)
}

/// Shared index counts with the previous and next window.
///
/// With `wrap` the first and last windows are neighbours of each other.
pub fn neighbor_overlaps(windows: &[ContextWindow], wrap: bool) -> Vec<(usize, usize)> {
    let count = windows.len();
    (0..count)
        .map(|i| {
            let prev = if i > 0 {
                Some(i - 1)
            } else if wrap && count > 1 {
                Some(count - 1)
            } else {
                None
            };
            let next = if i + 1 < count {
                Some(i + 1)
            } else if wrap && count > 1 {
                Some(0)
            } else {
                None
            };
            let left = prev.map_or(0, |p| windows[i].shared_with(&windows[p]));
            let right = next.map_or(0, |n| windows[i].shared_with(&windows[n]));
            (left, right)
        })
        .collect()
}

/// Weight profiles for every window of a step
pub fn window_weights(windows: &[ContextWindow], method: FuseMethod, wrap: bool) -> Vec<Vec<f32>> {
    windows
        .iter()
        .zip(neighbor_overlaps(windows, wrap))
        .map(|(window, (left, right))| fuse_weights(method, window.len(), left, right))
        .collect()
}

/// Renormalized weight of every window at every frame it covers.
///
/// Returns, per frame, the `(window, weight)` pairs that contribute to it.
pub fn normalized_coverage(
    windows: &[ContextWindow],
    weights: &[Vec<f32>],
    video_length: usize,
) -> Vec<Vec<(usize, f32)>> {
    let mut coverage: Vec<Vec<(usize, f32)>> = vec![Vec::new(); video_length];
    for (w, (window, profile)) in windows.iter().zip(weights).enumerate() {
        for (&index, &weight) in window.indices().iter().zip(profile) {
            coverage[index].push((w, weight));
        }
    }
    for entries in coverage.iter_mut() {
        let total: f32 = entries.iter().map(|(_, weight)| weight).sum();
        if total > 0.0 {
            for (_, weight) in entries.iter_mut() {
                *weight /= total;
            }
        }
    }
    coverage
}

/// Weighted per-frame accumulator along one tensor axis
#[derive(Debug)]
pub struct FrameAccumulator<B: Backend, const D: usize> {
    frame_dim: usize,
    sums: Vec<Option<Tensor<B, D>>>,
    weights: Vec<f32>,
}

impl<B: Backend, const D: usize> FrameAccumulator<B, D> {
    pub fn new(num_frames: usize, frame_dim: usize) -> Self {
        Self {
            frame_dim,
            sums: vec![None; num_frames],
            weights: vec![0.0; num_frames],
        }
    }

    /// Add one window output whose frame axis lines up with `indices`
    pub fn add(&mut self, indices: &[usize], output: Tensor<B, D>, weights: &[f32]) -> Result<(), ContextError> {
        let frames = output.dims()[self.frame_dim];
        if frames != indices.len() {
            return Err(ContextError::LengthMismatch {
                expected: indices.len(),
                actual: frames,
            });
        }

        for (pos, (&index, &weight)) in indices.iter().zip(weights).enumerate() {
            if index >= self.sums.len() {
                return Err(ContextError::LengthMismatch {
                    expected: self.sums.len(),
                    actual: index + 1,
                });
            }
            let frame = output.clone().narrow(self.frame_dim, pos, 1) * weight;
            self.sums[index] = Some(match self.sums[index].take() {
                Some(acc) => acc + frame,
                None => frame,
            });
            self.weights[index] += weight;
        }
        Ok(())
    }

    /// Normalize every frame by its accumulated weight and stitch them back
    pub fn finish(self) -> Result<Tensor<B, D>, ContextError> {
        let frames = self
            .sums
            .into_iter()
            .zip(self.weights)
            .enumerate()
            .map(|(index, (sum, weight))| match sum {
                Some(sum) if weight > 0.0 => Ok(sum / weight),
                _ => Err(ContextError::UncoveredFrame(index)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Tensor::cat(frames, self.frame_dim))
    }
}
