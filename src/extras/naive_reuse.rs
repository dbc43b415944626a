//! Naive reuse of the first window output
//!
//! The first model call of a step becomes the reference for every later window
//! of that step, which damps flicker between windows that are otherwise
//! sampled independently.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::{in_interval, strength_at, Strength};
use crate::config::{check_fraction, ContextError};

/// Naive reuse settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveReuse {
    pub start_percent: f32,
    pub end_percent: f32,
    /// Blend weight of the carried reference
    pub weighted_mean: f32,
    /// Per-frame scale of `weighted_mean`
    pub strength: Option<Strength>,
}

impl Default for NaiveReuse {
    fn default() -> Self {
        Self {
            start_percent: 0.0,
            end_percent: 0.15,
            weighted_mean: 0.95,
            strength: None,
        }
    }
}

impl NaiveReuse {
    pub fn new(start_percent: f32, end_percent: f32, weighted_mean: f32) -> Self {
        Self {
            start_percent,
            end_percent,
            weighted_mean,
            strength: None,
        }
    }

    pub fn with_strength(mut self, strength: Strength) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn is_active(&self, percent: f32) -> bool {
        in_interval(self.start_percent, self.end_percent, percent)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        check_fraction("start_percent", self.start_percent)?;
        check_fraction("end_percent", self.end_percent)?;
        check_fraction("weighted_mean", self.weighted_mean)?;
        self.strength.as_ref().map_or(Ok(()), Strength::validate)
    }

    /// Reference weight for each frame of a window
    pub fn blend_weights(&self, indices: &[usize]) -> Vec<f32> {
        indices
            .iter()
            .map(|&frame| self.weighted_mean * strength_at(self.strength.as_ref(), frame))
            .collect()
    }
}

/// Run-scoped naive reuse state
#[derive(Debug)]
pub struct NaiveReuseState<B: Backend, const D: usize> {
    config: NaiveReuse,
    frame_dim: usize,
    reference: Option<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> NaiveReuseState<B, D> {
    pub fn new(config: NaiveReuse, frame_dim: usize) -> Self {
        Self {
            config,
            frame_dim,
            reference: None,
        }
    }

    pub fn config(&self) -> &NaiveReuse {
        &self.config
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Drop the reference carried from the previous step
    pub fn begin_step(&mut self) {
        self.reference = None;
    }

    /// Record the first output of a step, blend every later one.
    ///
    /// Positions beyond the shorter of the two windows keep the raw output.
    pub fn apply(&mut self, indices: &[usize], output: Tensor<B, D>) -> Tensor<B, D> {
        let reference = match &self.reference {
            Some(reference) => reference,
            None => {
                self.reference = Some(output.clone());
                return output;
            }
        };

        let len = output.dims()[self.frame_dim];
        let shared = len.min(reference.dims()[self.frame_dim]);
        let weights = self.config.blend_weights(indices);

        let frames: Vec<Tensor<B, D>> = (0..len)
            .map(|pos| {
                let raw = output.clone().narrow(self.frame_dim, pos, 1);
                let weight = weights.get(pos).copied().unwrap_or(0.0);
                if pos >= shared || weight == 0.0 {
                    return raw;
                }
                let carried = reference.clone().narrow(self.frame_dim, pos, 1);
                carried * weight + raw * (1.0 - weight)
            })
            .collect();

        Tensor::cat(frames, self.frame_dim)
    }
}
