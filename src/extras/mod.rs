//! Cross-window consistency extras
//!
//! Extras ride along with a context scheme and nudge windows towards agreeing
//! with each other. Each extra has its own activation interval on top of the
//! interval of the scheme that carries it.

pub mod context_ref;
pub mod naive_reuse;

use serde::{Deserialize, Serialize};

pub use context_ref::{ContextRef, ContextRefMode, ContextRefParams, ContextRefState, ReferenceHooks, ReferencePhase};
pub use naive_reuse::{NaiveReuse, NaiveReuseState};

use crate::config::{check_fraction, ContextError};

/// Strength of an extra, either constant or given per frame.
///
/// Frames past the end of a per-frame list reuse its last value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Strength {
    Scalar(f32),
    PerFrame(Vec<f32>),
}

impl Strength {
    pub fn at(&self, frame: usize) -> f32 {
        match self {
            Strength::Scalar(value) => *value,
            Strength::PerFrame(values) => values
                .get(frame)
                .or(values.last())
                .copied()
                .unwrap_or(1.0),
        }
    }

    /// Every value must lie in `[0, 1]`.
    pub fn validate(&self) -> Result<(), ContextError> {
        match self {
            Strength::Scalar(value) => check_fraction("strength", *value),
            Strength::PerFrame(values) => values
                .iter()
                .try_for_each(|&value| check_fraction("strength", value)),
        }
    }
}

/// Strength at `frame`, full strength when unset
pub(crate) fn strength_at(strength: Option<&Strength>, frame: usize) -> f32 {
    strength.map_or(1.0, |s| s.at(frame))
}

pub(crate) fn in_interval(start_percent: f32, end_percent: f32, percent: f32) -> bool {
    start_percent <= percent && percent <= end_percent
}

/// One consistency extra
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextExtra {
    NaiveReuse(NaiveReuse),
    ContextRef(ContextRef),
}

impl ContextExtra {
    fn same_kind(&self, other: &ContextExtra) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn is_active(&self, percent: f32) -> bool {
        match self {
            ContextExtra::NaiveReuse(extra) => extra.is_active(percent),
            ContextExtra::ContextRef(extra) => extra.is_active(percent),
        }
    }
}

impl From<NaiveReuse> for ContextExtra {
    fn from(extra: NaiveReuse) -> Self {
        ContextExtra::NaiveReuse(extra)
    }
}

impl From<ContextRef> for ContextExtra {
    fn from(extra: ContextRef) -> Self {
        ContextExtra::ContextRef(extra)
    }
}

/// Ordered set of extras, at most one of each kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextExtrasGroup {
    extras: Vec<ContextExtra>,
}

impl ContextExtrasGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new group with `extra` added.
    ///
    /// An extra of the same kind already in the group is replaced in place.
    pub fn add(&self, extra: ContextExtra) -> Self {
        let mut group = self.clone();
        match group.extras.iter_mut().find(|existing| existing.same_kind(&extra)) {
            Some(existing) => *existing = extra,
            None => group.extras.push(extra),
        }
        group
    }

    pub fn len(&self) -> usize {
        self.extras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extras.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextExtra> {
        self.extras.iter()
    }

    pub fn naive_reuse(&self) -> Option<&NaiveReuse> {
        self.extras.iter().find_map(|extra| match extra {
            ContextExtra::NaiveReuse(naive) => Some(naive),
            _ => None,
        })
    }

    pub fn context_ref(&self) -> Option<&ContextRef> {
        self.extras.iter().find_map(|extra| match extra {
            ContextExtra::ContextRef(context_ref) => Some(context_ref),
            _ => None,
        })
    }

    /// Check every extra against a sequence of `video_length` frames.
    pub fn validate(&self, video_length: usize) -> Result<(), ContextError> {
        for extra in &self.extras {
            match extra {
                ContextExtra::NaiveReuse(naive) => naive.validate()?,
                ContextExtra::ContextRef(context_ref) => context_ref.validate(video_length)?,
            }
        }
        Ok(())
    }
}
