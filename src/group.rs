//! Chains of context schemes and per-step selection
//!
//! A [`ContextOptionsGroup`] is an ordered chain of schemes, each with its own
//! activation threshold. A run walks the chain with a [`GroupCursor`], which
//! picks exactly one scheme per sampling step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ContextError, ContextLimits, ContextOptions};
use crate::extras::ContextExtrasGroup;
use crate::schedule::{ContextWindow, StepProgress};

/// Ordered chain of context schemes.
///
/// Entries are kept sorted by `start_percent`. A scheme added later goes in
/// front of existing schemes that share its `start_percent`, so among equal
/// thresholds the most recently added one is selected first.
///
/// Entries are shared between clones and only copied when mutated, so a group
/// wired into several requests never sees another request's edits.
///
/// The group remembers the [`ContextLimits`] its entries were checked against.
/// Entries edited through [`get_mut`](Self::get_mut) are checked again by
/// [`validate`](Self::validate), which [`plan`](Self::plan) and
/// [`ContextRun::new`](crate::ContextRun::new) call before using the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOptionsGroup {
    contexts: Vec<Arc<ContextOptions>>,
    extras: Option<ContextExtrasGroup>,
    #[serde(default)]
    limits: ContextLimits,
}

impl ContextOptionsGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new group with `options` added, validated against the group's limits.
    pub fn add(&self, options: ContextOptions) -> Result<Self, ContextError> {
        options.validate(&self.limits)?;

        let mut group = self.clone();
        let position = group
            .contexts
            .iter()
            .position(|existing| existing.start_percent >= options.start_percent)
            .unwrap_or(group.contexts.len());
        group.contexts.insert(position, Arc::new(options));
        Ok(group)
    }

    /// Return a new group using `limits`, then add `options` to it.
    pub fn add_with_limits(&self, options: ContextOptions, limits: &ContextLimits) -> Result<Self, ContextError> {
        self.with_limits(limits.clone())?.add(options)
    }

    /// Return a new group checked against `limits` from now on.
    ///
    /// Fails if an existing entry does not fit the new limits.
    pub fn with_limits(&self, limits: ContextLimits) -> Result<Self, ContextError> {
        let group = Self {
            limits,
            ..self.clone()
        };
        group.validate()?;
        Ok(group)
    }

    /// Return a new group carrying `extras` for schemes without their own.
    pub fn with_extras(&self, extras: ContextExtrasGroup) -> Self {
        Self {
            extras: Some(extras),
            ..self.clone()
        }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// Check every entry against the group's limits.
    pub fn validate(&self) -> Result<(), ContextError> {
        self.iter().try_for_each(|options| options.validate(&self.limits))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ContextOptions> {
        self.contexts.get(index).map(Arc::as_ref)
    }

    /// Mutable access to one entry; copies it first if it is shared.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut ContextOptions> {
        self.contexts.get_mut(index).map(Arc::make_mut)
    }

    pub(crate) fn shared(&self, index: usize) -> Option<Arc<ContextOptions>> {
        self.contexts.get(index).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextOptions> {
        self.contexts.iter().map(Arc::as_ref)
    }

    /// Group-level extras
    pub fn extras(&self) -> Option<&ContextExtrasGroup> {
        self.extras.as_ref()
    }

    /// Extras that apply while entry `index` is active
    pub fn extras_for(&self, index: usize) -> Option<&ContextExtrasGroup> {
        self.get(index)
            .and_then(|options| options.extras.as_ref())
            .or(self.extras.as_ref())
    }

    /// Windows produced by this group for every step of a run.
    ///
    /// Used to inspect or visualize a chain without running a model.
    pub fn plan(&self, video_length: usize, total_steps: usize) -> Result<Vec<StepPlan>, ContextError> {
        self.validate()?;

        let mut cursor = GroupCursor::new();
        (0..total_steps)
            .map(|step| {
                let progress = StepProgress::new(step, total_steps);
                let context_index = cursor.advance(self, progress.percent())?;
                let options = &self.contexts[context_index];
                let windows = if options.should_apply(video_length) {
                    options.windows(video_length, progress)
                } else {
                    vec![ContextWindow::full(video_length)]
                };
                Ok(StepPlan {
                    progress,
                    context_index,
                    windows,
                })
            })
            .collect()
    }
}

/// Windows selected for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub progress: StepProgress,
    /// Index of the active entry in the group
    pub context_index: usize,
    pub windows: Vec<ContextWindow>,
}

/// Run-scoped selection state over a group
#[derive(Debug, Clone, Default)]
pub struct GroupCursor {
    current: Option<usize>,
    used_steps: usize,
}

impl GroupCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the active entry, if one was selected
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Consecutive steps the active entry has served
    pub fn used_steps(&self) -> usize {
        self.used_steps
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Select the entry for the step at `percent` and count the step.
    ///
    /// Once the active entry has served its guaranteed steps, later entries
    /// whose threshold is met take over in chain order. The scan stops at the
    /// first one with a non-zero guarantee.
    pub fn advance(&mut self, group: &ContextOptionsGroup, percent: f32) -> Result<usize, ContextError> {
        if group.is_empty() {
            return Err(ContextError::EmptyGroup);
        }

        let may_switch = match self.current {
            None => true,
            Some(index) => self.used_steps >= group.contexts[index].guarantee_steps,
        };

        if may_switch {
            let next = self.current.map_or(0, |index| index + 1);
            for (index, options) in group.contexts.iter().enumerate().skip(next) {
                if options.start_percent > percent {
                    break;
                }
                info!(
                    "Context options #{} ({:?}, length {}) active at {:.3}",
                    index, options.schedule, options.length, percent
                );
                self.current = Some(index);
                self.used_steps = 0;
                if options.guarantee_steps > 0 {
                    break;
                }
            }
        }

        let current = self.current.ok_or(ContextError::NoActiveContext { percent })?;
        self.used_steps += 1;
        Ok(current)
    }
}
