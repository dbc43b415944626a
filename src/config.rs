//! Context scheme configuration
//!
//! A [`ContextOptions`] describes one way of cutting a long latent sequence into
//! windows the motion model can digest. Builders mirror the scheme kinds a host
//! graph exposes (looped uniform, standard uniform, static, batched and
//! view-as-context) plus the nested "view" schemes used for hierarchical tiling.

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::extras::ContextExtrasGroup;
use crate::schedule::{generate_windows, ContextWindow, StepProgress};

/// Upper bounds for window parameters.
///
/// These track the temporal capacity of the motion modules that are currently
/// supported. Newer checkpoints may need larger values, so validation always
/// takes the limits as a parameter.
#[derive(Config, Debug)]
pub struct ContextLimits {
    /// Largest accepted window length (default: 128)
    #[config(default = 128)]
    pub max_length: usize,

    /// Largest accepted stride (default: 32)
    #[config(default = 32)]
    pub max_stride: usize,

    /// Largest accepted overlap (default: 128)
    #[config(default = 128)]
    pub max_overlap: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while building or running context schemes
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("{name} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
    #[error("{name} = {value} is not a fraction in [0, 1]")]
    InvalidFraction { name: &'static str, value: f32 },
    #[error("overlap {overlap} must be smaller than length {length}")]
    OverlapTooLarge { overlap: usize, length: usize },
    #[error("stride {stride} exceeds length {length}; windows would leave gaps")]
    StrideTooLarge { stride: usize, length: usize },
    #[error("{0:?} schedule requires a stride")]
    MissingStride(ContextSchedule),
    #[error("{0:?} schedule only supports flat fusion")]
    FlatFuseRequired(ContextSchedule),
    #[error("invalid view options: {0}")]
    InvalidView(&'static str),
    #[error("context options group is empty")]
    EmptyGroup,
    #[error("no context options are active at {percent:.3} of sampling")]
    NoActiveContext { percent: f32 },
    #[error("reference index {index} is out of range for {video_length} frames")]
    ReferenceIndexOutOfRange { index: usize, video_length: usize },
    #[error("sliding reference width must be at least 2, got {0}")]
    SlidingWidthTooSmall(usize),
    #[error("frame axis {dim} does not exist on a rank {rank} tensor")]
    FrameDimOutOfRange { dim: usize, rank: usize },
    #[error("expected {expected} frames, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("frame {0} is not covered by any window")]
    UncoveredFrame(usize),
}

/// Window generation algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextSchedule {
    /// Fixed windows spaced by `length - overlap`, last window right-aligned
    StaticStandard,
    /// Windows spaced by `stride`, clipped to the end of the sequence
    UniformStandard,
    /// Windows spaced by `stride` with indices taken modulo the sequence length
    UniformLooped,
    /// Consecutive non-overlapping chunks
    Batched,
    /// One window over everything, tiled by the nested view options
    ViewAsContext,
    /// Old looped scheme kept so saved workflows still load.
    #[deprecated(note = "mapped onto `UniformLooped` when the options are built")]
    LegacyUniform,
}

/// How overlapping window outputs are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FuseMethod {
    /// Every position weighs the same
    Flat,
    /// Positions near a shared edge are ramped down
    #[default]
    Pyramid,
}

/// One context scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Frames per window
    pub length: usize,
    /// Spacing between window starts (uniform schedules only)
    pub stride: Option<usize>,
    /// Frames shared with the neighbouring window
    pub overlap: usize,
    /// Window generation algorithm
    pub schedule: ContextSchedule,
    /// Let the last looped window wrap back to frame 0
    pub closed_loop: bool,
    /// Fusion weighting
    pub fuse_method: FuseMethod,
    /// Still generate windows when the sequence is exactly one window long
    pub use_on_equal_length: bool,
    /// Fraction of sampling progress from which the scheme may become active
    pub start_percent: f32,
    /// Minimum consecutive steps once selected
    pub guarantee_steps: usize,
    /// Nested windowing applied inside each window
    pub view_options: Option<Box<ContextOptions>>,
    /// Cross-window consistency extras
    pub extras: Option<ContextExtrasGroup>,
}

impl ContextOptions {
    /// Create options for a schedule with the common defaults.
    ///
    /// The deprecated legacy schedule is rewritten to the looped uniform one.
    pub fn new(schedule: ContextSchedule, length: usize, overlap: usize) -> Self {
        #[allow(deprecated)]
        let schedule = match schedule {
            ContextSchedule::LegacyUniform => ContextSchedule::UniformLooped,
            other => other,
        };

        Self {
            length,
            stride: None,
            overlap,
            schedule,
            closed_loop: false,
            fuse_method: FuseMethod::Pyramid,
            use_on_equal_length: false,
            start_percent: 0.0,
            guarantee_steps: 1,
            view_options: None,
            extras: None,
        }
    }

    /// Looped uniform windows (default 16 / 1 / 4)
    pub fn looped_uniform(length: usize, stride: usize, overlap: usize, closed_loop: bool) -> Self {
        Self {
            stride: Some(stride),
            closed_loop,
            ..Self::new(ContextSchedule::UniformLooped, length, overlap)
        }
    }

    /// Looped uniform windows as saved by older workflows, flat fused
    pub fn legacy_looped_uniform(
        length: usize,
        stride: usize,
        overlap: usize,
        closed_loop: bool,
    ) -> Self {
        #[allow(deprecated)]
        let base = Self::new(ContextSchedule::LegacyUniform, length, overlap);
        Self {
            stride: Some(stride),
            closed_loop,
            fuse_method: FuseMethod::Flat,
            ..base
        }
    }

    /// Standard uniform windows, never wrapping
    pub fn standard_uniform(length: usize, stride: usize, overlap: usize) -> Self {
        Self {
            stride: Some(stride),
            ..Self::new(ContextSchedule::UniformStandard, length, overlap)
        }
    }

    /// Static windows that stay the same on every step
    pub fn standard_static(length: usize, overlap: usize) -> Self {
        Self::new(ContextSchedule::StaticStandard, length, overlap)
    }

    /// Batched, non-overlapping chunks
    pub fn batched(length: usize) -> Self {
        Self {
            fuse_method: FuseMethod::Flat,
            ..Self::new(ContextSchedule::Batched, length, 0)
        }
    }

    /// Run the whole sequence as one context and tile it with `view`
    pub fn view_as_context(view: ContextOptions) -> Self {
        Self {
            use_on_equal_length: true,
            view_options: Some(Box::new(view)),
            ..Self::new(ContextSchedule::ViewAsContext, 0, 0)
        }
    }

    /// Static nested view, flat fused by default
    pub fn static_view(length: usize, overlap: usize) -> Self {
        Self {
            fuse_method: FuseMethod::Flat,
            ..Self::standard_static(length, overlap)
        }
    }

    /// Uniform nested view
    pub fn uniform_view(length: usize, stride: usize, overlap: usize) -> Self {
        Self::standard_uniform(length, stride, overlap)
    }

    /// Looped nested view
    pub fn looped_view(length: usize, stride: usize, overlap: usize, closed_loop: bool) -> Self {
        Self::looped_uniform(length, stride, overlap, closed_loop)
    }

    pub fn with_fuse_method(mut self, fuse_method: FuseMethod) -> Self {
        self.fuse_method = fuse_method;
        self
    }

    pub fn with_use_on_equal_length(mut self, enabled: bool) -> Self {
        self.use_on_equal_length = enabled;
        self
    }

    pub fn with_start_percent(mut self, start_percent: f32) -> Self {
        self.start_percent = start_percent;
        self
    }

    pub fn with_guarantee_steps(mut self, steps: usize) -> Self {
        self.guarantee_steps = steps;
        self
    }

    pub fn with_view_options(mut self, view: ContextOptions) -> Self {
        self.view_options = Some(Box::new(view));
        self
    }

    pub fn with_extras(mut self, extras: ContextExtrasGroup) -> Self {
        self.extras = Some(extras);
        self
    }

    /// Nested view options, if any
    pub fn view(&self) -> Option<&ContextOptions> {
        self.view_options.as_deref()
    }

    /// Whether the first and last windows count as neighbours during fusion
    pub fn wraps_around(&self) -> bool {
        self.schedule == ContextSchedule::UniformLooped && self.closed_loop
    }

    /// Effective window length, looking through view-as-context
    pub fn window_length(&self) -> usize {
        match (self.schedule, self.view()) {
            (ContextSchedule::ViewAsContext, Some(view)) => view.length,
            _ => self.length,
        }
    }

    /// Whether a sequence of `video_length` frames should go through windowing
    /// at all, rather than a single plain model call.
    pub fn should_apply(&self, video_length: usize) -> bool {
        let length = self.window_length();
        video_length > length || (video_length == length && self.use_on_equal_length)
    }

    /// Generate the windows for one step
    pub fn windows(&self, video_length: usize, progress: StepProgress) -> Vec<ContextWindow> {
        generate_windows(self, video_length, progress)
    }

    /// Check the options against `limits` and the window invariants.
    pub fn validate(&self, limits: &ContextLimits) -> Result<(), ContextError> {
        check_fraction("start_percent", self.start_percent)?;

        match self.schedule {
            ContextSchedule::ViewAsContext => {
                let view = self
                    .view()
                    .ok_or(ContextError::InvalidView("view-as-context needs view options"))?;
                return validate_view(view, limits);
            }
            ContextSchedule::Batched => {
                if self.fuse_method != FuseMethod::Flat {
                    return Err(ContextError::FlatFuseRequired(self.schedule));
                }
                if self.view_options.is_some() {
                    return Err(ContextError::InvalidView("batched schedules cannot nest views"));
                }
            }
            _ => {}
        }

        self.validate_window(limits)?;

        if let Some(view) = self.view() {
            validate_view(view, limits)?;
        }

        Ok(())
    }

    /// Length, stride and overlap checks shared by top-level and view options
    fn validate_window(&self, limits: &ContextLimits) -> Result<(), ContextError> {
        check_range("length", self.length, 1, limits.max_length)?;
        check_range("overlap", self.overlap, 0, limits.max_overlap)?;

        #[allow(deprecated)]
        let uniform = matches!(
            self.schedule,
            ContextSchedule::UniformStandard
                | ContextSchedule::UniformLooped
                | ContextSchedule::LegacyUniform
        );

        if uniform {
            let stride = self.stride.ok_or(ContextError::MissingStride(self.schedule))?;
            check_range("stride", stride, 1, limits.max_stride)?;
            if stride > self.length {
                return Err(ContextError::StrideTooLarge {
                    stride,
                    length: self.length,
                });
            }
        } else if let Some(stride) = self.stride {
            check_range("stride", stride, 1, limits.max_stride)?;
        }

        if self.schedule != ContextSchedule::Batched && self.overlap >= self.length {
            return Err(ContextError::OverlapTooLarge {
                overlap: self.overlap,
                length: self.length,
            });
        }

        Ok(())
    }
}

/// Views are plain tilings: one level deep, no activation or extras.
fn validate_view(view: &ContextOptions, limits: &ContextLimits) -> Result<(), ContextError> {
    match view.schedule {
        ContextSchedule::ViewAsContext | ContextSchedule::Batched => {
            return Err(ContextError::InvalidView(
                "views must use a static, uniform or looped schedule",
            ));
        }
        _ => {}
    }
    if view.view_options.is_some() {
        return Err(ContextError::InvalidView("only one level of views is supported"));
    }
    if view.extras.is_some() {
        return Err(ContextError::InvalidView("extras only apply to top-level options"));
    }
    view.validate_window(limits)
}

fn check_range(name: &'static str, value: usize, min: usize, max: usize) -> Result<(), ContextError> {
    if value < min || value > max {
        return Err(ContextError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

pub(crate) fn check_fraction(name: &'static str, value: f32) -> Result<(), ContextError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ContextError::InvalidFraction { name, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let looped = ContextOptions::looped_uniform(16, 1, 4, false);
        assert_eq!(looped.schedule, ContextSchedule::UniformLooped);
        assert_eq!(looped.fuse_method, FuseMethod::Pyramid);
        assert_eq!(looped.guarantee_steps, 1);
        assert_eq!(looped.start_percent, 0.0);

        let batched = ContextOptions::batched(16);
        assert_eq!(batched.fuse_method, FuseMethod::Flat);
        assert_eq!(batched.overlap, 0);

        let view = ContextOptions::view_as_context(ContextOptions::static_view(8, 2));
        assert!(view.use_on_equal_length);
        assert_eq!(view.window_length(), 8);
    }

    #[test]
    fn test_legacy_schedule_maps_to_looped() {
        let legacy = ContextOptions::legacy_looped_uniform(16, 1, 4, true);
        assert_eq!(legacy.schedule, ContextSchedule::UniformLooped);
        assert_eq!(legacy.fuse_method, FuseMethod::Flat);
        assert!(legacy.closed_loop);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_length() {
        let limits = ContextLimits::default();
        let err = ContextOptions::standard_static(8, 8).validate(&limits).unwrap_err();
        assert_eq!(err, ContextError::OverlapTooLarge { overlap: 8, length: 8 });
    }

    #[test]
    fn test_stride_bounded_by_length_for_uniform_schedules() {
        let limits = ContextLimits::default();
        let too_far = ContextError::StrideTooLarge { stride: 12, length: 8 };
        assert_eq!(ContextOptions::standard_uniform(8, 12, 2).validate(&limits), Err(too_far.clone()));
        for closed_loop in [true, false] {
            assert_eq!(
                ContextOptions::looped_uniform(8, 12, 2, closed_loop).validate(&limits),
                Err(too_far.clone())
            );
            assert_eq!(
                ContextOptions::legacy_looped_uniform(8, 12, 2, closed_loop).validate(&limits),
                Err(too_far.clone())
            );
            let nested = ContextOptions::standard_static(16, 4)
                .with_view_options(ContextOptions::looped_view(8, 12, 2, closed_loop));
            assert_eq!(nested.validate(&limits), Err(too_far.clone()));
            assert!(ContextOptions::looped_uniform(8, 8, 2, closed_loop).validate(&limits).is_ok());
        }
    }

    #[test]
    fn test_limits_are_parameters() {
        let options = ContextOptions::standard_static(200, 4);
        assert!(matches!(
            options.validate(&ContextLimits::default()),
            Err(ContextError::OutOfRange { name: "length", .. })
        ));
        let wide = ContextLimits::new().with_max_length(256);
        assert!(options.validate(&wide).is_ok());
    }

    #[test]
    fn test_nested_views_are_single_level() {
        let limits = ContextLimits::default();
        let inner = ContextOptions::static_view(4, 1);
        let view = ContextOptions::static_view(8, 2).with_view_options(inner);
        let options = ContextOptions::standard_static(16, 4).with_view_options(view);
        assert!(matches!(
            options.validate(&limits),
            Err(ContextError::InvalidView(_))
        ));
    }

    #[test]
    fn test_batched_rejects_pyramid() {
        let options = ContextOptions::batched(16).with_fuse_method(FuseMethod::Pyramid);
        assert_eq!(
            options.validate(&ContextLimits::default()),
            Err(ContextError::FlatFuseRequired(ContextSchedule::Batched))
        );
    }

    #[test]
    fn test_should_apply() {
        let options = ContextOptions::standard_static(16, 4);
        assert!(!options.should_apply(8));
        assert!(!options.should_apply(16));
        assert!(options.should_apply(17));
        assert!(options.with_use_on_equal_length(true).should_apply(16));
    }

    #[test]
    fn test_start_percent_must_be_fraction() {
        let options = ContextOptions::standard_static(16, 4).with_start_percent(1.5);
        assert!(matches!(
            options.validate(&ContextLimits::default()),
            Err(ContextError::InvalidFraction { name: "start_percent", .. })
        ));
    }
}
