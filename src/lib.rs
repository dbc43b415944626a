//! Sliding context windows for video diffusion in Burn
//!
//! Motion modules of video diffusion models only see a fixed number of frames
//! at once. This crate runs such a model over longer latent sequences by
//! cutting them into overlapping windows, evaluating each window and fusing
//! the outputs back together, once per sampling step.
//!
//! ## Components
//!
//! - **Schemes**: [`ContextOptions`] for static, uniform, looped, batched and
//!   view-as-context windowing, with optional nested views
//! - **Chains**: [`ContextOptionsGroup`] switches schemes as sampling
//!   progresses, honouring per-scheme guaranteed step counts
//! - **Fusion**: flat or pyramid weighting of overlapping outputs
//! - **Extras**: naive reuse of the first window and reference-frame
//!   conditioning through attention and AdaIN hooks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sliding_context_burn::{ContextOptions, ContextOptionsGroup, ContextRun, StepProgress};
//!
//! let group = ContextOptionsGroup::new()
//!     .add(ContextOptions::standard_uniform(16, 4, 4))?
//!     .add(ContextOptions::batched(16).with_start_percent(0.8))?;
//!
//! // latent is [batch, channels, frames, height, width]
//! let mut run = ContextRun::<B, 5>::new(&group, 64, 2)?;
//! for step in 0..steps {
//!     let velocity = run.forward(latent.clone(), StepProgress::new(step, steps), |x, call| {
//!         Ok(model.forward(x, call))
//!     })?;
//!     latent = scheduler.step(latent, velocity, step);
//! }
//! ```

pub mod config;
pub mod extras;
pub mod fuse;
pub mod group;
pub mod modules;
pub mod pipeline;
pub mod schedule;

// Re-export main types
pub use config::{ContextError, ContextLimits, ContextOptions, ContextSchedule, FuseMethod};
pub use extras::{
    ContextExtra, ContextExtrasGroup, ContextRef, ContextRefMode, ContextRefParams, NaiveReuse, ReferenceHooks,
    ReferencePhase, Strength,
};
pub use fuse::{fuse_weights, FrameAccumulator};
pub use group::{ContextOptionsGroup, GroupCursor, StepPlan};
pub use pipeline::{ContextRun, WindowCall};
pub use schedule::{generate_windows, ordered_halving, ContextWindow, StepProgress};
