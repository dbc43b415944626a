//! Windowed model evaluation for one sampling run
//!
//! A [`ContextRun`] owns everything that changes while a run progresses: the
//! cursor over the scheme chain and the state of the active extras. Each call
//! to [`ContextRun::forward`] cuts the latent into windows, runs the model on
//! every window and fuses the outputs back into one tensor.

use burn::prelude::*;
use tracing::{debug, trace};

use crate::config::{ContextError, ContextOptions};
use crate::extras::{ContextRefState, NaiveReuseState, ReferenceHooks, ReferencePhase};
use crate::fuse::{window_weights, FrameAccumulator};
use crate::group::{ContextOptionsGroup, GroupCursor};
use crate::modules::scaled_attention;
use crate::schedule::{ContextWindow, StepProgress};

/// One model call over a window
pub struct WindowCall<'a, B: Backend> {
    indices: &'a [usize],
    progress: StepProgress,
    attention_slice_size: usize,
    reference: Option<ReferenceHooks<'a, B>>,
}

impl<'a, B: Backend> WindowCall<'a, B> {
    /// Sequence frames covered by the window, in tensor order
    pub fn indices(&self) -> &[usize] {
        self.indices
    }

    pub fn progress(&self) -> StepProgress {
        self.progress
    }

    /// Reference phase of this call, `None` when reference conditioning is off
    pub fn phase(&self) -> Option<ReferencePhase> {
        self.reference.as_ref().map(ReferenceHooks::phase)
    }

    pub fn reference(&mut self) -> Option<&mut ReferenceHooks<'a, B>> {
        self.reference.as_mut()
    }

    /// Self-attention for `layer`, routed through the reference hooks when active
    pub fn attention(
        &mut self,
        layer: usize,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>, ContextError> {
        match self.reference.as_mut() {
            Some(hooks) => hooks.attention(layer, q, k, v),
            None => Ok(scaled_attention(q, k, v, self.attention_slice_size)),
        }
    }

    /// AdaIN for `layer`; identity when reference conditioning is off
    pub fn adain(&mut self, layer: usize, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ContextError> {
        match self.reference.as_mut() {
            Some(hooks) => hooks.adain(layer, x),
            None => Ok(x),
        }
    }
}

/// A model call target: the window's global indices plus where its output goes
struct Leaf {
    window: usize,
    view: Option<usize>,
    indices: Vec<usize>,
}

/// Run-scoped windowing driver
///
/// # Type Parameters
/// * `B` - Burn backend
/// * `D` - Rank of the latent tensor
#[derive(Debug)]
pub struct ContextRun<B: Backend, const D: usize> {
    group: ContextOptionsGroup,
    cursor: GroupCursor,
    video_length: usize,
    frame_dim: usize,
    attention_slice_size: usize,
    active: Option<usize>,
    naive_reuse: Option<NaiveReuseState<B, D>>,
    context_ref: Option<ContextRefState<B>>,
}

impl<B: Backend, const D: usize> ContextRun<B, D> {
    /// Start a run over `video_length` frames laid out along `frame_dim`.
    ///
    /// The group is cloned, so later edits to it do not affect the run. Every
    /// entry is checked against the group's limits, including entries edited
    /// in place after they were added.
    pub fn new(group: &ContextOptionsGroup, video_length: usize, frame_dim: usize) -> Result<Self, ContextError> {
        if frame_dim >= D {
            return Err(ContextError::FrameDimOutOfRange { dim: frame_dim, rank: D });
        }
        if group.is_empty() {
            return Err(ContextError::EmptyGroup);
        }
        group.validate()?;
        if let Some(extras) = group.extras() {
            extras.validate(video_length)?;
        }
        for extras in group.iter().filter_map(|options| options.extras.as_ref()) {
            extras.validate(video_length)?;
        }

        Ok(Self {
            group: group.clone(),
            cursor: GroupCursor::new(),
            video_length,
            frame_dim,
            attention_slice_size: 0,
            active: None,
            naive_reuse: None,
            context_ref: None,
        })
    }

    /// Query chunk size for attention computed through [`WindowCall`]
    pub fn with_attention_slice_size(mut self, slice_size: usize) -> Self {
        self.attention_slice_size = slice_size;
        self
    }

    pub fn group(&self) -> &ContextOptionsGroup {
        &self.group
    }

    pub fn video_length(&self) -> usize {
        self.video_length
    }

    /// Index of the scheme used by the last step
    pub fn active_context(&self) -> Option<usize> {
        self.active
    }

    pub fn naive_reuse(&self) -> Option<&NaiveReuseState<B, D>> {
        self.naive_reuse.as_ref()
    }

    pub fn context_ref(&self) -> Option<&ContextRefState<B>> {
        self.context_ref.as_ref()
    }

    /// Evaluate `model` over the windows of one step and fuse the results.
    ///
    /// `model` receives the frames of one window along `frame_dim` and must
    /// return a tensor with the same number of frames on that axis.
    ///
    /// Windows are evaluated one call at a time. Callers that want to batch
    /// several windows into one model call can drive the pieces directly:
    /// [`ContextOptionsGroup::plan`] for the windows of each step,
    /// [`window_weights`](crate::fuse::window_weights) for their fusion
    /// weights, and [`FrameAccumulator`](crate::fuse::FrameAccumulator) to
    /// fuse the outputs. Reference conditioning still needs this method, since
    /// readers must run after the writers of the same step.
    pub fn forward<F>(&mut self, x: Tensor<B, D>, progress: StepProgress, mut model: F) -> Result<Tensor<B, D>, ContextError>
    where
        F: FnMut(Tensor<B, D>, &mut WindowCall<'_, B>) -> Result<Tensor<B, D>, ContextError>,
    {
        let frames = x.dims()[self.frame_dim];
        if frames != self.video_length {
            return Err(ContextError::LengthMismatch {
                expected: self.video_length,
                actual: frames,
            });
        }

        let percent = progress.percent();
        let index = self.cursor.advance(&self.group, percent)?;
        if self.active != Some(index) {
            self.activate(index)?;
        }
        let options = self.group.shared(index).ok_or(ContextError::EmptyGroup)?;

        if !options.should_apply(self.video_length) {
            debug!(
                "Step {}/{}: {} frames fit context options #{}, single call",
                progress.step + 1,
                progress.total_steps,
                self.video_length,
                index
            );
            let indices: Vec<usize> = (0..self.video_length).collect();
            let mut call = WindowCall {
                indices: &indices,
                progress,
                attention_slice_size: self.attention_slice_size,
                reference: None,
            };
            let out = model(x, &mut call)?;
            check_frames(&out, self.frame_dim, indices.len())?;
            return Ok(out);
        }

        let windows = options.windows(self.video_length, progress);
        let leaves = flatten_leaves(&windows);

        let reuse_active = match self.naive_reuse.as_mut() {
            Some(state) => {
                state.begin_step();
                state.config().is_active(percent)
            }
            None => false,
        };
        let reference_active = match self.context_ref.as_mut() {
            Some(state) => {
                state.begin_step();
                state.config().is_active(percent)
            }
            None => false,
        };

        // Writers run before readers when reference conditioning is on
        let mut order: Vec<(usize, Option<ReferencePhase>)> = (0..leaves.len()).map(|leaf| (leaf, None)).collect();
        if let Some(state) = self.context_ref.as_ref().filter(|_| reference_active) {
            let (writers, readers): (Vec<_>, Vec<_>) = (0..leaves.len())
                .partition(|&leaf| state.is_writer(&leaves[leaf].indices));
            order = writers
                .into_iter()
                .map(|leaf| (leaf, Some(ReferencePhase::Write)))
                .chain(readers.into_iter().map(|leaf| (leaf, Some(ReferencePhase::Read))))
                .collect();
        }

        debug!(
            "Step {}/{}: context options #{} ({:?}) over {} frames, {} windows, {} model calls",
            progress.step + 1,
            progress.total_steps,
            index,
            options.schedule,
            self.video_length,
            windows.len(),
            leaves.len()
        );

        let mut outputs: Vec<Option<Tensor<B, D>>> = vec![None; leaves.len()];
        for &(leaf_index, phase) in &order {
            let leaf = &leaves[leaf_index];
            trace!("Window {:?} -> {:?}", phase, leaf.indices);

            let window_x = select_frames(x.clone(), &leaf.indices, self.frame_dim);
            let reference = match (phase, self.context_ref.as_mut()) {
                (Some(phase), Some(state)) => Some(state.hooks(phase, &leaf.indices)),
                _ => None,
            };
            let mut call = WindowCall {
                indices: &leaf.indices,
                progress,
                attention_slice_size: self.attention_slice_size,
                reference,
            };
            let out = model(window_x, &mut call)?;
            drop(call);
            check_frames(&out, self.frame_dim, leaf.indices.len())?;

            let out = match self.naive_reuse.as_mut().filter(|_| reuse_active) {
                Some(state) => state.apply(&leaf.indices, out),
                None => out,
            };
            outputs[leaf_index] = Some(out);
        }

        if let (Some(state), Some(&(last, _))) = (self.context_ref.as_mut(), order.last()) {
            if reference_active {
                state.end_step(&leaves[last].indices);
            }
        }

        self.fuse(&options, &windows, &leaves, outputs)
    }

    /// Rebuild the extras state for a newly selected scheme
    fn activate(&mut self, index: usize) -> Result<(), ContextError> {
        let extras = self.group.extras_for(index).cloned();

        self.naive_reuse = extras
            .as_ref()
            .and_then(|extras| extras.naive_reuse())
            .map(|config| NaiveReuseState::new(config.clone(), self.frame_dim));
        self.context_ref = match extras.as_ref().and_then(|extras| extras.context_ref()) {
            Some(config) => Some(
                ContextRefState::new(config.clone(), self.video_length)?
                    .with_attention_slice_size(self.attention_slice_size),
            ),
            None => None,
        };
        self.active = Some(index);

        debug!(
            "Context options #{} selected (naive reuse: {}, context ref: {})",
            index,
            self.naive_reuse.is_some(),
            self.context_ref.is_some()
        );
        Ok(())
    }

    /// Fuse views into their windows, then windows into the sequence
    fn fuse(
        &self,
        options: &ContextOptions,
        windows: &[ContextWindow],
        leaves: &[Leaf],
        mut outputs: Vec<Option<Tensor<B, D>>>,
    ) -> Result<Tensor<B, D>, ContextError> {
        let outer_weights = window_weights(windows, options.fuse_method, options.wraps_around());
        let mut sequence = FrameAccumulator::<B, D>::new(self.video_length, self.frame_dim);

        for (w, window) in windows.iter().enumerate() {
            let leaf_outputs: Vec<(usize, Tensor<B, D>)> = leaves
                .iter()
                .enumerate()
                .filter(|(_, leaf)| leaf.window == w)
                .filter_map(|(i, leaf)| outputs[i].take().map(|out| (leaf.view.unwrap_or(0), out)))
                .collect();

            let fused = match options.view() {
                Some(view) if !window.views().is_empty() => {
                    let inner_weights = window_weights(window.views(), view.fuse_method, view.wraps_around());
                    let mut local = FrameAccumulator::<B, D>::new(window.len(), self.frame_dim);
                    for (v, out) in leaf_outputs {
                        local.add(window.views()[v].indices(), out, &inner_weights[v])?;
                    }
                    local.finish()?
                }
                _ => match leaf_outputs.into_iter().next() {
                    Some((_, out)) => out,
                    None => continue,
                },
            };

            sequence.add(window.indices(), fused, &outer_weights[w])?;
        }

        sequence.finish()
    }
}

/// Flatten windows and their views into model calls in generation order
fn flatten_leaves(windows: &[ContextWindow]) -> Vec<Leaf> {
    windows
        .iter()
        .enumerate()
        .flat_map(|(w, window)| {
            if window.views().is_empty() {
                vec![Leaf {
                    window: w,
                    view: None,
                    indices: window.indices().to_vec(),
                }]
            } else {
                window
                    .views()
                    .iter()
                    .enumerate()
                    .map(|(v, view)| Leaf {
                        window: w,
                        view: Some(v),
                        indices: window.resolve(view),
                    })
                    .collect()
            }
        })
        .collect()
}

/// Gather the frames of one window along `frame_dim`
fn select_frames<B: Backend, const D: usize>(x: Tensor<B, D>, indices: &[usize], frame_dim: usize) -> Tensor<B, D> {
    let contiguous = indices.windows(2).all(|pair| pair[1] == pair[0] + 1);
    match indices.first() {
        Some(&start) if contiguous => x.narrow(frame_dim, start, indices.len()),
        _ => {
            let device = x.device();
            let rows: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
            x.select(frame_dim, Tensor::<B, 1, Int>::from_data(rows.as_slice(), &device))
        }
    }
}

fn check_frames<B: Backend, const D: usize>(out: &Tensor<B, D>, frame_dim: usize, expected: usize) -> Result<(), ContextError> {
    let actual = out.dims()[frame_dim];
    if actual != expected {
        return Err(ContextError::LengthMismatch { expected, actual });
    }
    Ok(())
}
