//! Window generation for context schedules
//!
//! Turns a [`ContextOptions`] and a sequence length into the ordered list of
//! frame windows the model is run on for one sampling step.

use crate::config::{ContextOptions, ContextSchedule};

/// Position of the sampler within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepProgress {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total number of steps
    pub total_steps: usize,
}

impl StepProgress {
    pub fn new(step: usize, total_steps: usize) -> Self {
        Self { step, total_steps }
    }

    /// Get progress as a fraction (0.0 - 1.0)
    pub fn percent(&self) -> f32 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.step as f32 / self.total_steps as f32
    }
}

/// A window of frame indices processed by one model call.
///
/// Top-level windows hold sequence indices. When the options carry a nested
/// view, `views` holds the inner windows as positions local to this window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    indices: Vec<usize>,
    views: Vec<ContextWindow>,
}

impl ContextWindow {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            indices,
            views: Vec::new(),
        }
    }

    /// Window covering `0..len`
    pub fn full(len: usize) -> Self {
        Self::new((0..len).collect())
    }

    fn with_views(mut self, views: Vec<ContextWindow>) -> Self {
        self.views = views;
        self
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn views(&self) -> &[ContextWindow] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn first(&self) -> Option<usize> {
        self.indices.first().copied()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Number of indices shared with `other`
    pub fn shared_with(&self, other: &ContextWindow) -> usize {
        self.indices.iter().filter(|i| other.contains(**i)).count()
    }

    /// Whether the indices roll over past the end of the sequence
    pub fn is_wrapped(&self) -> bool {
        self.indices.windows(2).any(|pair| pair[1] < pair[0])
    }

    /// Whether the indices form one ascending run without gaps
    pub fn is_contiguous(&self) -> bool {
        self.indices.windows(2).all(|pair| pair[1] == pair[0] + 1)
    }

    /// Map the local positions of a nested view to sequence indices
    pub fn resolve(&self, view: &ContextWindow) -> Vec<usize> {
        view.indices.iter().map(|&pos| self.indices[pos]).collect()
    }
}

/// Fractional bit-reversal of the step index.
///
/// Successive steps land on 0, 1/2, 1/4, 3/4, ... which spreads looped window
/// phases evenly over the ring.
pub fn ordered_halving(step: usize) -> f64 {
    (step as u64).reverse_bits() as f64 / 2f64.powi(64)
}

/// Generate the windows of `options` over `video_length` frames.
///
/// View-as-context yields a single outer window. Whenever view options are
/// present each outer window is tiled again over its own local length.
pub fn generate_windows(
    options: &ContextOptions,
    video_length: usize,
    progress: StepProgress,
) -> Vec<ContextWindow> {
    let windows = match options.schedule {
        ContextSchedule::ViewAsContext => vec![ContextWindow::full(video_length)],
        _ => flat_windows(options, video_length, progress),
    };

    match options.view() {
        Some(view) => windows
            .into_iter()
            .map(|window| {
                let local = flat_windows(view, window.len(), progress);
                window.with_views(local)
            })
            .collect(),
        None => windows,
    }
}

/// Single-level windows for one schedule
fn flat_windows(options: &ContextOptions, video_length: usize, progress: StepProgress) -> Vec<ContextWindow> {
    if video_length == 0 {
        return Vec::new();
    }
    let length = options.length.max(1);
    if video_length <= length {
        return vec![ContextWindow::full(video_length)];
    }

    let windows = match options.schedule {
        ContextSchedule::StaticStandard => static_standard(video_length, length, options.overlap),
        ContextSchedule::UniformStandard => {
            uniform_standard(video_length, length, options.stride.unwrap_or(1))
        }
        ContextSchedule::Batched => batched(video_length, length),
        ContextSchedule::ViewAsContext => vec![(0..video_length).collect()],
        #[allow(deprecated)]
        ContextSchedule::UniformLooped | ContextSchedule::LegacyUniform => {
            let stride = options.stride.unwrap_or(1);
            if options.closed_loop {
                uniform_looped_closed(video_length, length, stride, progress.step)
            } else {
                uniform_looped_open(video_length, length, stride, options.overlap)
            }
        }
    };

    windows.into_iter().map(ContextWindow::new).collect()
}

fn static_standard(video_length: usize, length: usize, overlap: usize) -> Vec<Vec<usize>> {
    let delta = length.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        // Right-align the last window so it keeps the full length
        if start + length >= video_length {
            let start = video_length - length;
            windows.push((start..video_length).collect());
            break;
        }
        windows.push((start..start + length).collect());
        start += delta;
    }
    windows
}

fn uniform_standard(video_length: usize, length: usize, stride: usize) -> Vec<Vec<usize>> {
    let stride = stride.max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        if start + length >= video_length {
            let start = video_length - length;
            windows.push((start..video_length).collect());
            break;
        }
        windows.push((start..start + length).collect());
        start += stride;
    }
    windows
}

/// Every window may wrap; the ring phase moves from step to step.
fn uniform_looped_closed(video_length: usize, length: usize, stride: usize, step: usize) -> Vec<Vec<usize>> {
    let stride = stride.max(1);
    let phase = (video_length as f64 * ordered_halving(step)).round() as usize % video_length;
    let count = video_length.div_ceil(stride);

    (0..count)
        .map(|k| {
            let start = (phase + k * stride) % video_length;
            (start..start + length).map(|i| i % video_length).collect()
        })
        .collect()
}

/// Interior windows may wrap, the first and last never do.
fn uniform_looped_open(video_length: usize, length: usize, stride: usize, overlap: usize) -> Vec<Vec<usize>> {
    let stride = stride.max(1);
    let end = video_length.saturating_sub(overlap).max(1);

    let mut windows: Vec<Vec<usize>> = (0..end)
        .step_by(stride)
        .map(|start| (start..start + length).map(|i| i % video_length).collect())
        .collect();

    let tail: Vec<usize> = (video_length - length..video_length).collect();
    let last_wraps = windows
        .last()
        .is_some_and(|last| last.windows(2).any(|pair| pair[1] < pair[0]));
    let reaches_end = windows.last().and_then(|last| last.last()) == Some(&(video_length - 1));
    if last_wraps {
        if let Some(last) = windows.last_mut() {
            *last = tail;
        }
    } else if !reaches_end {
        windows.push(tail);
    }

    // Keep the later copy of a duplicate so the unwrapped tail stays last
    let mut deduped: Vec<Vec<usize>> = Vec::with_capacity(windows.len());
    for (i, window) in windows.iter().enumerate() {
        if !windows[i + 1..].contains(window) {
            deduped.push(window.clone());
        }
    }
    deduped
}

fn batched(video_length: usize, length: usize) -> Vec<Vec<usize>> {
    (0..video_length)
        .step_by(length)
        .map(|start| (start..(start + length).min(video_length)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::config::ContextLimits;
    use std::collections::BTreeSet;

    fn starts(windows: &[ContextWindow]) -> Vec<usize> {
        windows.iter().filter_map(|w| w.first()).collect()
    }

    #[test]
    fn test_static_windows_right_align_last() {
        let options = ContextOptions::standard_static(16, 4);
        let windows = options.windows(40, StepProgress::new(0, 20));
        assert_eq!(starts(&windows), vec![0, 12, 24]);
        assert_eq!(windows[2].indices().last(), Some(&39));
        assert!(windows.iter().all(|w| w.len() == 16));
    }

    #[test]
    fn test_short_sequence_is_single_window() {
        let options = ContextOptions::standard_static(16, 4);
        let windows = options.windows(10, StepProgress::new(0, 20));
        assert_eq!(windows, vec![ContextWindow::full(10)]);
    }

    #[test]
    fn test_uniform_standard_scenario() {
        let options = ContextOptions::standard_uniform(16, 4, 8);
        let windows = options.windows(32, StepProgress::new(3, 20));
        assert_eq!(starts(&windows), vec![0, 4, 8, 12, 16]);
        assert!(windows.iter().all(|w| w.len() == 16 && !w.is_wrapped()));
    }

    #[test]
    fn test_uniform_standard_clips_to_end() {
        let options = ContextOptions::standard_uniform(8, 5, 2);
        let windows = options.windows(20, StepProgress::new(0, 10));
        assert_eq!(starts(&windows), vec![0, 5, 10, 12]);
        assert_eq!(windows.last().unwrap().indices().last(), Some(&19));
    }

    #[test]
    fn test_closed_loop_wraps() {
        let options = ContextOptions::looped_uniform(4, 1, 2, true);
        let windows = options.windows(10, StepProgress::new(0, 20));
        assert_eq!(windows.len(), 10);
        assert!(windows.iter().any(|w| w.indices() == [8, 9, 0, 1]));
    }

    #[test]
    fn test_closed_loop_phase_moves_between_steps() {
        let options = ContextOptions::looped_uniform(8, 4, 2, true);
        let first = options.windows(32, StepProgress::new(0, 20));
        let second = options.windows(32, StepProgress::new(1, 20));
        assert_eq!(first[0].first(), Some(0));
        assert_eq!(second[0].first(), Some(16));
    }

    #[test]
    fn test_open_loop_keeps_edges_unwrapped() {
        let options = ContextOptions::looped_uniform(4, 1, 1, false);
        let windows = options.windows(10, StepProgress::new(0, 20));
        assert!(!windows.first().unwrap().is_wrapped());
        assert!(!windows.last().unwrap().is_wrapped());
        assert_eq!(windows.last().unwrap().indices(), [6, 7, 8, 9]);
        assert!(windows.iter().any(|w| w.is_wrapped()));
    }

    #[test]
    fn test_batched_partitions() {
        let options = ContextOptions::batched(8);
        let windows = options.windows(20, StepProgress::new(0, 10));
        assert_eq!(starts(&windows), vec![0, 8, 16]);
        assert_eq!(windows[2].len(), 4);
    }

    #[test]
    fn test_view_as_context_delegates_tiling() {
        let options = ContextOptions::view_as_context(ContextOptions::static_view(8, 2));
        let windows = options.windows(20, StepProgress::new(0, 10));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].len(), 20);
        let inner: Vec<usize> = windows[0].views().iter().filter_map(|v| v.first()).collect();
        assert_eq!(inner, vec![0, 6, 12]);
    }

    #[test]
    fn test_nested_view_is_local() {
        let options = ContextOptions::standard_static(16, 4)
            .with_view_options(ContextOptions::static_view(8, 4));
        let windows = options.windows(28, StepProgress::new(0, 10));
        assert_eq!(starts(&windows), vec![0, 12]);
        let second = &windows[1];
        assert_eq!(second.views().len(), 3);
        assert_eq!(second.resolve(&second.views()[0]), (12..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_ordered_halving() {
        assert_eq!(ordered_halving(0), 0.0);
        assert_eq!(ordered_halving(1), 0.5);
        assert_eq!(ordered_halving(2), 0.25);
        assert_eq!(ordered_halving(3), 0.75);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Static windows cover every frame and keep the configured length
        #[test]
        fn prop_static_windows_cover_sequence(
            length in 1usize..32,
            overlap_seed in 0usize..32,
            extra in 0usize..100,
        ) {
            let overlap = overlap_seed % length;
            let video_length = length + extra;
            let options = ContextOptions::standard_static(length, overlap);
            let windows = options.windows(video_length, StepProgress::new(0, 1));

            let covered: BTreeSet<usize> = windows.iter().flat_map(|w| w.indices().to_vec()).collect();
            prop_assert_eq!(covered, (0..video_length).collect::<BTreeSet<_>>());
            prop_assert!(windows.iter().all(|w| w.len() == length));
        }

        /// Uniform windows never wrap and cover the sequence when stride <= length
        #[test]
        fn prop_uniform_windows_cover_sequence(
            length in 1usize..32,
            stride_seed in 0usize..32,
            extra in 0usize..100,
        ) {
            let stride = stride_seed % length + 1;
            let video_length = length + extra;
            let options = ContextOptions::standard_uniform(length, stride, 0);
            let windows = options.windows(video_length, StepProgress::new(0, 1));

            let covered: BTreeSet<usize> = windows.iter().flat_map(|w| w.indices().to_vec()).collect();
            prop_assert_eq!(covered, (0..video_length).collect::<BTreeSet<_>>());
            prop_assert!(windows.iter().all(|w| !w.is_wrapped()));
        }

        /// Open loops cover the sequence and keep both ends unwrapped
        #[test]
        fn prop_open_loop_covers_sequence(
            length in 2usize..24,
            stride in 1usize..=32,
            overlap_seed in 0usize..24,
            extra in 1usize..60,
        ) {
            let overlap = overlap_seed % length;
            let video_length = length + extra;
            let options = ContextOptions::looped_uniform(length, stride, overlap, false);
            prop_assume!(options.validate(&ContextLimits::default()).is_ok());
            let windows = options.windows(video_length, StepProgress::new(0, 1));

            let covered: BTreeSet<usize> = windows.iter().flat_map(|w| w.indices().to_vec()).collect();
            prop_assert_eq!(covered, (0..video_length).collect::<BTreeSet<_>>());
            prop_assert!(!windows.first().unwrap().is_wrapped());
            prop_assert!(!windows.last().unwrap().is_wrapped());
        }

        /// Closed loops cover the ring on every step
        #[test]
        fn prop_closed_loop_covers_ring(
            length in 2usize..24,
            stride in 1usize..=32,
            overlap_seed in 0usize..24,
            extra in 1usize..60,
            step in 0usize..50,
        ) {
            let overlap = overlap_seed % length;
            let video_length = length + extra;
            let options = ContextOptions::looped_uniform(length, stride, overlap, true);
            prop_assume!(options.validate(&ContextLimits::default()).is_ok());
            let windows = options.windows(video_length, StepProgress::new(step, 50));

            let covered: BTreeSet<usize> = windows.iter().flat_map(|w| w.indices().to_vec()).collect();
            prop_assert_eq!(covered, (0..video_length).collect::<BTreeSet<_>>());
        }
    }
}
