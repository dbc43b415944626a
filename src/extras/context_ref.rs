//! Reference-frame conditioning across windows
//!
//! Windows that contain a reference frame run first and record that frame's
//! attention keys/values and feature statistics. Every other window of the
//! step then attends to the recorded reference and is pulled towards its
//! statistics, so windows that never see each other still share a look.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use burn::config::Config;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{in_interval, strength_at, Strength};
use crate::config::{check_fraction, ContextError};
use crate::modules::{adain_transfer, feature_stats, joint_attention, lerp, scaled_attention, ADAIN_EPS};

/// Which frames act as references
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContextRefMode {
    /// Frame 0 only
    #[default]
    First,
    /// `width` consecutive frames following the windows of the previous step
    Sliding { width: usize },
    /// A fixed set of frames
    Indexes(BTreeSet<usize>),
}

impl ContextRefMode {
    pub fn first() -> Self {
        ContextRefMode::First
    }

    pub fn sliding(width: usize) -> Result<Self, ContextError> {
        if width < 2 {
            return Err(ContextError::SlidingWidthTooSmall(width));
        }
        Ok(ContextRefMode::Sliding { width })
    }

    pub fn indexes<I>(indexes: I, always_include_0: bool) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut set: BTreeSet<usize> = indexes.into_iter().collect();
        if always_include_0 {
            set.insert(0);
        }
        ContextRefMode::Indexes(set)
    }
}

/// Tuning of the attention and AdaIN reference paths
#[derive(Config, Debug)]
pub struct ContextRefParams {
    /// How far the joint attention replaces the window's own attention
    #[config(default = 1.0)]
    pub attn_style_fidelity: f32,

    /// Attention mass prior of the reference tokens
    #[config(default = 1.0)]
    pub attn_ref_weight: f32,

    #[config(default = 1.0)]
    pub attn_strength: f32,

    /// How far the transferred features replace the window's own
    #[config(default = 1.0)]
    pub adain_style_fidelity: f32,

    /// How far the target statistics move towards the reference
    #[config(default = 1.0)]
    pub adain_ref_weight: f32,

    #[config(default = 1.0)]
    pub adain_strength: f32,
}

impl ContextRefParams {
    /// Attention-only tuning, AdaIN disabled
    pub fn attn_only(style_fidelity: f32, ref_weight: f32, strength: f32) -> Self {
        Self::new()
            .with_attn_style_fidelity(style_fidelity)
            .with_attn_ref_weight(ref_weight)
            .with_attn_strength(strength)
            .with_adain_style_fidelity(0.0)
            .with_adain_ref_weight(0.0)
            .with_adain_strength(0.0)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        check_fraction("attn_style_fidelity", self.attn_style_fidelity)?;
        check_fraction("attn_ref_weight", self.attn_ref_weight)?;
        check_fraction("attn_strength", self.attn_strength)?;
        check_fraction("adain_style_fidelity", self.adain_style_fidelity)?;
        check_fraction("adain_ref_weight", self.adain_ref_weight)?;
        check_fraction("adain_strength", self.adain_strength)
    }
}

impl Default for ContextRefParams {
    fn default() -> Self {
        Self::attn_only(1.0, 1.0, 1.0)
    }
}

/// Reference-frame conditioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRef {
    pub start_percent: f32,
    pub end_percent: f32,
    pub mode: ContextRefMode,
    pub params: ContextRefParams,
    /// Per-frame scale of both strengths
    pub strength: Option<Strength>,
}

impl Default for ContextRef {
    fn default() -> Self {
        Self {
            start_percent: 0.0,
            end_percent: 0.25,
            mode: ContextRefMode::First,
            params: ContextRefParams::default(),
            strength: None,
        }
    }
}

impl ContextRef {
    pub fn new(mode: ContextRefMode, params: ContextRefParams) -> Self {
        Self {
            mode,
            params,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, start_percent: f32, end_percent: f32) -> Self {
        self.start_percent = start_percent;
        self.end_percent = end_percent;
        self
    }

    pub fn with_strength(mut self, strength: Strength) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn is_active(&self, percent: f32) -> bool {
        in_interval(self.start_percent, self.end_percent, percent)
    }

    /// Check the settings against a sequence of `video_length` frames
    pub fn validate(&self, video_length: usize) -> Result<(), ContextError> {
        check_fraction("start_percent", self.start_percent)?;
        check_fraction("end_percent", self.end_percent)?;
        self.params.validate()?;
        if let Some(strength) = &self.strength {
            strength.validate()?;
        }

        match &self.mode {
            ContextRefMode::First => {
                if video_length == 0 {
                    return Err(ContextError::ReferenceIndexOutOfRange { index: 0, video_length });
                }
            }
            ContextRefMode::Sliding { width } => {
                if *width < 2 {
                    return Err(ContextError::SlidingWidthTooSmall(*width));
                }
            }
            ContextRefMode::Indexes(indexes) => {
                if let Some(&index) = indexes.iter().find(|&&index| index >= video_length) {
                    return Err(ContextError::ReferenceIndexOutOfRange { index, video_length });
                }
            }
        }
        Ok(())
    }
}

/// Order in which a window takes part in a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePhase {
    /// The window holds reference frames and records them
    Write,
    /// The window consumes what the writers recorded
    Read,
}

type AttentionBank<B> = HashMap<usize, BTreeMap<usize, (Tensor<B, 3>, Tensor<B, 3>)>>;
type AdainBank<B> = HashMap<usize, BTreeMap<usize, Tensor<B, 3>>>;

/// Run-scoped reference state: the current reference set and this step's bank
#[derive(Debug)]
pub struct ContextRefState<B: Backend> {
    config: ContextRef,
    video_length: usize,
    sliding_start: usize,
    attention_slice_size: usize,
    attn_bank: AttentionBank<B>,
    adain_bank: AdainBank<B>,
}

impl<B: Backend> ContextRefState<B> {
    pub fn new(config: ContextRef, video_length: usize) -> Result<Self, ContextError> {
        config.validate(video_length)?;
        Ok(Self {
            config,
            video_length,
            sliding_start: 0,
            attention_slice_size: 0,
            attn_bank: HashMap::new(),
            adain_bank: HashMap::new(),
        })
    }

    /// Query chunk size for the attention kernels (0 = full attention)
    pub fn with_attention_slice_size(mut self, slice_size: usize) -> Self {
        self.attention_slice_size = slice_size;
        self
    }

    pub fn config(&self) -> &ContextRef {
        &self.config
    }

    /// Frames acting as references for the current step
    pub fn reference_indices(&self) -> BTreeSet<usize> {
        match &self.config.mode {
            ContextRefMode::First => BTreeSet::from([0]),
            ContextRefMode::Sliding { width } => {
                let end = (self.sliding_start + width).min(self.video_length);
                (self.sliding_start..end).collect()
            }
            ContextRefMode::Indexes(indexes) => indexes.clone(),
        }
    }

    /// Whether a window with these indices records references
    pub fn is_writer(&self, indices: &[usize]) -> bool {
        let references = self.reference_indices();
        indices.iter().any(|index| references.contains(index))
    }

    /// Clear everything recorded during the previous step
    pub fn begin_step(&mut self) {
        self.attn_bank.clear();
        self.adain_bank.clear();
    }

    /// Re-centre a sliding reference on the last window of the step
    pub fn end_step(&mut self, last_window: &[usize]) {
        let ContextRefMode::Sliding { width } = self.config.mode else {
            return;
        };
        let Some(&centre) = last_window.get(last_window.len() / 2) else {
            return;
        };
        let start = centre.saturating_sub(width / 2);
        self.sliding_start = start.min(self.video_length.saturating_sub(width));
        trace!("Sliding reference moved to frame {}", self.sliding_start);
    }

    pub fn sliding_start(&self) -> usize {
        self.sliding_start
    }

    /// Hooks for one window call
    pub fn hooks<'a>(&'a mut self, phase: ReferencePhase, indices: &'a [usize]) -> ReferenceHooks<'a, B> {
        let references = self.reference_indices();
        ReferenceHooks {
            state: self,
            phase,
            indices,
            references,
        }
    }
}

/// Attention and AdaIN entry points handed to the model for one window.
///
/// Tensors are `[rows, tokens, channels]` where rows are the window frames,
/// repeated once per batch copy: row `c * frames + f` is frame `f` of copy `c`.
pub struct ReferenceHooks<'a, B: Backend> {
    state: &'a mut ContextRefState<B>,
    phase: ReferencePhase,
    indices: &'a [usize],
    references: BTreeSet<usize>,
}

impl<'a, B: Backend> ReferenceHooks<'a, B> {
    pub fn phase(&self) -> ReferencePhase {
        self.phase
    }

    /// Self-attention for `layer`, joined with the reference tokens when reading
    pub fn attention(
        &mut self,
        layer: usize,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>, ContextError> {
        let slice_size = self.state.attention_slice_size;
        let params = self.state.config.params.clone();
        let copies = self.copies(q.dims()[0])?;

        if params.attn_strength <= 0.0 {
            return Ok(scaled_attention(q, k, v, slice_size));
        }

        match self.phase {
            ReferencePhase::Write => {
                let bank = self.state.attn_bank.entry(layer).or_default();
                for (frame, rows) in reference_rows::<B>(self.indices, &self.references, copies, &k.device()) {
                    bank.entry(frame)
                        .or_insert_with(|| (k.clone().select(0, rows.clone()), v.clone().select(0, rows)));
                }
                Ok(scaled_attention(q, k, v, slice_size))
            }
            ReferencePhase::Read => {
                let Some(bank) = self.state.attn_bank.get(&layer).filter(|bank| !bank.is_empty()) else {
                    return Ok(scaled_attention(q, k, v, slice_size));
                };
                let (keys, values): (Vec<_>, Vec<_>) = bank.values().cloned().unzip();
                let k_ref = self.expand_rows(Tensor::cat(keys, 1), copies)?;
                let v_ref = self.expand_rows(Tensor::cat(values, 1), copies)?;

                let own = scaled_attention(q.clone(), k.clone(), v.clone(), slice_size);
                let joint = joint_attention(q, k, v, k_ref, v_ref, params.attn_ref_weight, slice_size);
                let styled = own.clone() + (joint - own.clone()) * params.attn_style_fidelity;
                let strength = self.row_strength(params.attn_strength, copies, &own.device());
                Ok(lerp(own, styled, strength))
            }
        }
    }

    /// AdaIN for `layer`, pulling feature statistics towards the reference when reading
    pub fn adain(&mut self, layer: usize, x: Tensor<B, 3>) -> Result<Tensor<B, 3>, ContextError> {
        let params = self.state.config.params.clone();
        let copies = self.copies(x.dims()[0])?;

        if params.adain_strength <= 0.0 {
            return Ok(x);
        }

        match self.phase {
            ReferencePhase::Write => {
                let bank = self.state.adain_bank.entry(layer).or_default();
                for (frame, rows) in reference_rows::<B>(self.indices, &self.references, copies, &x.device()) {
                    bank.entry(frame).or_insert_with(|| x.clone().select(0, rows));
                }
                Ok(x)
            }
            ReferencePhase::Read => {
                let Some(bank) = self.state.adain_bank.get(&layer).filter(|bank| !bank.is_empty()) else {
                    return Ok(x);
                };
                let features = Tensor::cat(bank.values().cloned().collect(), 1);
                let (ref_mean, ref_std) = feature_stats(features, ADAIN_EPS);
                let ref_mean = self.expand_rows(ref_mean, copies)?;
                let ref_std = self.expand_rows(ref_std, copies)?;

                let (own_mean, own_std) = feature_stats(x.clone(), ADAIN_EPS);
                let target_mean = own_mean.clone() + (ref_mean - own_mean) * params.adain_ref_weight;
                let target_std = own_std.clone() + (ref_std - own_std) * params.adain_ref_weight;

                let transferred = adain_transfer(x.clone(), target_mean, target_std, ADAIN_EPS);
                let styled = x.clone() + (transferred - x.clone()) * params.adain_style_fidelity;
                let strength = self.row_strength(params.adain_strength, copies, &x.device());
                Ok(lerp(x, styled, strength))
            }
        }
    }

    /// Batch copies stacked along the row axis
    fn copies(&self, rows: usize) -> Result<usize, ContextError> {
        let frames = self.indices.len();
        if frames == 0 || rows % frames != 0 {
            return Err(ContextError::LengthMismatch {
                expected: frames,
                actual: rows,
            });
        }
        Ok(rows / frames)
    }

    /// Repeat per-copy reference data `[copies, tokens, channels]` for every frame row
    fn expand_rows(&self, reference: Tensor<B, 3>, copies: usize) -> Result<Tensor<B, 3>, ContextError> {
        let [recorded, tokens, channels] = reference.dims();
        if recorded != copies {
            return Err(ContextError::LengthMismatch {
                expected: copies,
                actual: recorded,
            });
        }
        let frames = self.indices.len();
        Ok(reference
            .unsqueeze_dim::<4>(1)
            .repeat(&[1, frames, 1, 1])
            .reshape([copies * frames, tokens, channels]))
    }

    /// `[rows, 1, 1]` blend weights: `strength` scaled per frame
    fn row_strength(&self, strength: f32, copies: usize, device: &B::Device) -> Tensor<B, 3> {
        let per_frame: Vec<f32> = self
            .indices
            .iter()
            .map(|&frame| strength * strength_at(self.state.config.strength.as_ref(), frame))
            .collect();
        let rows: Vec<f32> = (0..copies).flat_map(|_| per_frame.iter().copied()).collect();
        let len = rows.len();
        Tensor::<B, 1>::from_floats(rows.as_slice(), device).reshape([len, 1, 1])
    }
}

/// Row selectors for every reference frame present in a window
fn reference_rows<B: Backend>(
    indices: &[usize],
    references: &BTreeSet<usize>,
    copies: usize,
    device: &B::Device,
) -> Vec<(usize, Tensor<B, 1, Int>)> {
    let frames = indices.len();
    indices
        .iter()
        .enumerate()
        .filter(|(_, frame)| references.contains(frame))
        .map(|(pos, &frame)| {
            let rows: Vec<i64> = (0..copies).map(|c| (c * frames + pos) as i64).collect();
            (frame, Tensor::<B, 1, Int>::from_data(rows.as_slice(), device))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn values(tensor: Tensor<TestBackend, 3>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tolerance, "{a} != {e}");
        }
    }

    fn attn_state(strength: Option<Strength>) -> ContextRefState<TestBackend> {
        let mut config = ContextRef::new(ContextRefMode::first(), ContextRefParams::attn_only(1.0, 1.0, 1.0));
        config.strength = strength;
        ContextRefState::new(config, 8).unwrap()
    }

    /// Records frame 0 of window [0, 1] with zero keys and values `[4, 2]`
    fn write_first_frame(state: &mut ContextRefState<TestBackend>) {
        let device = Default::default();
        let k = Tensor::<TestBackend, 3>::zeros([2, 1, 2], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[4.0, 2.0]], [[8.0, 8.0]]], &device);
        let indices = [0, 1];
        let mut hooks = state.hooks(ReferencePhase::Write, &indices);
        hooks.attention(0, k.clone(), k, v).unwrap();
    }

    #[test]
    fn test_indexes_mode() {
        let mode = ContextRefMode::indexes([5], true);
        assert_eq!(mode, ContextRefMode::Indexes(BTreeSet::from([0, 5])));
        assert_eq!(ContextRefMode::indexes([3, 5], false), ContextRefMode::Indexes(BTreeSet::from([3, 5])));
        assert_eq!(ContextRefMode::sliding(1), Err(ContextError::SlidingWidthTooSmall(1)));
    }

    #[test]
    fn test_indexes_keep_zero_when_listed() {
        for always_include_0 in [true, false] {
            let mode = ContextRefMode::indexes([0, 5], always_include_0);
            assert_eq!(mode, ContextRefMode::Indexes(BTreeSet::from([0, 5])));

            let state =
                ContextRefState::<TestBackend>::new(ContextRef::new(mode, ContextRefParams::default()), 8).unwrap();
            assert_eq!(state.reference_indices(), BTreeSet::from([0, 5]));
            assert!(state.is_writer(&[4, 5, 6]));
            assert!(!state.is_writer(&[1, 2, 3]));
        }
    }

    #[test]
    fn test_reference_index_must_exist() {
        let config = ContextRef::new(ContextRefMode::indexes([0, 40], false), ContextRefParams::new());
        assert_eq!(
            config.validate(32),
            Err(ContextError::ReferenceIndexOutOfRange { index: 40, video_length: 32 })
        );
        assert!(config.validate(41).is_ok());
    }

    #[test]
    fn test_strength_must_be_fractions() {
        let mut config = ContextRef::default();
        config.strength = Some(Strength::PerFrame(vec![0.5, 1.5]));
        assert_eq!(
            config.validate(8),
            Err(ContextError::InvalidFraction { name: "strength", value: 1.5 })
        );
    }

    #[test]
    fn test_default_tuning_is_attention_only() {
        let config = ContextRef::default();
        assert_eq!(config.params.attn_strength, 1.0);
        assert_eq!(config.params.adain_strength, 0.0);
        assert_eq!(ContextRefParams::new().adain_strength, 1.0);
    }

    #[test]
    fn test_sliding_reference_follows_last_window() {
        let mode = ContextRefMode::sliding(4).unwrap();
        let mut state =
            ContextRefState::<TestBackend>::new(ContextRef::new(mode, ContextRefParams::default()), 32).unwrap();
        assert_eq!(state.reference_indices(), BTreeSet::from([0, 1, 2, 3]));

        let window: Vec<usize> = (8..24).collect();
        state.end_step(&window);
        assert_eq!(state.reference_indices(), (14..18).collect());

        state.end_step(&[28, 29, 30, 31]);
        assert_eq!(state.reference_indices(), (28..32).collect());
    }

    #[test]
    fn test_writers_are_windows_holding_a_reference() {
        let state = attn_state(None);
        assert!(state.is_writer(&[6, 7, 0, 1]));
        assert!(!state.is_writer(&[2, 3, 4]));
    }

    #[test]
    fn test_read_attends_to_written_reference() {
        let device = Default::default();
        let mut state = attn_state(None);
        write_first_frame(&mut state);

        let zeros = Tensor::<TestBackend, 3>::zeros([2, 1, 2], &device);
        let indices = [2, 3];
        let mut hooks = state.hooks(ReferencePhase::Read, &indices);
        let out = hooks.attention(0, zeros.clone(), zeros.clone(), zeros).unwrap();

        // own values are zero and half of the mass lands on the reference
        assert_close(&values(out), &[2.0, 1.0, 2.0, 1.0], 1e-5);
    }

    #[test]
    fn test_per_frame_strength_limits_read() {
        let device = Default::default();
        let mut state = attn_state(Some(Strength::PerFrame(vec![1.0, 1.0, 1.0, 0.0])));
        write_first_frame(&mut state);

        let zeros = Tensor::<TestBackend, 3>::zeros([2, 1, 2], &device);
        let indices = [2, 3];
        let mut hooks = state.hooks(ReferencePhase::Read, &indices);
        let out = hooks.attention(0, zeros.clone(), zeros.clone(), zeros).unwrap();
        assert_close(&values(out), &[2.0, 1.0, 0.0, 0.0], 1e-5);
    }

    #[test]
    fn test_begin_step_clears_bank() {
        let device = Default::default();
        let mut state = attn_state(None);
        write_first_frame(&mut state);
        state.begin_step();

        let zeros = Tensor::<TestBackend, 3>::zeros([2, 1, 2], &device);
        let indices = [2, 3];
        let mut hooks = state.hooks(ReferencePhase::Read, &indices);
        let out = hooks.attention(0, zeros.clone(), zeros.clone(), zeros).unwrap();
        assert_close(&values(out), &[0.0; 4], 1e-6);
    }

    #[test]
    fn test_adain_read_takes_reference_stats() {
        let device = Default::default();
        let config = ContextRef::new(ContextRefMode::first(), ContextRefParams::new());
        let mut state = ContextRefState::<TestBackend>::new(config, 8).unwrap();

        let reference = Tensor::<TestBackend, 3>::from_floats([[[0.0], [2.0], [4.0]]], &device);
        let indices = [0];
        let written = state.hooks(ReferencePhase::Write, &indices).adain(0, reference).unwrap();
        assert_close(&values(written), &[0.0, 2.0, 4.0], 1e-6);

        let x = Tensor::<TestBackend, 3>::from_floats([[[10.0], [11.0], [12.0]]], &device);
        let indices = [5];
        let out = state.hooks(ReferencePhase::Read, &indices).adain(0, x).unwrap();
        assert_close(&values(out), &[0.0, 2.0, 4.0], 1e-3);
    }

    #[test]
    fn test_rows_must_split_into_frames() {
        let device = Default::default();
        let mut state = attn_state(None);
        let x = Tensor::<TestBackend, 3>::zeros([3, 1, 2], &device);
        let indices = [0, 1];
        let err = state
            .hooks(ReferencePhase::Write, &indices)
            .attention(0, x.clone(), x.clone(), x)
            .unwrap_err();
        assert_eq!(err, ContextError::LengthMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_read_copies_must_match_recorded() {
        let device = Default::default();
        let mut state = attn_state(None);
        write_first_frame(&mut state);

        // two batch copies of a two-frame window, but one copy was recorded
        let zeros = Tensor::<TestBackend, 3>::zeros([4, 1, 2], &device);
        let indices = [2, 3];
        let err = state
            .hooks(ReferencePhase::Read, &indices)
            .attention(0, zeros.clone(), zeros.clone(), zeros)
            .unwrap_err();
        assert_eq!(err, ContextError::LengthMismatch { expected: 2, actual: 1 });
    }
}
