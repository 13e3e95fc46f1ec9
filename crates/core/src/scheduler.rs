//! Pairwise interpolation scheduling.
//!
//! The scheduler consumes source frames one at a time and, for every
//! consecutive pair, emits the earlier frame followed by `2^exp - 1` frames
//! that fill the gap. How the gap is filled depends on a coarse comparison of
//! the pair: static pairs may be dropped, pairs with large motion repeat the
//! earlier frame, and everything else is synthesized by recursive midpoint
//! inference.

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::align::{AlignedTensor, Aligner};
use crate::error::PipelineError;
use crate::model::FlowModel;
use crate::motion::{coarse_diff, MotionThresholds, PairAction};
use crate::types::Frame;

pub const MIN_EXP: u32 = 1;
pub const MAX_EXP: u32 = 6;

const SKIP_WARN_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Each pair is expanded into `2^exp` output frames.
    pub exp: u32,
    pub high_res: bool,
    pub skip_static: bool,
    pub thresholds: MotionThresholds,
    pub montage: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            exp: 1,
            high_res: false,
            skip_static: false,
            thresholds: MotionThresholds::default(),
            montage: false,
        }
    }
}

impl SchedulerConfig {
    pub fn frames_per_pair(&self) -> u64 {
        1_u64 << self.exp
    }
}

pub fn validate_exp(exp: u32) -> Result<u32, PipelineError> {
    if (MIN_EXP..=MAX_EXP).contains(&exp) {
        Ok(exp)
    } else {
        Err(PipelineError::InvalidExponent(exp))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Primed,
    Advancing,
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pairs_interpolated: u64,
    pub pairs_duplicated: u64,
    pub pairs_skipped: u64,
    pub skip_warnings: u64,
    pub model_calls: u64,
}

/// The previous source frame together with its aligned tensor.
struct Anchor {
    frame: Frame,
    tensor: AlignedTensor,
}

pub struct InterpolationScheduler {
    model: Box<dyn FlowModel>,
    config: SchedulerConfig,
    aligner: Aligner,
    state: SchedulerState,
    prev: Option<Anchor>,
    next_pair: u64,
    stats: SchedulerStats,
}

impl InterpolationScheduler {
    pub fn new(model: Box<dyn FlowModel>, config: SchedulerConfig) -> Result<Self, PipelineError> {
        validate_exp(config.exp)?;
        Ok(Self {
            model,
            aligner: Aligner::new(config.high_res),
            config,
            state: SchedulerState::Idle,
            prev: None,
            next_pair: 0,
            stats: SchedulerStats::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Feeds the next source frame and returns the frames it releases.
    ///
    /// The first frame only primes the scheduler. Every later frame closes a
    /// pair and releases the previous source frame followed by the frames
    /// that fill the gap, or nothing at all when the pair is skipped.
    pub fn push(&mut self, frame: Frame) -> anyhow::Result<Vec<Frame>> {
        if matches!(self.state, SchedulerState::Draining | SchedulerState::Done) {
            anyhow::bail!("scheduler received a frame after it was drained");
        }

        let Some(prev) = self.prev.take() else {
            let tensor = self.aligner.pad(&frame)?;
            self.prev = Some(Anchor { frame, tensor });
            self.state = SchedulerState::Primed;
            return Ok(Vec::new());
        };

        // Put the anchor back on every error path so `finish` still works.
        let result = self.advance(&prev, &frame);
        match result {
            Ok((output, tensor)) => {
                self.prev = Some(Anchor { frame, tensor });
                Ok(output)
            }
            Err(error) => {
                self.prev = Some(prev);
                Err(error)
            }
        }
    }

    /// Drains the scheduler, returning the last source frame if there is one.
    pub fn finish(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.state == SchedulerState::Done {
            anyhow::bail!("scheduler was already drained");
        }
        self.state = SchedulerState::Draining;
        let last = match self.prev.take() {
            Some(anchor) if self.config.montage => Some(anchor.frame.hconcat(&anchor.frame)?),
            Some(anchor) => Some(anchor.frame),
            None => None,
        };
        self.state = SchedulerState::Done;
        Ok(last)
    }

    fn advance(&mut self, prev: &Anchor, frame: &Frame) -> anyhow::Result<(Vec<Frame>, AlignedTensor)> {
        check_consistent(&prev.frame, frame)?;
        self.state = SchedulerState::Advancing;

        let pair = self.next_pair;
        self.next_pair += 1;

        let tensor = self.aligner.pad(frame)?;
        let diff = coarse_diff(&prev.tensor, &tensor)?;
        let action = self
            .config
            .thresholds
            .classify(diff, self.config.skip_static);
        debug!(pair, max = diff.max, mean = diff.mean, ?action, "Classified frame pair");

        let gap = (self.config.frames_per_pair() - 1) as usize;
        let mut output = Vec::with_capacity(gap + 1);
        match action {
            PairAction::Skip => {
                self.stats.pairs_skipped += 1;
                if self.stats.pairs_skipped % SKIP_WARN_INTERVAL == 0 {
                    self.stats.skip_warnings += 1;
                    warn!(
                        skipped = self.stats.pairs_skipped,
                        "Skipped static frame pairs; output will be shorter than the source"
                    );
                }
                return Ok((output, tensor));
            }
            PairAction::Duplicate => {
                self.stats.pairs_duplicated += 1;
                for _ in 0..=gap {
                    output.push(self.emit(&prev.frame, &prev.frame)?);
                }
            }
            PairAction::Interpolate => {
                self.stats.pairs_interpolated += 1;
                let mut mids = Vec::with_capacity(gap);
                self.synthesize(&prev.tensor, &tensor, self.config.exp, pair, &mut mids)?;

                output.push(self.emit(&prev.frame, &prev.frame)?);
                let format = prev.frame.sample_format();
                for mid in &mids {
                    let synthesized = self.aligner.crop(mid, format);
                    output.push(self.emit(&prev.frame, &synthesized)?);
                }
            }
        }
        Ok((output, tensor))
    }

    /// Midpoint first, then the left half, then the right half.
    fn synthesize(
        &mut self,
        a: &AlignedTensor,
        b: &AlignedTensor,
        depth: u32,
        pair: u64,
        out: &mut Vec<AlignedTensor>,
    ) -> Result<(), PipelineError> {
        let mid = self
            .model
            .infer(a, b, self.config.high_res)
            .map_err(|error| PipelineError::inference(pair, error))?;
        self.stats.model_calls += 1;

        if !mid.same_layout(a) {
            return Err(PipelineError::inference(
                pair,
                anyhow!(
                    "model returned shape {:?} for inputs of shape {:?}",
                    mid.as_array().shape(),
                    a.as_array().shape()
                ),
            ));
        }

        if depth == 1 {
            out.push(mid);
            return Ok(());
        }

        self.synthesize(a, &mid, depth - 1, pair, out)?;
        let mut right = Vec::with_capacity((1 << (depth - 1)) - 1);
        self.synthesize(&mid, b, depth - 1, pair, &mut right)?;
        out.push(mid);
        out.extend(right);
        Ok(())
    }

    fn emit(&self, left: &Frame, frame: &Frame) -> anyhow::Result<Frame> {
        if self.config.montage {
            left.hconcat(frame)
        } else {
            Ok(frame.clone())
        }
    }
}

fn check_consistent(first: &Frame, next: &Frame) -> Result<(), PipelineError> {
    if first.width() != next.width() || first.height() != next.height() {
        return Err(PipelineError::alignment(
            next.width(),
            next.height(),
            format!(
                "frame size changed mid-stream from {}x{}",
                first.width(),
                first.height()
            ),
        ));
    }
    if first.sample_format() != next.sample_format() {
        return Err(PipelineError::alignment(
            next.width(),
            next.height(),
            format!(
                "sample format changed mid-stream from {} to {}",
                first.sample_format(),
                next.sample_format()
            ),
        ));
    }
    Ok(())
}

/// Temporal positions, in output order, of the frames synthesized for one
/// pair at the given exponent.
pub fn midpoint_ratios(exp: u32) -> Vec<f64> {
    fn collect(lo: f64, hi: f64, depth: u32, out: &mut Vec<f64>) {
        let mid = (lo + hi) / 2.0;
        if depth > 1 {
            collect(lo, mid, depth - 1, out);
        }
        out.push(mid);
        if depth > 1 {
            collect(mid, hi, depth - 1, out);
        }
    }

    let mut ratios = Vec::new();
    if exp > 0 {
        collect(0.0, 1.0, exp, &mut ratios);
    }
    ratios
}

/// Output frames expected for `input_frames` source frames with no skips.
pub fn expected_output_frames(input_frames: u64, exp: u32) -> u64 {
    match input_frames {
        0 => 0,
        n => (n - 1) * (1_u64 << exp) + 1,
    }
}
