use anyhow::{bail, Result};
use ndarray::{s, Array2, ArrayView2};

use crate::align::AlignedTensor;
use crate::types::CHANNELS;

/// Side length of the thumbnail both frames are reduced to before comparing.
pub const COARSE_SIZE: usize = 16;
pub const DEFAULT_SKIP_THRESHOLD: f32 = 2e-3;
pub const DEFAULT_MOTION_THRESHOLD: f32 = 0.2;

/// Absolute difference statistics between two coarse thumbnails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoarseDiff {
    pub max: f32,
    pub mean: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionThresholds {
    /// Pairs whose largest coarse difference stays below this are static.
    pub skip: f32,
    /// Pairs whose mean coarse difference exceeds this are not interpolated.
    pub large_motion: f32,
}

impl Default for MotionThresholds {
    fn default() -> Self {
        Self {
            skip: DEFAULT_SKIP_THRESHOLD,
            large_motion: DEFAULT_MOTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairAction {
    /// Drop the pair entirely and advance.
    Skip,
    /// Fill the gap with copies of the earlier frame.
    Duplicate,
    /// Synthesize intermediate frames with the flow model.
    Interpolate,
}

impl MotionThresholds {
    pub fn classify(&self, diff: CoarseDiff, skip_static: bool) -> PairAction {
        if skip_static && diff.max < self.skip {
            PairAction::Skip
        } else if diff.mean > self.large_motion {
            PairAction::Duplicate
        } else {
            PairAction::Interpolate
        }
    }
}

/// Compares two aligned tensors at 16x16.
///
/// Both padded tensors are bilinearly resized with half-pixel centers and no
/// antialiasing, then compared sample by sample across all channels.
pub fn coarse_diff(a: &AlignedTensor, b: &AlignedTensor) -> Result<CoarseDiff> {
    if a.as_array().shape() != b.as_array().shape() {
        bail!(
            "cannot compare tensors of shape {:?} and {:?}",
            a.as_array().shape(),
            b.as_array().shape()
        );
    }

    let taps_y = axis_taps(a.padded_height(), COARSE_SIZE);
    let taps_x = axis_taps(a.padded_width(), COARSE_SIZE);

    let mut max = 0.0_f32;
    let mut sum = 0.0_f64;
    for c in 0..CHANNELS {
        let thumb_a = resize_plane(a.view().slice(s![0, c, .., ..]), &taps_y, &taps_x);
        let thumb_b = resize_plane(b.view().slice(s![0, c, .., ..]), &taps_y, &taps_x);
        for (va, vb) in thumb_a.iter().zip(thumb_b.iter()) {
            let d = (va - vb).abs();
            max = max.max(d);
            sum += f64::from(d);
        }
    }

    let count = (CHANNELS * COARSE_SIZE * COARSE_SIZE) as f64;
    Ok(CoarseDiff {
        max,
        mean: (sum / count) as f32,
    })
}

#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

fn axis_taps(input: usize, output: usize) -> Vec<Tap> {
    let scale = input as f32 / output as f32;
    let last = input.saturating_sub(1);
    (0..output)
        .map(|o| {
            let src = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
            let lo = (src as usize).min(last);
            Tap {
                lo,
                hi: (lo + 1).min(last),
                frac: src - lo as f32,
            }
        })
        .collect()
}

fn resize_plane(plane: ArrayView2<'_, f32>, taps_y: &[Tap], taps_x: &[Tap]) -> Array2<f32> {
    Array2::from_shape_fn((taps_y.len(), taps_x.len()), |(oy, ox)| {
        let ty = taps_y[oy];
        let tx = taps_x[ox];
        let top = plane[[ty.lo, tx.lo]] * (1.0 - tx.frac) + plane[[ty.lo, tx.hi]] * tx.frac;
        let bottom = plane[[ty.hi, tx.lo]] * (1.0 - tx.frac) + plane[[ty.hi, tx.hi]] * tx.frac;
        top * (1.0 - ty.frac) + bottom * ty.frac
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::Aligner;
    use crate::types::Frame;
    use ndarray::Array4;

    fn flat_tensor(value: f32, size: u32) -> AlignedTensor {
        let frame = Frame::RgbF32 {
            data: vec![value; (size * size * 3) as usize],
            width: size,
            height: size,
        };
        Aligner::new(false).pad(&frame).unwrap()
    }

    #[test]
    fn test_identical_tensors_have_zero_diff() {
        let a = flat_tensor(0.4, 40);
        let diff = coarse_diff(&a, &a.clone()).unwrap();
        assert_eq!(diff.max, 0.0);
        assert_eq!(diff.mean, 0.0);
    }

    #[test]
    fn test_uniform_offset_reports_offset() {
        let a = flat_tensor(0.1, 32);
        let b = flat_tensor(0.6, 32);
        let diff = coarse_diff(&a, &b).unwrap();
        assert!((diff.max - 0.5).abs() < 1e-6);
        assert!((diff.mean - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_halving_resize_averages_neighbouring_pixels() {
        let plane = Array2::from_shape_fn((32, 32), |(_, x)| if x % 2 == 0 { 0.0 } else { 1.0 });
        let taps = axis_taps(32, 16);
        let thumb = resize_plane(plane.view(), &taps, &taps);
        assert!(thumb.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_same_size_resize_is_identity() {
        let plane = Array2::from_shape_fn((16, 16), |(y, x)| (y * 16 + x) as f32);
        let taps = axis_taps(16, 16);
        assert_eq!(resize_plane(plane.view(), &taps, &taps), plane);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = AlignedTensor::from_padded(Array4::zeros((1, 3, 32, 32)), 32, 32).unwrap();
        let b = AlignedTensor::from_padded(Array4::zeros((1, 3, 64, 32)), 64, 32).unwrap();
        assert!(coarse_diff(&a, &b).is_err());
    }

    #[test]
    fn test_classify_respects_skip_toggle_and_order() {
        let thresholds = MotionThresholds::default();
        let still = CoarseDiff {
            max: 1e-4,
            mean: 1e-5,
        };
        let chaotic = CoarseDiff {
            max: 0.9,
            mean: 0.35,
        };
        let ordinary = CoarseDiff {
            max: 0.2,
            mean: 0.05,
        };

        assert_eq!(thresholds.classify(still, true), PairAction::Skip);
        assert_eq!(thresholds.classify(still, false), PairAction::Interpolate);
        assert_eq!(thresholds.classify(chaotic, true), PairAction::Duplicate);
        assert_eq!(thresholds.classify(ordinary, true), PairAction::Interpolate);
    }
}
