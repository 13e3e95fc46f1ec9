//! Resolution alignment around flow-model calls.
//!
//! Flow networks downsample their inputs several times, so tensor dimensions
//! must be multiples of a fixed unit. Frames are zero-padded on the bottom and
//! right edges only; the top-left origin never moves, which keeps crop-back a
//! plain `[..h, ..w]` slice.

use ndarray::{Array4, ArrayView4};

use crate::error::PipelineError;
use crate::types::{Frame, SampleFormat, CHANNELS};

pub const DEFAULT_UNIT: usize = 32;
pub const HIGH_RES_UNIT: usize = 64;

/// Normalized NCHW tensor `[1, 3, H_pad, W_pad]` plus the unpadded size.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedTensor {
    data: Array4<f32>,
    height: usize,
    width: usize,
}

impl AlignedTensor {
    /// Wraps an already padded tensor, e.g. a flow-model output.
    pub fn from_padded(
        data: Array4<f32>,
        height: usize,
        width: usize,
    ) -> Result<Self, PipelineError> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != CHANNELS || shape[2] < height || shape[3] < width {
            return Err(PipelineError::alignment(
                width as u32,
                height as u32,
                format!("tensor shape {shape:?} cannot hold the original frame"),
            ));
        }
        Ok(Self {
            data,
            height,
            width,
        })
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn original_height(&self) -> usize {
        self.height
    }

    pub fn original_width(&self) -> usize {
        self.width
    }

    pub fn padded_height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn padded_width(&self) -> usize {
        self.data.shape()[3]
    }

    /// True when both tensors describe the same padded and original geometry.
    pub fn same_layout(&self, other: &AlignedTensor) -> bool {
        self.data.shape() == other.data.shape()
            && self.height == other.height
            && self.width == other.width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aligner {
    unit: usize,
}

impl Aligner {
    pub fn new(high_res: bool) -> Self {
        Self {
            unit: if high_res { HIGH_RES_UNIT } else { DEFAULT_UNIT },
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Smallest multiples of the unit that are >= the given dimensions.
    pub fn padded_dims(&self, height: usize, width: usize) -> (usize, usize) {
        (round_up(height, self.unit), round_up(width, self.unit))
    }

    pub fn pad(&self, frame: &Frame) -> Result<AlignedTensor, PipelineError> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(PipelineError::alignment(width, height, "zero-sized frame"));
        }
        if frame.payload_len() != frame.expected_len() {
            return Err(PipelineError::alignment(
                width,
                height,
                format!(
                    "payload holds {} samples, expected {}",
                    frame.payload_len(),
                    frame.expected_len()
                ),
            ));
        }

        let (h, w) = (height as usize, width as usize);
        let (ph, pw) = self.padded_dims(h, w);
        let mut tensor = Array4::<f32>::zeros((1, CHANNELS, ph, pw));
        let plane = ph * pw;

        let out = tensor.as_slice_mut().ok_or_else(|| {
            PipelineError::alignment(width, height, "freshly allocated tensor is not contiguous")
        })?;

        match frame {
            Frame::Rgb8 { data, .. } => {
                scatter_planes(data, out, h, w, pw, plane, |v| f32::from(v) / 255.0)
            }
            Frame::RgbF32 { data, .. } => scatter_planes(data, out, h, w, pw, plane, |v| v),
        }

        Ok(AlignedTensor {
            data: tensor,
            height: h,
            width: w,
        })
    }

    /// Drops the padding and converts back to the run's sample format.
    ///
    /// 8-bit output rounds to nearest and saturates; float output is copied
    /// unchanged.
    pub fn crop(&self, tensor: &AlignedTensor, format: SampleFormat) -> Frame {
        let (h, w) = (tensor.height, tensor.width);
        let pw = tensor.padded_width();
        let plane = tensor.padded_height() * pw;
        let contiguous = tensor.data.as_standard_layout();
        let gathered;
        let samples: &[f32] = match contiguous.as_slice() {
            Some(slice) => slice,
            None => {
                gathered = contiguous.iter().copied().collect::<Vec<_>>();
                &gathered
            }
        };

        match format {
            SampleFormat::U8 => Frame::Rgb8 {
                data: gather_planes(samples, h, w, pw, plane, |v| {
                    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
                }),
                width: w as u32,
                height: h as u32,
            },
            SampleFormat::F32 => Frame::RgbF32 {
                data: gather_planes(samples, h, w, pw, plane, |v| v),
                width: w as u32,
                height: h as u32,
            },
        }
    }
}

fn round_up(value: usize, unit: usize) -> usize {
    if value == 0 {
        return 0;
    }
    ((value - 1) / unit + 1) * unit
}

fn scatter_planes<T: Copy>(
    src: &[T],
    dst: &mut [f32],
    h: usize,
    w: usize,
    pw: usize,
    plane: usize,
    convert: impl Fn(T) -> f32,
) {
    for y in 0..h {
        let src_row = &src[y * w * CHANNELS..(y + 1) * w * CHANNELS];
        let row_offset = y * pw;
        for (x, pixel) in src_row.chunks_exact(CHANNELS).enumerate() {
            for (c, &value) in pixel.iter().enumerate() {
                dst[c * plane + row_offset + x] = convert(value);
            }
        }
    }
}

fn gather_planes<T>(
    src: &[f32],
    h: usize,
    w: usize,
    pw: usize,
    plane: usize,
    convert: impl Fn(f32) -> T,
) -> Vec<T> {
    let mut out = Vec::with_capacity(h * w * CHANNELS);
    for y in 0..h {
        let row_offset = y * pw;
        for x in 0..w {
            for c in 0..CHANNELS {
                out.push(convert(src[c * plane + row_offset + x]));
            }
        }
    }
    out
}
