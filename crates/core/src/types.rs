use anyhow::{bail, Result};

/// Number of interleaved channels carried by every frame (RGB).
pub const CHANNELS: usize = 3;

/// Sample representation of a run, chosen once when the source is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 8-bit integer samples (video decode, PNG sequences).
    U8,
    /// 32-bit float samples (OpenEXR sequences), passed through unscaled.
    F32,
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::U8 => write!(f, "u8"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Interleaved HWC RGB image flowing between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Rgb8 {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    RgbF32 {
        data: Vec<f32>,
        width: u32,
        height: u32,
    },
}

impl Frame {
    pub fn width(&self) -> u32 {
        match self {
            Self::Rgb8 { width, .. } | Self::RgbF32 { width, .. } => *width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Rgb8 { height, .. } | Self::RgbF32 { height, .. } => *height,
        }
    }

    pub fn sample_format(&self) -> SampleFormat {
        match self {
            Self::Rgb8 { .. } => SampleFormat::U8,
            Self::RgbF32 { .. } => SampleFormat::F32,
        }
    }

    /// Number of samples the payload must hold for the declared dimensions.
    pub fn expected_len(&self) -> usize {
        self.width() as usize * self.height() as usize * CHANNELS
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Self::Rgb8 { data, .. } => data.len(),
            Self::RgbF32 { data, .. } => data.len(),
        }
    }

    /// Keeps columns `left..left + width` of every row.
    pub fn crop_columns(&self, left: u32, width: u32) -> Result<Frame> {
        let full_width = self.width();
        if width == 0 || left.saturating_add(width) > full_width {
            bail!(
                "crop window {left}..{} exceeds frame width {full_width}",
                left.saturating_add(width)
            );
        }

        let height = self.height() as usize;
        let row = full_width as usize * CHANNELS;
        let start = left as usize * CHANNELS;
        let end = start + width as usize * CHANNELS;

        Ok(match self {
            Self::Rgb8 { data, .. } => Self::Rgb8 {
                data: gather_columns(data, height, row, start, end),
                width,
                height: height as u32,
            },
            Self::RgbF32 { data, .. } => Self::RgbF32 {
                data: gather_columns(data, height, row, start, end),
                width,
                height: height as u32,
            },
        })
    }

    /// Places `right` next to `self`, producing a frame twice as wide.
    pub fn hconcat(&self, right: &Frame) -> Result<Frame> {
        if self.height() != right.height() {
            bail!(
                "cannot concatenate frames of height {} and {}",
                self.height(),
                right.height()
            );
        }

        let height = self.height() as usize;
        let width = self.width() + right.width();

        match (self, right) {
            (Self::Rgb8 { data: left, .. }, Self::Rgb8 { data: other, .. }) => Ok(Self::Rgb8 {
                data: join_rows(left, other, height),
                width,
                height: height as u32,
            }),
            (Self::RgbF32 { data: left, .. }, Self::RgbF32 { data: other, .. }) => {
                Ok(Self::RgbF32 {
                    data: join_rows(left, other, height),
                    width,
                    height: height as u32,
                })
            }
            _ => bail!(
                "cannot concatenate {} frame with {} frame",
                self.sample_format(),
                right.sample_format()
            ),
        }
    }
}

fn gather_columns<T: Copy>(data: &[T], height: usize, row: usize, start: usize, end: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(height * (end - start));
    for y in 0..height {
        let base = y * row;
        out.extend_from_slice(&data[base + start..base + end]);
    }
    out
}

fn join_rows<T: Copy>(left: &[T], right: &[T], height: usize) -> Vec<T> {
    if height == 0 {
        return Vec::new();
    }
    let left_row = left.len() / height;
    let right_row = right.len() / height;
    let mut out = Vec::with_capacity(left.len() + right.len());
    for y in 0..height {
        out.extend_from_slice(&left[y * left_row..(y + 1) * left_row]);
        out.extend_from_slice(&right[y * right_row..(y + 1) * right_row]);
    }
    out
}
