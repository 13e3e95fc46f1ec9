//! Numbered image sequences: `.png` for 8-bit frames, `.exr` for float frames.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb32FImage, RgbImage};
use tracing::{debug, info};

use super::FrameSource;
use crate::pipeline::FrameSink;
use crate::types::{Frame, SampleFormat};

/// Reads a directory of numbered frames lazily, one decode per `next()`.
///
/// `.exr` files win over `.png` files when both are present. Files are
/// ordered by the integer value of their stem, so `2.png` precedes `10.png`.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
    width: u32,
    height: u32,
    format: SampleFormat,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let (files, format) = list_sequence(dir)?;
        let first = files
            .first()
            .ok_or_else(|| anyhow!("no .png or .exr frames found in {}", dir.display()))?;
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("failed to read image header of {}", first.display()))?;

        info!(
            dir = %dir.display(),
            frames = files.len(),
            width,
            height,
            format = %format,
            "Opened image sequence"
        );

        Ok(Self {
            files,
            next: 0,
            width,
            height,
            format,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn list_sequence(dir: &Path) -> Result<(Vec<PathBuf>, SampleFormat)> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read image directory {}", dir.display()))?;

    let mut pngs = Vec::new();
    let mut exrs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("png") => pngs.push(path),
            Some("exr") => exrs.push(path),
            _ => {}
        }
    }

    let (files, format) = if exrs.is_empty() {
        (pngs, SampleFormat::U8)
    } else {
        (exrs, SampleFormat::F32)
    };

    let mut numbered = files
        .into_iter()
        .map(|path| Ok((frame_number(&path)?, path)))
        .collect::<Result<Vec<_>>>()?;
    numbered.sort_by_key(|(number, _)| *number);

    Ok((numbered.into_iter().map(|(_, path)| path).collect(), format))
}

fn frame_number(path: &Path) -> Result<u64> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    stem.parse::<u64>()
        .with_context(|| format!("frame file name is not a number: {}", path.display()))
}

fn load_frame(path: &Path, format: SampleFormat) -> Result<Frame> {
    let image =
        image::open(path).with_context(|| format!("failed to decode image {}", path.display()))?;
    let (width, height) = (image.width(), image.height());
    Ok(match format {
        SampleFormat::U8 => Frame::Rgb8 {
            data: image.to_rgb8().into_raw(),
            width,
            height,
        },
        SampleFormat::F32 => Frame::RgbF32 {
            data: image.to_rgb32f().into_raw(),
            width,
            height,
        },
    })
}

impl Iterator for ImageSequenceSource {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.files.get(self.next)?;
        self.next += 1;
        Some(load_frame(path, self.format))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.files.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl FrameSource for ImageSequenceSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn sample_format(&self) -> SampleFormat {
        self.format
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.files.len() as u64)
    }
}

/// Writes frames as `0000000.png`, `0000001.png`, ... (or `.exr`).
pub struct ImageSequenceSink {
    dir: PathBuf,
    next_index: u64,
}

impl ImageSequenceSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            next_index: 0,
        })
    }

    pub fn frame_path(&self, index: u64, format: SampleFormat) -> PathBuf {
        let extension = match format {
            SampleFormat::U8 => "png",
            SampleFormat::F32 => "exr",
        };
        self.dir.join(format!("{index:07}.{extension}"))
    }
}

impl FrameSink for ImageSequenceSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let path = self.frame_path(self.next_index, frame.sample_format());
        let saved = match frame {
            Frame::Rgb8 {
                data,
                width,
                height,
            } => {
                let image = RgbImage::from_raw(*width, *height, data.clone())
                    .ok_or_else(|| anyhow!("frame payload does not match {width}x{height}"))?;
                image.save(&path)
            }
            Frame::RgbF32 {
                data,
                width,
                height,
            } => {
                let image = Rgb32FImage::from_raw(*width, *height, data.clone())
                    .ok_or_else(|| anyhow!("frame payload does not match {width}x{height}"))?;
                image.save(&path)
            }
        };
        saved.with_context(|| format!("failed to write {}", path.display()))?;

        self.next_index += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.next_index == 0 {
            bail!("no frames were written to {}", self.dir.display());
        }
        debug!(
            dir = %self.dir.display(),
            frames = self.next_index,
            "Image sequence written"
        );
        Ok(())
    }
}
