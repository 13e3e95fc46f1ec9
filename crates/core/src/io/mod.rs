//! Frame sources and sinks: ffmpeg subprocesses and numbered image files.

pub mod image_sequence;
pub mod video_input;
pub mod video_output;

use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};

use anyhow::Result;

use crate::types::{Frame, SampleFormat};

pub use image_sequence::{ImageSequenceSink, ImageSequenceSource};
pub use video_input::{probe_video, VideoDecoder, VideoStreamInfo};
pub use video_output::{EncoderConfig, VideoEncoder};

/// A finite, ordered stream of frames that all share one size and format.
pub trait FrameSource: Iterator<Item = Result<Frame>> + Send + 'static {
    /// `(width, height)` of every frame this source yields.
    fn dimensions(&self) -> (u32, u32);

    fn sample_format(&self) -> SampleFormat;

    /// Frame count when the container reports one.
    fn total_frames(&self) -> Option<u64>;
}

/// Forwards a child's stderr, line by line, to `log_line` until EOF.
///
/// Keeping the pipe drained stops ffmpeg from blocking on a full stderr.
pub(crate) fn spawn_stderr_drain<R>(stderr: R, log_line: fn(&str)) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => log_line(&line),
                Err(e) => {
                    log_line(&format!("read error: {e}"));
                    break;
                }
                _ => {}
            }
        }
    })
}
