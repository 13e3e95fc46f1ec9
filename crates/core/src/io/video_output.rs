//! Video encoding through an ffmpeg subprocess fed with raw RGB on stdin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use super::spawn_stderr_drain;
use crate::pipeline::FrameSink;
use crate::types::{Frame, CHANNELS};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// Source whose audio streams are copied into the output, if any.
    pub audio_source: Option<PathBuf>,
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format_fps(self.fps),
            "-i".into(),
            "pipe:0".into(),
        ];

        if let Some(audio_source) = &self.audio_source {
            args.extend([
                "-i".into(),
                audio_source.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a?".into(),
                "-c:a".into(),
                "copy".into(),
            ]);
        }

        args.extend([
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            self.output_path.to_string_lossy().into_owned(),
        ]);

        args
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }
}

/// Shortest decimal form ffmpeg accepts for `-r`.
fn format_fps(fps: f64) -> String {
    let text = format!("{fps:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// `{stem}_{2^exp}X_{fps}fps.{ext}` next to the source video.
pub fn default_video_output(source: &Path, exp: u32, fps: f64, extension: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = extension.trim_start_matches('.');
    let name = format!("{stem}_{}X_{}fps.{extension}", 1_u64 << exp, fps.round() as u64);
    source.with_file_name(name)
}

/// ffmpeg encode subprocess. Drains stderr in a background thread and kills
/// ffmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        if let Some(parent) = config.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
        }

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr_thread = child.stderr.take().map(|stderr| {
            spawn_stderr_drain(stderr, |line| {
                debug!(target: "ffmpeg_encode_stderr", "{}", line)
            })
        });

        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            codec = %config.codec,
            crf = config.crf,
            pix_fmt = %config.pixel_format,
            audio = config.audio_source.is_some(),
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread,
            frame_size: config.frame_size(),
        })
    }

    /// Frame data must be exactly `width * height * 3` bytes.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;
        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.stdin.is_none() && self.stderr_thread.is_none() {
            return Ok(());
        }
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!("FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Rgb8 { data, .. } => self.write_raw(data),
            Frame::RgbF32 { data, .. } => {
                let quantized: Vec<u8> = data
                    .iter()
                    .map(|v| (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8)
                    .collect();
                self.write_raw(&quantized)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        VideoEncoder::finish(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> EncoderConfig {
        EncoderConfig {
            output_path: PathBuf::from("out/clip_2X_60fps.mp4"),
            audio_source: None,
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            width: 1280,
            height: 720,
            fps: 59.94,
        }
    }

    #[test]
    fn test_ffmpeg_args_basic_structure() {
        let args = default_config().build_ffmpeg_args();
        assert_eq!(
            args,
            vec![
                "-nostdin", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s", "1280x720", "-r",
                "59.94", "-i", "pipe:0", "-c:v", "libx264", "-crf", "18", "-pix_fmt", "yuv420p",
                "out/clip_2X_60fps.mp4",
            ]
        );
    }

    #[test]
    fn test_ffmpeg_args_map_optional_audio() {
        let config = EncoderConfig {
            audio_source: Some(PathBuf::from("clip.mp4")),
            ..default_config()
        };
        let args = config.build_ffmpeg_args();

        let second_input = args.iter().rposition(|a| a == "-i").unwrap();
        assert_eq!(args[second_input + 1], "clip.mp4");
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 1:a? -c:a copy"));
        assert_eq!(args.last().map(String::as_str), Some("out/clip_2X_60fps.mp4"));
    }

    #[test]
    fn test_format_fps_trims_trailing_zeros() {
        assert_eq!(format_fps(60.0), "60");
        assert_eq!(format_fps(47.952), "47.952");
        assert_eq!(format_fps(24000.0 / 1001.0 * 2.0), "47.952048");
    }

    #[test]
    fn test_default_video_output_name() {
        let path = default_video_output(Path::new("/videos/clip.mkv"), 2, 95.904, "mp4");
        assert_eq!(path, PathBuf::from("/videos/clip_4X_96fps.mp4"));

        let path = default_video_output(Path::new("clip.mov"), 1, 50.0, ".mov");
        assert_eq!(path, PathBuf::from("clip_2X_50fps.mov"));
    }

    #[cfg(unix)]
    #[test]
    fn test_frame_sink_writes_through_mock_encoder() {
        let mut child = std::process::Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn mock encoder process");

        let stdin = child.stdin.take().expect("mock child stdin must be piped");
        let mut encoder = VideoEncoder {
            child,
            stdin: Some(stdin),
            stderr_thread: None,
            frame_size: 6,
        };

        let frame = Frame::Rgb8 {
            data: vec![0, 1, 2, 3, 4, 5],
            width: 1,
            height: 2,
        };
        let float_frame = Frame::RgbF32 {
            data: vec![0.0, 0.5, 1.0, 1.5, -0.2, 0.25],
            width: 2,
            height: 1,
        };
        let wrong_size = Frame::Rgb8 {
            data: vec![0; 3],
            width: 1,
            height: 1,
        };

        FrameSink::write_frame(&mut encoder, &frame).expect("8-bit frame should be accepted");
        FrameSink::write_frame(&mut encoder, &float_frame).expect("float frame is quantized");
        assert!(FrameSink::write_frame(&mut encoder, &wrong_size).is_err());
        FrameSink::finish(&mut encoder).expect("mock encoder should finish successfully");
        FrameSink::finish(&mut encoder).expect("second finish is a no-op");
    }
}
