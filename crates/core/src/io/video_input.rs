use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use super::{spawn_stderr_drain, FrameSource};
use crate::types::{Frame, SampleFormat, CHANNELS};

const FALLBACK_FPS: f64 = 25.0;

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0 && num > 0.0).then(|| num / den);
    }
    s.parse().ok().filter(|fps: &f64| *fps > 0.0)
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON output")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec_name: String,
    /// Reported frame count, or an estimate from duration and rate.
    pub total_frames: Option<u64>,
    pub has_audio: bool,
}

pub fn extract_stream_info(probe: &FfprobeOutput) -> Result<VideoStreamInfo> {
    let video_stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = video_stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video_stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = video_stream
        .avg_frame_rate
        .as_deref()
        .filter(|rate| parse_frame_rate(rate).is_some())
        .or(video_stream.r_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = match parse_frame_rate(fps_str) {
        Some(fps) => fps,
        None => {
            warn!("could not determine frame rate (got {fps_str}), defaulting to {FALLBACK_FPS}");
            FALLBACK_FPS
        }
    };

    let total_frames = video_stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| {
            let duration = video_stream
                .duration
                .as_deref()
                .or_else(|| probe.format.as_ref()?.duration.as_deref())?
                .parse::<f64>()
                .ok()?;
            (duration > 0.0).then(|| (duration * fps).round() as u64)
        });

    let has_audio = probe
        .streams
        .iter()
        .any(|stream| stream.codec_type.as_deref() == Some("audio"));

    Ok(VideoStreamInfo {
        stream_index: video_stream.index,
        width,
        height,
        fps,
        codec_name: video_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        total_frames,
        has_audio,
    })
}

pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    if !path.is_file() {
        bail!("input video does not exist: {}", path.display());
    }
    debug!(path = %path.display(), "running ffprobe");
    let info = extract_stream_info(&run_ffprobe(path)?)
        .with_context(|| format!("unsupported input video: {}", path.display()))?;
    debug!(
        stream_index = info.stream_index,
        width = info.width,
        height = info.height,
        fps = info.fps,
        codec = %info.codec_name,
        total_frames = ?info.total_frames,
        has_audio = info.has_audio,
        "video input probed"
    );
    Ok(info)
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-vsync".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Decodes a video into 8-bit RGB frames through an ffmpeg subprocess.
///
/// Frames are read lazily from ffmpeg's stdout. The child is killed on
/// [`Drop`], which also ends decoding early when a run is cancelled.
pub struct VideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    total_frames: Option<u64>,
    stderr_thread: Option<thread::JoinHandle<()>>,
    done: bool,
}

impl VideoDecoder {
    pub fn open(path: &Path, info: &VideoStreamInfo) -> Result<Self> {
        let mut command = crate::runtime::command_for("ffmpeg");
        command.args(build_decoder_args(path, info.stream_index));
        Self::spawn(command, info.width, info.height, info.total_frames)
            .context("failed to launch ffmpeg decoder, is it installed?")
    }

    fn spawn(
        mut command: Command,
        width: u32,
        height: u32,
        total_frames: Option<u64>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("cannot decode {width}x{height} video");
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            spawn_stderr_drain(stderr, |line| debug!(target: "ffmpeg_stderr", "{}", line))
        });

        Ok(Self {
            child,
            width,
            height,
            frame_size: width as usize * height as usize * CHANNELS,
            total_frames,
            stderr_thread,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut buf = vec![0_u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        Ok(Some(Frame::Rgb8 {
            data: buf,
            width: self.width,
            height: self.height,
        }))
    }

    /// Reaps ffmpeg after stdout closes. A failed exit means decoding stopped early.
    fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg decoder")?;
        if !status.success() {
            bail!("ffmpeg decoder exited with {status}");
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                self.finish().err().map(Err)
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FrameSource for VideoDecoder {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn sample_format(&self) -> SampleFormat {
        SampleFormat::U8
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "24000/1001",
                "avg_frame_rate": "24000/1001",
                "nb_frames": "1440",
                "duration": "60.060000",
                "disposition": {"default": 1}
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "disposition": {}
            }
        ],
        "format": {"duration": "60.070000"}
    }"#;

    #[test]
    fn test_extract_stream_info_basic() {
        let probe = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        let info = extract_stream_info(&probe).unwrap();

        assert_eq!(info.stream_index, 0);
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert!((info.fps - 23.976).abs() < 0.01);
        assert_eq!(info.codec_name, "h264");
        assert_eq!(info.total_frames, Some(1440));
        assert!(info.has_audio);
    }

    #[test]
    fn test_frame_count_falls_back_to_duration() {
        let json = r#"{
            "streams": [{
                "index": 0,
                "codec_type": "video",
                "width": 640, "height": 360,
                "r_frame_rate": "30/1",
                "avg_frame_rate": "30/1"
            }],
            "format": {"duration": "2.000000"}
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let info = extract_stream_info(&probe).unwrap();
        assert_eq!(info.total_frames, Some(60));
        assert!(!info.has_audio);
    }

    #[test]
    fn test_unknown_frame_rate_uses_fallback() {
        let json = r#"{
            "streams": [{
                "index": 0,
                "codec_type": "video",
                "width": 64, "height": 64,
                "r_frame_rate": "0/0",
                "avg_frame_rate": "0/0"
            }]
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let info = extract_stream_info(&probe).unwrap();
        assert_eq!(info.fps, FALLBACK_FPS);
        assert_eq!(info.total_frames, None);
    }

    #[test]
    fn test_prefers_non_attached_picture_video_stream() {
        let json = r#"{
            "streams": [
                {
                    "index": 0,
                    "codec_name": "mjpeg",
                    "codec_type": "video",
                    "width": 720, "height": 576,
                    "r_frame_rate": "90000/1",
                    "disposition": {"attached_pic": 1}
                },
                {
                    "index": 3,
                    "codec_name": "hevc",
                    "codec_type": "video",
                    "width": 1920, "height": 1080,
                    "r_frame_rate": "25/1",
                    "disposition": {"attached_pic": 0, "default": "1"}
                }
            ]
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let info = extract_stream_info(&probe).unwrap();
        assert_eq!(info.stream_index, 3);
        assert_eq!(info.width, 1920);
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "audio"}]}"#;
        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let error = extract_stream_info(&probe).unwrap_err();
        assert!(error.to_string().contains("no video stream"));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.01);
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("59.94"), Some(59.94));
        assert!(parse_frame_rate("0/0").is_none());
        assert!(parse_frame_rate("abc").is_none());
    }

    #[test]
    fn test_probe_missing_file_is_rejected() {
        let error = probe_video(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(error.to_string().contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_reads_whole_frames_and_drops_partial_tail() {
        let temp = tempfile::tempdir().unwrap();
        let raw = temp.path().join("frames.rgb");
        // Two 2x1 frames plus half of a third.
        std::fs::write(&raw, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]).unwrap();

        let mut command = Command::new("cat");
        command.arg(&raw);
        let decoder = VideoDecoder::spawn(command, 2, 1, Some(2)).unwrap();
        assert_eq!(decoder.dimensions(), (2, 1));
        assert_eq!(decoder.total_frames(), Some(2));

        let frames = decoder.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Rgb8 {
                    data: vec![1, 2, 3, 4, 5, 6],
                    width: 2,
                    height: 1
                },
                Frame::Rgb8 {
                    data: vec![7, 8, 9, 10, 11, 12],
                    width: 2,
                    height: 1
                },
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_reports_ffmpeg_failure_after_frames() {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("printf 'abcdef'; echo 'corrupt packet' >&2; exit 1");
        let decoder = VideoDecoder::spawn(command, 2, 1, Some(10)).unwrap();

        let items: Vec<Result<Frame>> = decoder.collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(frame) if frame.width() == 2));
        let error = items[1].as_ref().unwrap_err();
        assert!(error.to_string().contains("ffmpeg decoder exited"), "{error:#}");
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_clean_exit_ends_without_error() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("printf 'abcdef'");
        let decoder = VideoDecoder::spawn(command, 2, 1, Some(1)).unwrap();

        let frames = decoder.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    #[ignore]
    fn test_decode_real_video() {
        let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demo.mp4");
        let info = probe_video(&source).unwrap();
        let decoder = VideoDecoder::open(&source, &info).unwrap();
        let frames = decoder
            .take(3)
            .collect::<Result<Vec<_>>>()
            .expect("should decode 3 frames");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].width(), info.width);
    }
}
