//! End-to-end runs of the interpolation pipeline over real image sequences,
//! with deterministic flow models standing in for ONNX inference.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use image::{Rgb, Rgb32FImage, RgbImage};
use tokio::sync::watch;

use tempora_core::align::AlignedTensor;
use tempora_core::error::PipelineError;
use tempora_core::io::{FrameSource, ImageSequenceSink, ImageSequenceSource};
use tempora_core::model::FlowModel;
use tempora_core::pipeline::{FrameSink, InterpolationPipeline, PipelineReport};
use tempora_core::scheduler::{expected_output_frames, InterpolationScheduler, SchedulerConfig};
use tempora_core::types::Frame;

const SIZE: u32 = 32;

fn averaging_model(calls: Arc<AtomicUsize>) -> Box<dyn FlowModel> {
    Box::new(
        move |a: &AlignedTensor, b: &AlignedTensor, _high_res: bool| -> Result<AlignedTensor> {
            calls.fetch_add(1, Ordering::SeqCst);
            let mid = (a.as_array() + b.as_array()) * 0.5;
            Ok(AlignedTensor::from_padded(
                mid,
                a.original_height(),
                a.original_width(),
            )?)
        },
    )
}

fn write_gray_pngs(dir: &Path, values: &[u8]) {
    for (index, value) in values.iter().enumerate() {
        RgbImage::from_pixel(SIZE, SIZE, Rgb([*value; 3]))
            .save(dir.join(format!("{index}.png")))
            .expect("write source png");
    }
}

fn read_first_samples(dir: &Path) -> Vec<f32> {
    ImageSequenceSource::open(dir)
        .expect("reopen output sequence")
        .map(|frame| match frame.expect("decode output frame") {
            Frame::Rgb8 { data, .. } => f32::from(data[0]),
            Frame::RgbF32 { data, .. } => data[0],
        })
        .collect()
}

async fn run_sequence(
    input: &Path,
    output: &Path,
    config: SchedulerConfig,
    model: Box<dyn FlowModel>,
) -> Result<PipelineReport> {
    let source = ImageSequenceSource::open(input)?;
    let total = source.total_frames();
    let sink = ImageSequenceSink::create(output)?;
    let scheduler = InterpolationScheduler::new(model, config)?;
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    InterpolationPipeline::new(4)
        .run(source, scheduler, sink, total, cancel_rx, None)
        .await
}

#[tokio::test]
async fn doubles_frame_rate_of_png_sequence() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_gray_pngs(&input, &[0, 40, 80, 120]);

    let calls = Arc::new(AtomicUsize::new(0));
    let report = run_sequence(
        &input,
        &output,
        SchedulerConfig::default(),
        averaging_model(calls.clone()),
    )
    .await
    .expect("pipeline should succeed");

    assert_eq!(report.frames_read, 4);
    assert_eq!(report.frames_written, 7);
    assert_eq!(report.pairs_interpolated, 3);
    assert_eq!(report.model_calls, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!report.cancelled);
    assert_eq!(
        read_first_samples(&output),
        vec![0.0, 20.0, 40.0, 60.0, 80.0, 100.0, 120.0]
    );
}

#[tokio::test]
async fn exp_two_fills_quarter_positions_in_order() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_gray_pngs(&input, &[0, 40, 80]);

    let calls = Arc::new(AtomicUsize::new(0));
    let config = SchedulerConfig {
        exp: 2,
        ..SchedulerConfig::default()
    };
    let report = run_sequence(&input, &output, config, averaging_model(calls.clone()))
        .await
        .expect("pipeline should succeed");

    assert_eq!(report.frames_written, expected_output_frames(3, 2));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(
        read_first_samples(&output),
        vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]
    );
}

#[tokio::test]
async fn static_pairs_are_dropped_when_skipping() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_gray_pngs(&input, &[10, 10, 10, 50]);

    let config = SchedulerConfig {
        skip_static: true,
        ..SchedulerConfig::default()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let report = run_sequence(&input, &output, config, averaging_model(calls.clone()))
        .await
        .expect("pipeline should succeed");

    assert_eq!(report.pairs_skipped, 2);
    assert_eq!(report.pairs_interpolated, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(read_first_samples(&output), vec![10.0, 30.0, 50.0]);
}

#[tokio::test]
async fn scene_cut_repeats_previous_frame_without_inference() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_gray_pngs(&input, &[0, 255]);

    let calls = Arc::new(AtomicUsize::new(0));
    let report = run_sequence(
        &input,
        &output,
        SchedulerConfig::default(),
        averaging_model(calls.clone()),
    )
    .await
    .expect("pipeline should succeed");

    assert_eq!(report.pairs_duplicated, 1);
    assert_eq!(report.model_calls, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(read_first_samples(&output), vec![0.0, 0.0, 255.0]);
}

#[tokio::test]
async fn float_sequences_stay_float_end_to_end() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    for (index, value) in [0.45_f32, 0.55].iter().enumerate() {
        Rgb32FImage::from_pixel(SIZE, SIZE, Rgb([*value; 3]))
            .save(input.join(format!("{index}.exr")))
            .unwrap();
    }

    let report = run_sequence(
        &input,
        &output,
        SchedulerConfig::default(),
        averaging_model(Arc::new(AtomicUsize::new(0))),
    )
    .await
    .expect("pipeline should succeed");

    assert_eq!(report.frames_written, 3);
    assert!(output.join("0000001.exr").is_file());
    let samples = read_first_samples(&output);
    assert_eq!(samples.len(), 3);
    assert!((samples[1] - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn model_failure_is_reported_with_pair_index() {
    let temp = tempfile::tempdir().unwrap();
    let input = temp.path().join("in");
    let output = temp.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_gray_pngs(&input, &[0, 20, 40]);

    let mut seen = 0;
    let model: Box<dyn FlowModel> = Box::new(
        move |a: &AlignedTensor, _b: &AlignedTensor, _high_res: bool| -> Result<AlignedTensor> {
            seen += 1;
            if seen == 2 {
                bail!("CUDA out of memory");
            }
            Ok(a.clone())
        },
    );

    let error = run_sequence(&input, &output, SchedulerConfig::default(), model)
        .await
        .expect_err("second pair should fail");

    assert!(matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::Inference { pair: 1, .. })
    ));
    assert!(format!("{error:#}").contains("CUDA out of memory"));
}

/// Records frames in memory, shared with the test through an `Arc`.
struct MemorySink {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn montage_output_is_twice_the_window_width() {
    let width = 64;
    let frames = [0_u8, 40].map(|value| {
        Ok::<_, anyhow::Error>(Frame::Rgb8 {
            data: vec![value; (width * SIZE * 3) as usize],
            width,
            height: SIZE,
        })
    });

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink: Box<dyn FrameSink> = Box::new(MemorySink {
        frames: collected.clone(),
    });
    let config = SchedulerConfig {
        montage: true,
        ..SchedulerConfig::default()
    };
    let scheduler =
        InterpolationScheduler::new(averaging_model(Arc::new(AtomicUsize::new(0))), config)
            .unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = InterpolationPipeline::default()
        .run(frames.into_iter(), scheduler, sink, Some(2), cancel_rx, None)
        .await
        .expect("pipeline should succeed");

    assert_eq!(report.frames_written, 3);
    let collected = collected.lock().unwrap();
    assert!(collected.iter().all(|frame| frame.width() == width));
    assert!(collected.iter().all(|frame| frame.height() == SIZE));
}
