use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::scheduler::{expected_output_frames, InterpolationScheduler, SchedulerStats};
use crate::types::Frame;

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Called after every written frame with `(written, total_output, total_input)`.
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>, Option<u64>) + Send>;

pub trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        (**self).write_frame(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Horizontal slice of every source frame kept in montage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MontageWindow {
    pub left: u32,
    pub width: u32,
}

impl MontageWindow {
    /// The centered half of a frame.
    pub fn centered(frame_width: u32) -> Result<Self> {
        let width = frame_width / 2;
        if width == 0 {
            bail!("frame width {frame_width} is too narrow for montage mode");
        }
        Ok(Self {
            left: frame_width / 4,
            width,
        })
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_read: u64,
    pub frames_written: u64,
    pub pairs_interpolated: u64,
    pub pairs_duplicated: u64,
    pub pairs_skipped: u64,
    pub model_calls: u64,
    pub cancelled: bool,
}

/// Runs source, scheduler and sink as three blocking workers joined by
/// bounded queues.
pub struct InterpolationPipeline {
    queue_capacity: usize,
}

impl InterpolationPipeline {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub async fn run<S, K>(
        &self,
        source: S,
        scheduler: InterpolationScheduler,
        sink: K,
        total_input_frames: Option<u64>,
        cancel: watch::Receiver<bool>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<PipelineReport>
    where
        S: Iterator<Item = Result<Frame>> + Send + 'static,
        K: FrameSink,
    {
        if *cancel.borrow() {
            return Ok(PipelineReport {
                cancelled: true,
                ..PipelineReport::default()
            });
        }

        let montage = scheduler.config().montage;
        let total_output_frames =
            total_input_frames.map(|n| expected_output_frames(n, scheduler.config().exp));

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let (cancel_tx, _) = watch::channel(false);
        let cancel_state = Arc::new(AtomicBool::new(false));

        let external_cancel_handle =
            spawn_external_cancel_watcher(cancel, cancel_state.clone(), cancel_tx.clone());

        let (source_tx, source_rx) = mpsc::channel(self.queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(self.queue_capacity);

        let source_handle = spawn_source_stage(
            source,
            montage,
            source_tx,
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        );
        let scheduler_handle = spawn_scheduler_stage(
            scheduler,
            source_rx,
            output_tx,
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        );
        let sink_handle = spawn_sink_stage(
            sink,
            output_rx,
            total_output_frames,
            total_input_frames,
            progress_callback,
            cancel_state.clone(),
            cancel_tx.clone(),
            error_tx.clone(),
        );

        drop(error_tx);

        let mut first_error: Option<anyhow::Error> = None;
        let mut report = PipelineReport::default();

        match source_handle.await {
            Ok(frames_read) => report.frames_read = frames_read,
            Err(join_error) => {
                signal_cancel(&cancel_state, &cancel_tx);
                first_error.get_or_insert(anyhow!("source worker panicked: {join_error}"));
            }
        }
        match scheduler_handle.await {
            Ok(stats) => {
                report.pairs_interpolated = stats.pairs_interpolated;
                report.pairs_duplicated = stats.pairs_duplicated;
                report.pairs_skipped = stats.pairs_skipped;
                report.model_calls = stats.model_calls;
            }
            Err(join_error) => {
                signal_cancel(&cancel_state, &cancel_tx);
                first_error.get_or_insert(anyhow!("scheduler worker panicked: {join_error}"));
            }
        }
        match sink_handle.await {
            Ok(frames_written) => report.frames_written = frames_written,
            Err(join_error) => {
                signal_cancel(&cancel_state, &cancel_tx);
                first_error.get_or_insert(anyhow!("sink worker panicked: {join_error}"));
            }
        }

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        report.cancelled = cancel_state.load(Ordering::SeqCst);

        signal_cancel(&cancel_state, &cancel_tx);
        external_cancel_handle.abort();
        if let Err(join_error) = external_cancel_handle.await {
            if !join_error.is_cancelled() && first_error.is_none() {
                first_error = Some(anyhow!("external cancel watcher failed: {join_error}"));
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        Ok(report)
    }
}

impl Default for InterpolationPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel.borrow_and_update() {
                signal_cancel(&cancel_state, &cancel_tx);
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    })
}

// Each worker keeps its sender alive until after a failure has raised the
// cancel flag, so a closed queue downstream always means a clean end of
// stream or an already visible cancellation.

fn spawn_source_stage<S>(
    mut source: S,
    montage: bool,
    output: mpsc::Sender<Frame>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<u64>
where
    S: Iterator<Item = Result<Frame>> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        match run_source_loop(&mut source, montage, &output, &cancel_state) {
            Ok(frames_read) => frames_read,
            Err(error) => {
                report_task_error(
                    &error_tx,
                    &cancel_state,
                    &cancel_tx,
                    error.context("source stage failed"),
                );
                0
            }
        }
    })
}

fn spawn_scheduler_stage(
    mut scheduler: InterpolationScheduler,
    input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<Frame>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<SchedulerStats> {
    tokio::task::spawn_blocking(move || {
        let result = run_scheduler_loop(&mut scheduler, input, &output, &cancel_state);
        if let Err(error) = result {
            let stage_name = scheduler.model_name().to_string();
            report_task_error(
                &error_tx,
                &cancel_state,
                &cancel_tx,
                error.context(format!("scheduler stage '{stage_name}' failed")),
            );
        }
        scheduler.stats()
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_sink_stage<K>(
    mut sink: K,
    input: mpsc::Receiver<Frame>,
    total_output_frames: Option<u64>,
    total_input_frames: Option<u64>,
    progress_callback: Option<ProgressCallback>,
    cancel_state: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> JoinHandle<u64>
where
    K: FrameSink,
{
    tokio::task::spawn_blocking(move || {
        let result = run_sink_loop(
            &mut sink,
            input,
            total_output_frames,
            total_input_frames,
            progress_callback,
            &cancel_state,
        );

        match result {
            Ok(written) => {
                if let Err(error) = sink.finish().context("sink finish failed") {
                    if !cancel_state.load(Ordering::SeqCst) {
                        report_task_error(
                            &error_tx,
                            &cancel_state,
                            &cancel_tx,
                            error.context("sink stage failed while finalizing"),
                        );
                    }
                }
                written
            }
            Err(error) => {
                report_task_error(
                    &error_tx,
                    &cancel_state,
                    &cancel_tx,
                    error.context("sink stage failed"),
                );
                // Close out whatever was written before the failure.
                if let Err(finish_error) = sink.finish() {
                    tracing::debug!(error = %finish_error, "Sink finish after failure also failed");
                }
                0
            }
        }
    })
}

fn run_source_loop<S>(
    source: &mut S,
    montage: bool,
    output: &mpsc::Sender<Frame>,
    cancel_state: &AtomicBool,
) -> Result<u64>
where
    S: Iterator<Item = Result<Frame>>,
{
    let mut index = 0_u64;
    let mut window: Option<MontageWindow> = None;
    let mut total_read_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let t_read = Instant::now();
        let Some(frame_result) = source.next() else {
            break;
        };
        let mut frame = frame_result.map_err(|error| PipelineError::source_read(index, error))?;
        total_read_ms += t_read.elapsed().as_secs_f64() * 1000.0;

        if montage {
            let (width, height) = (frame.width(), frame.height());
            let crop = match window {
                Some(crop) => crop,
                None => {
                    let crop = MontageWindow::centered(width).map_err(|error| {
                        PipelineError::alignment(width, height, error.to_string())
                    })?;
                    window = Some(crop);
                    crop
                }
            };
            frame = frame
                .crop_columns(crop.left, crop.width)
                .map_err(|error| PipelineError::alignment(width, height, error.to_string()))?;
        }

        let t_send = Instant::now();
        if output.blocking_send(frame).is_err() {
            break;
        }
        total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        index = index.saturating_add(1);
    }

    if index > 0 {
        tracing::info!(
            frames = index,
            avg_read_ms = format!("{:.1}", total_read_ms / index as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / index as f64),
            total_read_ms = format!("{:.0}", total_read_ms),
            total_send_wait_ms = format!("{:.0}", total_send_ms),
            "Source stage summary"
        );
    }

    Ok(index)
}

fn run_scheduler_loop(
    scheduler: &mut InterpolationScheduler,
    mut input: mpsc::Receiver<Frame>,
    output: &mpsc::Sender<Frame>,
    cancel_state: &AtomicBool,
) -> Result<()> {
    let mut received = 0_u64;
    let mut emitted = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_schedule_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let t_recv = Instant::now();
        let Some(frame) = input.blocking_recv() else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let t_schedule = Instant::now();
        let frames = scheduler
            .push(frame)
            .with_context(|| format!("failed to schedule source frame {received}"))?;
        total_schedule_ms += t_schedule.elapsed().as_secs_f64() * 1000.0;
        received += 1;

        for frame in frames {
            let t_send = Instant::now();
            if output.blocking_send(frame).is_err() {
                return Ok(());
            }
            total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
            emitted += 1;
        }
    }

    if !cancel_state.load(Ordering::SeqCst) {
        if let Some(last) = scheduler.finish()? {
            if output.blocking_send(last).is_ok() {
                emitted += 1;
            }
        }
    }

    let stats = scheduler.stats();
    if received > 1 {
        let pairs = received - 1;
        tracing::info!(
            pairs,
            output_frames = emitted,
            interpolated = stats.pairs_interpolated,
            duplicated = stats.pairs_duplicated,
            skipped = stats.pairs_skipped,
            model_calls = stats.model_calls,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / received as f64),
            avg_schedule_ms = format!("{:.1}", total_schedule_ms / pairs as f64),
            total_schedule_ms = format!("{:.0}", total_schedule_ms),
            total_send_wait_ms = format!("{:.0}", total_send_ms),
            "Scheduler stage summary"
        );
    }

    Ok(())
}

fn run_sink_loop<K>(
    sink: &mut K,
    mut input: mpsc::Receiver<Frame>,
    total_output_frames: Option<u64>,
    total_input_frames: Option<u64>,
    progress_callback: Option<ProgressCallback>,
    cancel_state: &AtomicBool,
) -> Result<u64>
where
    K: FrameSink,
{
    let mut written = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_write_ms = 0.0_f64;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let t_recv = Instant::now();
        let Some(frame) = input.blocking_recv() else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let t_write = Instant::now();
        sink.write_frame(&frame)
            .map_err(|error| PipelineError::sink_write(written, error))?;
        total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;

        written = written.saturating_add(1);

        if let Some(callback) = progress_callback.as_ref() {
            callback(written, total_output_frames, total_input_frames);
        }
    }

    if written > 0 {
        tracing::info!(
            frames = written,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / written as f64),
            avg_write_ms = format!("{:.1}", total_write_ms / written as f64),
            total_write_ms = format!("{:.0}", total_write_ms),
            total_recv_wait_ms = format!("{:.0}", total_recv_ms),
            "Sink stage summary"
        );
    }

    Ok(written)
}

fn signal_cancel(cancel_state: &AtomicBool, cancel_tx: &watch::Sender<bool>) {
    cancel_state.store(true, Ordering::SeqCst);
    let _ = cancel_tx.send(true);
}

fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    cancel_state: &AtomicBool,
    cancel_tx: &watch::Sender<bool>,
    error: anyhow::Error,
) {
    signal_cancel(cancel_state, cancel_tx);
    let _ = error_tx.send(error);
}
