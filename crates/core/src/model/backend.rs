//! ONNX Runtime session construction for the supported execution providers.

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

/// Where inference runs.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session silently falls back to the CUDA provider, and ORT itself falls
/// back to CPU when CUDA is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without execution providers");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(model_path)
                .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(error) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %error,
                    "Failed to create TensorRT engine cache directory"
                );
            }

            let cached_before = count_cache_files(cache_dir);
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = cached_before,
                "Initializing TensorRT session (engine build may take minutes on first run)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            let started = Instant::now();
            let session = with_progress_ticker(|| {
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(&cache_path)
                            .with_fp16(true)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build(),
                    ])?
                    .commit_from_file(model_path)
                    .with_context(|| {
                        format!("failed to load ONNX model: {}", model_path.display())
                    })
            })?;

            info!(
                elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
                engine_cache_updated = count_cache_files(cache_dir) > cached_before,
                "TensorRT session ready"
            );
            Ok(session)
        }
    }
}

/// Runs `build` while a side thread logs a heartbeat until it returns.
fn with_progress_ticker<T>(build: impl FnOnce() -> T) -> T {
    let (stop_tx, stop_rx) = channel::<()>();
    let ticker = thread::spawn(move || {
        let mut elapsed = 0_u64;
        loop {
            match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    elapsed += TRT_PROGRESS_TICK.as_secs();
                    info!(elapsed_secs = elapsed, "TensorRT engine build still in progress");
                }
            }
        }
    });

    let result = build();
    let _ = stop_tx.send(());
    let _ = ticker.join();
    result
}

fn count_cache_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| entry.path().is_file())
                .count()
        })
        .unwrap_or(0)
}
