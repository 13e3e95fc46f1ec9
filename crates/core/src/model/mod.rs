//! Flow-model capability consumed by the interpolation scheduler.

pub mod backend;
pub mod onnx;

use anyhow::Result;

use crate::align::AlignedTensor;

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use onnx::{ModelFormat, OnnxFlowModel};

/// Estimates the temporal midpoint between two aligned frames.
///
/// Implementations must return a tensor with the same padded shape and
/// original size as their inputs, and must be deterministic for identical
/// inputs. The scheduler owns the model exclusively, so calls never overlap.
pub trait FlowModel: Send + 'static {
    fn name(&self) -> &str {
        "FlowModel"
    }

    fn infer(
        &mut self,
        frame_a: &AlignedTensor,
        frame_b: &AlignedTensor,
        high_res: bool,
    ) -> Result<AlignedTensor>;
}

impl<F> FlowModel for F
where
    F: FnMut(&AlignedTensor, &AlignedTensor, bool) -> Result<AlignedTensor> + Send + 'static,
{
    fn infer(
        &mut self,
        frame_a: &AlignedTensor,
        frame_b: &AlignedTensor,
        high_res: bool,
    ) -> Result<AlignedTensor> {
        self(frame_a, frame_b, high_res)
    }
}
