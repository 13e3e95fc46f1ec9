use std::time::Instant;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::session::Session;
use ort::value::{Tensor, TensorRef};
use tracing::{debug, info};

use super::backend::{build_session, SessionConfig};
use super::FlowModel;
use crate::align::AlignedTensor;
use crate::types::CHANNELS;

const INPUT_IMG0: &str = "img0";
const INPUT_IMG1: &str = "img1";
const INPUT_TIMESTEP: &str = "timestep";
const INPUT_CONCAT: &str = "input";
const OUTPUT_NAME: &str = "output";

/// Only midpoints are ever requested; deeper levels come from recursion.
const MIDPOINT: f32 = 0.5;

/// Input layout of a flow network, detected from its input names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// `img0`, `img1` and a `[1,1,1,1]` `timestep` tensor.
    ThreeInput,
    /// One `input` tensor `[1, 7, H, W]`: both frames then a timestep plane.
    Concatenated,
}

/// Flow model backed by an ONNX Runtime session.
pub struct OnnxFlowModel {
    session: Session,
    format: ModelFormat,
    concat_buf: Option<Array4<f32>>,
}

impl OnnxFlowModel {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        if !config.model_path.is_file() {
            bail!("flow model not found: {}", config.model_path.display());
        }
        let session = build_session(config)?;
        let format = detect_model_format(&session);
        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            format = ?format,
            "Flow model loaded"
        );
        Ok(Self {
            session,
            format,
            concat_buf: None,
        })
    }

    fn run_three_input(&mut self, img0: &Array4<f32>, img1: &Array4<f32>) -> Result<ArrayD<f32>> {
        let tensor0 = TensorRef::from_array_view(img0.view())?;
        let tensor1 = TensorRef::from_array_view(img1.view())?;
        let timestep = Tensor::from_array(Array4::<f32>::from_elem((1, 1, 1, 1), MIDPOINT))?;

        let outputs = self.session.run(ort::inputs![
            INPUT_IMG0 => tensor0,
            INPUT_IMG1 => tensor1,
            INPUT_TIMESTEP => timestep
        ])?;
        Ok(outputs[OUTPUT_NAME].try_extract_array::<f32>()?.to_owned())
    }

    fn run_concatenated(&mut self, img0: &Array4<f32>, img1: &Array4<f32>) -> Result<ArrayD<f32>> {
        let (h, w) = (img0.shape()[2], img0.shape()[3]);
        let mut concat = match self.concat_buf.take() {
            Some(buf) if buf.shape() == [1, 2 * CHANNELS + 1, h, w] => buf,
            _ => Array4::<f32>::zeros((1, 2 * CHANNELS + 1, h, w)),
        };
        concat.slice_mut(s![.., 0..CHANNELS, .., ..]).assign(img0);
        concat
            .slice_mut(s![.., CHANNELS..2 * CHANNELS, .., ..])
            .assign(img1);
        concat
            .slice_mut(s![.., 2 * CHANNELS.., .., ..])
            .fill(MIDPOINT);

        let result = {
            let tensor = TensorRef::from_array_view(concat.view())?;
            let outputs = self.session.run(ort::inputs![INPUT_CONCAT => tensor])?;
            outputs[OUTPUT_NAME].try_extract_array::<f32>()?.to_owned()
        };
        self.concat_buf = Some(concat);
        Ok(result)
    }
}

impl FlowModel for OnnxFlowModel {
    fn name(&self) -> &str {
        "OnnxFlowModel"
    }

    fn infer(
        &mut self,
        frame_a: &AlignedTensor,
        frame_b: &AlignedTensor,
        _high_res: bool,
    ) -> Result<AlignedTensor> {
        if !frame_a.same_layout(frame_b) {
            bail!(
                "flow model inputs differ in layout: {:?} vs {:?}",
                frame_a.as_array().shape(),
                frame_b.as_array().shape()
            );
        }

        let started = Instant::now();
        let raw = match self.format {
            ModelFormat::ThreeInput => {
                self.run_three_input(frame_a.as_array(), frame_b.as_array())?
            }
            ModelFormat::Concatenated => {
                self.run_concatenated(frame_a.as_array(), frame_b.as_array())?
            }
        };
        let output = raw
            .into_dimensionality::<Ix4>()
            .context("flow model output is not a 4-D tensor")?;
        if output.shape() != frame_a.as_array().shape() {
            bail!(
                "flow model returned shape {:?}, expected {:?}",
                output.shape(),
                frame_a.as_array().shape()
            );
        }

        debug!(
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            format = ?self.format,
            "Flow model inference"
        );

        Ok(AlignedTensor::from_padded(
            output,
            frame_a.original_height(),
            frame_a.original_width(),
        )?)
    }
}

fn detect_model_format(session: &Session) -> ModelFormat {
    let inputs = session.inputs();
    if inputs.len() == 1 && inputs[0].name() == INPUT_CONCAT {
        ModelFormat::Concatenated
    } else {
        ModelFormat::ThreeInput
    }
}
