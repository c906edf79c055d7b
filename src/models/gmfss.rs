//! GMFSS-style flow/synthesis provider backed by two ONNX sessions.
//!
//! `flownet.onnx` estimates a dense flow field, a splatting reliability
//! metric and encoder features for one frame pair; `fusionnet.onnx` blends
//! the pair at asymmetric per-pixel timesteps with a RIFE correction frame.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Ix4;
use ort::{session::Session, value::Tensor as OrtTensor};
use tracing::debug;

use crate::models::backend::{build_session, InferenceBackend, SessionConfig};
use crate::models::{FlowContext, FlowModel};
use crate::tensor::resize_tensor;
use crate::types::Tensor;

const INPUT_IMG0: &str = "img0";
const INPUT_IMG1: &str = "img1";
const INPUT_FLOW: &str = "flow";
const INPUT_METRIC: &str = "metric";
const INPUT_FEATURE: &str = "feature";
const INPUT_TIMESTEP0: &str = "timestep0";
const INPUT_TIMESTEP1: &str = "timestep1";
const INPUT_RIFE: &str = "rife";

const OUTPUT_FLOW: &str = "flow";
const OUTPUT_METRIC: &str = "metric";
const OUTPUT_FEATURE: &str = "feature";
const OUTPUT_FRAME: &str = "output";

pub struct OnnxFlowModel {
    flownet: Session,
    fusionnet: Session,
}

impl OnnxFlowModel {
    pub fn load(
        flownet_path: &Path,
        fusionnet_path: &Path,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let flownet = build_session(&SessionConfig {
            model_path: flownet_path,
            backend,
            trt_cache_dir,
        })
        .context("loading flow estimator")?;
        let fusionnet = build_session(&SessionConfig {
            model_path: fusionnet_path,
            backend,
            trt_cache_dir,
        })
        .context("loading synthesis network")?;

        Ok(Self { flownet, fusionnet })
    }
}

impl FlowModel for OnnxFlowModel {
    fn reuse(&mut self, i1: &Tensor, ix: &Tensor, scale: f32) -> Result<FlowContext> {
        let full_h = i1.shape()[2];
        let full_w = i1.shape()[3];

        // The estimator runs at `scale` resolution; displacements are mapped
        // back to full resolution afterwards.
        let (img0, img1) = if (scale - 1.0).abs() > f32::EPSILON {
            let h = (full_h as f32 * scale).round() as usize;
            let w = (full_w as f32 * scale).round() as usize;
            (resize_tensor(i1, h, w), resize_tensor(ix, h, w))
        } else {
            (i1.clone(), ix.clone())
        };

        let tensor0 = OrtTensor::from_array(img0)?;
        let tensor1 = OrtTensor::from_array(img1)?;
        let outputs = self
            .flownet
            .run(ort::inputs![INPUT_IMG0 => &tensor0, INPUT_IMG1 => &tensor1])
            .context("flow estimation failed")?;

        let mut flow = outputs[OUTPUT_FLOW]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;
        let mut metric = outputs[OUTPUT_METRIC]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;
        let mut features = outputs[OUTPUT_FEATURE]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;

        if flow.shape()[2] != full_h || flow.shape()[3] != full_w {
            flow = resize_tensor(&flow, full_h, full_w);
            flow.mapv_inplace(|v| v / scale);
            metric = resize_tensor(&metric, full_h, full_w);
            features = resize_tensor(&features, full_h, full_w);
        }

        debug!(
            height = full_h,
            width = full_w,
            scale,
            "flow context estimated"
        );

        Ok(FlowContext {
            flow,
            metric,
            features,
        })
    }

    fn synthesize(
        &mut self,
        i1: &Tensor,
        ix: &Tensor,
        ctx: &FlowContext,
        timestep0: &Tensor,
        timestep1: &Tensor,
        correction: &Tensor,
    ) -> Result<Tensor> {
        let tensor0 = OrtTensor::from_array(i1.clone())?;
        let tensor1 = OrtTensor::from_array(ix.clone())?;
        let flow = OrtTensor::from_array(ctx.flow.clone())?;
        let metric = OrtTensor::from_array(ctx.metric.clone())?;
        let feature = OrtTensor::from_array(ctx.features.clone())?;
        let ts0 = OrtTensor::from_array(timestep0.clone())?;
        let ts1 = OrtTensor::from_array(timestep1.clone())?;
        let rife = OrtTensor::from_array(correction.clone())?;

        let outputs = self
            .fusionnet
            .run(ort::inputs![
                INPUT_IMG0 => &tensor0,
                INPUT_IMG1 => &tensor1,
                INPUT_FLOW => &flow,
                INPUT_METRIC => &metric,
                INPUT_FEATURE => &feature,
                INPUT_TIMESTEP0 => &ts0,
                INPUT_TIMESTEP1 => &ts1,
                INPUT_RIFE => &rife,
            ])
            .context("frame synthesis failed")?;

        let frame = outputs[OUTPUT_FRAME]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;

        Ok(frame)
    }
}
