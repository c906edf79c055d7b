//! RIFE-style refinement provider: single concatenated `[1, 7, H, W]` input
//! where channels are `[img0_rgb(3) + img1_rgb(3) + timestep(1)]`, plus a
//! 4-element multiscale schedule tensor. The timestep channel carries a full
//! per-pixel map rather than one broadcast scalar.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{s, Array1, Array4, Ix4};
use ort::{session::Session, value::TensorRef};

use crate::models::backend::{build_session, InferenceBackend, SessionConfig};
use crate::models::Refiner;
use crate::types::Tensor;

const INPUT_CONCAT: &str = "input";
const INPUT_SCALE_LIST: &str = "scale_list";
const OUTPUT_NAME: &str = "output";

pub struct OnnxRefiner {
    session: Session,
    /// Reusable [1,7,H,W] buffer — avoids reallocating the concatenated
    /// input for every sub-frame inference.
    concat_buf: Option<Array4<f32>>,
}

impl OnnxRefiner {
    pub fn load(
        model_path: &Path,
        backend: &InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir,
        })
        .context("loading refinement network")?;

        Ok(Self {
            session,
            concat_buf: None,
        })
    }
}

impl Refiner for OnnxRefiner {
    fn refine(
        &mut self,
        f_i1: &Tensor,
        f_ix: &Tensor,
        timestep: &Tensor,
        scale_list: &[f32; 4],
    ) -> Result<Tensor> {
        let h = f_i1.shape()[2];
        let w = f_i1.shape()[3];
        let target_shape = [1, 7, h, w];

        let mut concat = match self.concat_buf.take() {
            Some(buf) if buf.shape() == target_shape => buf,
            _ => Array4::<f32>::zeros((1, 7, h, w)),
        };

        concat.slice_mut(s![.., 0..3, .., ..]).assign(f_i1);
        concat.slice_mut(s![.., 3..6, .., ..]).assign(f_ix);
        concat.slice_mut(s![.., 6..7, .., ..]).assign(timestep);

        let scales = Array1::from(scale_list.to_vec());

        let input = TensorRef::from_array_view(concat.view())?;
        let scales_tensor = ort::value::Tensor::from_array(scales)?;

        let outputs = self
            .session
            .run(ort::inputs![INPUT_CONCAT => input, INPUT_SCALE_LIST => &scales_tensor])
            .context("refinement inference failed")?;

        let frame = outputs[OUTPUT_NAME]
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix4>()?;

        self.concat_buf = Some(concat);
        Ok(frame)
    }
}
