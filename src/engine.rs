//! The interpolation engine: turns one (I0, I1, I2) window into an ordered
//! sequence of synthesized frames.
//!
//! Two flow contexts are estimated once per window (I1 toward each neighbor)
//! and reused for every sub-frame. Per-pixel distance ratio maps decide how
//! fast each pixel's timestep advances toward a neighbor; forward-warp holes
//! in the ratio maps are repaired from the un-warped complements.

use anyhow::Result;
use tracing::debug;

use crate::models::{FlowContext, FlowModel, Refiner};
use crate::tensor::{downsample_half, flow_magnitude, tensor_to_frame};
use crate::types::{Frame, Tensor};
use crate::warp::{fill_holes, softsplat, warp_coverage};

/// Added to flow magnitudes before forming ratios.
const DISTANCE_EPS: f32 = 1e-4;

pub struct InterpolationEngine {
    model: Box<dyn FlowModel>,
    refiner: Box<dyn Refiner>,
    flow_scale: f32,
    times: u32,
}

impl InterpolationEngine {
    pub fn new(
        model: Box<dyn FlowModel>,
        refiner: Box<dyn Refiner>,
        flow_scale: f32,
        times: u32,
    ) -> Self {
        debug_assert!(times >= 1);
        Self {
            model,
            refiner,
            flow_scale,
            times,
        }
    }

    pub fn times(&self) -> u32 {
        self.times
    }

    /// Interpolate one sliding-window triple. Returns exactly `times` frames
    /// ordered by increasing timestamp between I0 and I2; odd `times` include
    /// I1 itself at the center, even `times` never reproduce I1 verbatim.
    pub fn interpolate_window(
        &mut self,
        i0: &Tensor,
        i1: &Tensor,
        i2: &Tensor,
    ) -> Result<Vec<Frame>> {
        let times = self.times;
        if times == 1 {
            // Odd path with zero loop iterations: the window contributes I1 only.
            return Ok(vec![tensor_to_frame(i1)]);
        }

        let ctx10 = self.model.reuse(i1, i0, self.flow_scale)?;
        let ctx12 = self.model.reuse(i1, i2, self.flow_scale)?;

        let d10 = flow_magnitude(&ctx10.flow).mapv(|v| v + DISTANCE_EPS);
        let d12 = flow_magnitude(&ctx12.flow).mapv(|v| v + DISTANCE_EPS);
        let (drm10, drm12) = distance_ratio_maps(&d10, &d12);

        // The ratio maps are aligned with I1; reverse direction (1 - drm) and
        // warp to align them with each neighbor, repairing warp holes.
        let inv10 = drm10.mapv(|v| 1.0 - v);
        let inv12 = drm12.mapv(|v| 1.0 - v);

        let mut drm01 = softsplat(&inv10, &ctx10.flow, &ctx10.metric);
        let coverage01 = warp_coverage(&ctx10.flow, &ctx10.metric);
        fill_holes(&mut drm01, &coverage01, &inv10);

        let mut drm21 = softsplat(&inv12, &ctx12.flow, &ctx12.metric);
        let coverage21 = warp_coverage(&ctx12.flow, &ctx12.metric);
        fill_holes(&mut drm21, &coverage21, &inv12);

        let f_i0 = downsample_half(i0);
        let f_i1 = downsample_half(i1);
        let f_i2 = downsample_half(i2);
        let scale_list = [
            8.0 / self.flow_scale,
            4.0 / self.flow_scale,
            2.0 / self.flow_scale,
            1.0 / self.flow_scale,
        ];

        let steps = side_timesteps(times);
        let mut side0 = Vec::with_capacity(steps.len());
        let mut side2 = Vec::with_capacity(steps.len());

        for &t in &steps {
            let drm01r = time_scaled_ratio(t, &inv10, &ctx10);
            let drm21r = time_scaled_ratio(t, &inv12, &ctx12);

            let ts10 = downsample_half(&drm01r.mapv(|v| v * 2.0 * t));
            let correction10 = self.refiner.refine(&f_i1, &f_i0, &ts10, &scale_list)?;
            let ts12 = downsample_half(&drm21r.mapv(|v| v * 2.0 * t));
            let correction12 = self.refiner.refine(&f_i1, &f_i2, &ts12, &scale_list)?;

            let timestep0_side0 = inv10.mapv(|v| v * 2.0 * t);
            let timestep1_side0 = drm01.mapv(|v| 1.0 - v * 2.0 * t);
            side0.push(self.model.synthesize(
                i1,
                i0,
                &ctx10,
                &timestep0_side0,
                &timestep1_side0,
                &correction10,
            )?);

            let timestep0_side2 = inv12.mapv(|v| v * 2.0 * t);
            let timestep1_side2 = drm21.mapv(|v| 1.0 - v * 2.0 * t);
            side2.push(self.model.synthesize(
                i1,
                i2,
                &ctx12,
                &timestep0_side2,
                &timestep1_side2,
                &correction12,
            )?);
        }

        let mut output = Vec::with_capacity(times as usize);
        for tensor in side0.iter().rev() {
            output.push(tensor_to_frame(tensor));
        }
        if times % 2 == 1 {
            output.push(tensor_to_frame(i1));
        }
        for tensor in &side2 {
            output.push(tensor_to_frame(tensor));
        }

        debug!(
            times,
            sub_frames = output.len(),
            "window interpolation complete"
        );
        debug_assert_eq!(output.len(), times as usize);
        Ok(output)
    }
}

/// Per-side sub-frame timesteps for an interpolation factor.
///
/// Odd factors sample `t = (i+1)/times` and place I1 itself at the center;
/// even factors sample `t = (i+0.5)/times`, straddling I1 without ever
/// landing on it (avoids duplicate emission across adjacent windows).
pub fn side_timesteps(times: u32) -> Vec<f32> {
    if times % 2 == 1 {
        (0..(times - 1) / 2)
            .map(|i| (i + 1) as f32 / times as f32)
            .collect()
    } else {
        (0..times / 2)
            .map(|i| (i as f32 + 0.5) / times as f32)
            .collect()
    }
}

/// `drm10 = d10/(d10+d12)` and its complement, aligned with I1.
pub fn distance_ratio_maps(d10: &Tensor, d12: &Tensor) -> (Tensor, Tensor) {
    let total = d10 + d12;
    (d10 / &total, d12 / &total)
}

/// Warp `1 - drm` along the flow scaled by `(1 - drm) * 2 * t`, so pixels
/// closer to the opposite neighbor advance their timestep faster; holes fall
/// back to the un-warped complement.
fn time_scaled_ratio(t: f32, inv_drm: &Tensor, ctx: &FlowContext) -> Tensor {
    let factor = inv_drm.mapv(|v| v * 2.0 * t);
    let scaled_flow = &ctx.flow * &factor;

    let mut warped = softsplat(inv_drm, &scaled_flow, &ctx.metric);
    let coverage = warp_coverage(&scaled_flow, &ctx.metric);
    fill_holes(&mut warped, &coverage, inv_drm);
    warped
}
