//! Model collaborator contracts and their ONNX-backed providers.
//!
//! The interpolation engine only depends on the two traits here; the concrete
//! providers ([`gmfss::OnnxFlowModel`], [`rife::OnnxRefiner`]) wrap
//! `ort::Session`s built by [`backend::build_session`]. Tests substitute
//! lightweight mock implementations.

pub mod backend;
pub mod gmfss;
pub mod rife;

use anyhow::Result;

use crate::types::Tensor;

/// Flow, reliability metric and feature pyramid estimated for one frame pair,
/// reusable across every sub-frame computation within a window.
pub struct FlowContext {
    /// Dense displacement field from the middle frame toward the neighbor,
    /// `[1, 2, H, W]`.
    pub flow: Tensor,
    /// Per-pixel splatting confidence, `[1, 1, H, W]`.
    pub metric: Tensor,
    /// Encoder features consumed by [`FlowModel::synthesize`].
    pub features: Tensor,
}

/// Optical-flow estimation plus flow-based frame synthesis.
pub trait FlowModel: Send {
    /// Estimate flow/metric/features from `i1` toward `ix` once per pair.
    fn reuse(&mut self, i1: &Tensor, ix: &Tensor, scale: f32) -> Result<FlowContext>;

    /// Blend `i1` toward `ix` at asymmetric per-pixel timesteps, guided by a
    /// previously estimated [`FlowContext`] and a half-resolution correction
    /// frame from the refinement network. Returns a `[1, 3, H, W]` frame.
    fn synthesize(
        &mut self,
        i1: &Tensor,
        ix: &Tensor,
        ctx: &FlowContext,
        timestep0: &Tensor,
        timestep1: &Tensor,
        correction: &Tensor,
    ) -> Result<Tensor>;
}

/// Refinement network producing a low-artifact correction frame at a
/// per-pixel (not scalar) timestep.
pub trait Refiner: Send {
    /// `f_i1` and `f_ix` are the 2x-downsampled middle/neighbor frames;
    /// `timestep` is a `[1, 1, H/2, W/2]` per-pixel timestep map and
    /// `scale_list` the multiscale schedule. Returns a half-resolution
    /// `[1, 3, H/2, W/2]` correction frame.
    fn refine(
        &mut self,
        f_i1: &Tensor,
        f_ix: &Tensor,
        timestep: &Tensor,
        scale_list: &[f32; 4],
    ) -> Result<Tensor>;
}
