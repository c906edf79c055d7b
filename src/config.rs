use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::backend::InferenceBackend;

/// One up-conversion job, fully validated before any subprocess or session
/// is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Source video file.
    pub input: PathBuf,
    /// Output video file.
    pub output: PathBuf,
    /// Frame-rate multiplier (>= 1). `1` is a pass-through re-encode.
    pub times: u32,
    /// Flow estimation scale; < 1.0 trades accuracy for speed on large frames.
    pub flow_scale: f32,
    /// Output width. `0` means keep the source width.
    pub width: u32,
    /// Output height. `0` means keep the source height.
    pub height: u32,
    /// NVDEC decode and NVENC encode.
    pub hwaccel: bool,
    #[serde(default)]
    pub models: ModelPaths,
    pub backend: String,
    pub trt_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelPaths {
    pub flownet: PathBuf,
    pub fusionnet: PathBuf,
    pub rife: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            flownet: PathBuf::from("models/flownet.onnx"),
            fusionnet: PathBuf::from("models/fusionnet.onnx"),
            rife: PathBuf::from("models/rife.onnx"),
        }
    }
}

impl JobConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.times == 0 {
            bail!("times must be at least 1, got 0");
        }
        if !self.flow_scale.is_finite() || self.flow_scale <= 0.0 {
            bail!("flow_scale must be positive, got {}", self.flow_scale);
        }
        if self.flow_scale > 1.0 {
            bail!(
                "flow_scale must not exceed 1.0, got {}",
                self.flow_scale
            );
        }
        if crate::tensor::alignment_period(self.flow_scale).is_none() {
            bail!(
                "flow_scale {} admits no 64-aligned frame size; use a simple \
                 fraction such as 1.0, 0.75, 0.5, or 0.25",
                self.flow_scale
            );
        }
        if self.input == self.output {
            bail!("input and output must be different files");
        }
        Ok(())
    }

    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.backend)
    }

    /// Output resolution, falling back to the source geometry where
    /// unspecified.
    pub fn output_resolution(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        let width = if self.width == 0 {
            source_width
        } else {
            self.width
        };
        let height = if self.height == 0 {
            source_height
        } else {
            self.height
        };
        (width, height)
    }
}
