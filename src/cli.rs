//! Command-line entry: argument parsing, config resolution, job execution.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::engine::InterpolationEngine;
use crate::logging::{self, LoggingOptions};
use crate::models::gmfss::OnnxFlowModel;
use crate::models::rife::OnnxRefiner;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::video_input::{probe_video, VideoDecoder};
use crate::video_output::{EncoderConfig, VideoEncoder};

#[derive(Parser, Debug)]
#[command(
    name = "fluidframe",
    about = "Optical-flow video frame-rate up-conversion"
)]
pub struct Cli {
    /// TOML job config; flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short = 'i', long, help = "Source video file")]
    input: Option<PathBuf>,

    #[arg(short = 'o', long, help = "Output video file")]
    output: Option<PathBuf>,

    #[arg(
        short = 't',
        long,
        help = "Frame-rate multiplier (1 = pass-through re-encode)"
    )]
    times: Option<u32>,

    #[arg(
        long,
        value_name = "SCALE",
        help = "Flow estimation scale in (0, 1]; lower is faster on large frames"
    )]
    flow_scale: Option<f32>,

    #[arg(long, help = "Output width (default: source width)")]
    width: Option<u32>,

    #[arg(long, help = "Output height (default: source height)")]
    height: Option<u32>,

    #[arg(long, help = "Use NVDEC decode and NVENC encode")]
    hwaccel: bool,

    #[arg(long, value_name = "BACKEND", help = "Inference backend: cuda or tensorrt")]
    backend: Option<String>,

    #[arg(long, value_name = "DIR", help = "Directory holding the ONNX models")]
    models_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "TensorRT engine cache directory")]
    trt_cache_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Also write logs to daily files here")]
    log_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

impl Cli {
    fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            verbose: self.verbose,
            cli_log_filter: self.log_filter.clone(),
            rust_log_env: std::env::var("RUST_LOG").ok(),
            log_dir: self.log_dir.clone(),
        }
    }

    /// Merge the optional config file and command-line flags into one
    /// validated job. Flags win over file values.
    fn resolve_config(&self) -> Result<JobConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => JobConfig::load_from_path(path)?,
            None => {
                let Some(input) = self.input.clone() else {
                    bail!("--input is required when no --config file is given");
                };
                let Some(output) = self.output.clone() else {
                    bail!("--output is required when no --config file is given");
                };
                JobConfig {
                    input,
                    output,
                    times: 2,
                    flow_scale: 1.0,
                    width: 0,
                    height: 0,
                    hwaccel: false,
                    models: Default::default(),
                    backend: "cuda".to_string(),
                    trt_cache_dir: None,
                }
            }
        };

        if let Some(input) = self.input.clone() {
            config.input = input;
        }
        if let Some(output) = self.output.clone() {
            config.output = output;
        }
        if let Some(times) = self.times {
            config.times = times;
        }
        if let Some(flow_scale) = self.flow_scale {
            config.flow_scale = flow_scale;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if self.hwaccel {
            config.hwaccel = true;
        }
        if let Some(backend) = self.backend.clone() {
            config.backend = backend;
        }
        if let Some(dir) = self.models_dir.as_deref() {
            config.models.flownet = dir.join("flownet.onnx");
            config.models.fusionnet = dir.join("fusionnet.onnx");
            config.models.rife = dir.join("rife.onnx");
        }
        if let Some(dir) = self.trt_cache_dir.clone() {
            config.trt_cache_dir = Some(dir);
        }

        config.validate()?;
        Ok(config)
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging_options())?;
    let config = cli.resolve_config()?;
    run_job(&config).await
}

/// Probe, load models, wire the three pipeline stages, and run to
/// completion. Ctrl-C requests a cooperative shutdown.
pub async fn run_job(config: &JobConfig) -> Result<()> {
    let info = probe_video(&config.input)?;
    let (output_width, output_height) = config.output_resolution(info.width, info.height);

    info!(
        input = %config.input.display(),
        output = %config.output.display(),
        source_fps = info.fps,
        times = config.times,
        target_fps = info.fps * config.times as f64,
        width = output_width,
        height = output_height,
        flow_scale = config.flow_scale,
        backend = %config.backend(),
        "starting up-conversion"
    );

    let backend = config.backend();
    let trt_cache_dir = config.trt_cache_dir.as_deref();
    let flow_model = OnnxFlowModel::load(
        &config.models.flownet,
        &config.models.fusionnet,
        &backend,
        trt_cache_dir,
    )?;
    let refiner = OnnxRefiner::load(&config.models.rife, &backend, trt_cache_dir)?;
    let engine = InterpolationEngine::new(
        Box::new(flow_model),
        Box::new(refiner),
        config.flow_scale,
        config.times,
    );

    let decoder = VideoDecoder::new(&config.input, &info, config.hwaccel)
        .context("failed to start decoder")?;
    let encoder = VideoEncoder::new(&EncoderConfig {
        source_path: config.input.clone(),
        output_path: config.output.clone(),
        width: output_width,
        height: output_height,
        source_fps: info.fps,
        times: config.times,
        hwaccel: config.hwaccel,
    })
    .context("failed to start encoder")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            let _ = cancel_tx.send(true);
        }
    });

    let options = PipelineOptions {
        output_width,
        output_height,
        flow_scale: config.flow_scale,
        total_output_frames: info
            .frame_count
            .map(|frames| frames.saturating_mul(u64::from(config.times))),
    };

    let started = Instant::now();
    Pipeline::new()
        .run(decoder, engine, encoder, options, cancel_rx)
        .await?;

    info!(
        output = %config.output.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "up-conversion finished"
    );
    Ok(())
}
