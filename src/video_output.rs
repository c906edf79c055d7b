//! Encode sink: FFmpeg subprocess receiving raw RGB frames on stdin.
//!
//! The encode command takes two inputs, the frame pipe and the original
//! source file, so the source audio track is muxed into the output alongside
//! the up-converted video. The output frame rate is the source rate times the
//! interpolation multiplier.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::pipeline::FrameSink;
use crate::types::Frame;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Path to the original source file (for audio muxing).
    pub source_path: PathBuf,
    /// Path to the output file.
    pub output_path: PathBuf,
    /// Output video width.
    pub width: u32,
    /// Output video height.
    pub height: u32,
    /// Source frame rate.
    pub source_fps: f64,
    /// Interpolation multiplier; output rate is `source_fps * times`.
    pub times: u32,
    /// Use NVENC instead of libx264.
    pub hwaccel: bool,
}

impl EncoderConfig {
    pub fn output_fps(&self) -> f64 {
        self.source_fps * self.times as f64
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let size = format!("{}x{}", self.width, self.height);
        let fps = format!("{:.6}", self.output_fps());

        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            size,
            "-r".into(),
            fps,
            "-i".into(),
            "pipe:0".into(),
            "-i".into(),
            self.source_path.to_string_lossy().into_owned(),
            "-map".into(),
            "0:v".into(),
            // `?` so audio-less sources do not fail the mux
            "-map".into(),
            "1:a?".into(),
        ];

        if self.hwaccel {
            args.extend([
                "-c:v".into(),
                "h264_nvenc".into(),
                "-preset".into(),
                "p7".into(),
            ]);
        } else {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "medium".into(),
            ]);
        }

        args.extend([
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-qp".into(),
            "16".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "320k".into(),
            "-v".into(),
            "error".into(),
        ]);

        args.push(self.output_path.to_string_lossy().into_owned());
        args
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// FFmpeg encode subprocess. Accepts raw RGB frames via stdin pipe, drains
/// stderr in a background thread, kills FFmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();
        let frame_size = config.frame_size();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not piped"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        debug!(
            width = config.width,
            height = config.height,
            fps = config.output_fps(),
            hwaccel = config.hwaccel,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            frame_size,
        })
    }

    /// Frame data must be exactly `width * height * 3` bytes.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;

        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;

        Ok(())
    }

    /// Close stdin and wait for FFmpeg to flush the container.
    pub fn wait(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;

        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }

        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!("FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_raw(&frame.data)
    }

    fn finish(&mut self) -> Result<()> {
        self.wait()
    }
}
