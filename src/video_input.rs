//! Source probing and decoding via FFmpeg subprocesses.
//!
//! `ffprobe` supplies the stream geometry and frame rate up front; decode is
//! a long-lived `ffmpeg` child emitting raw `rgb24` frames on stdout, one
//! fixed-size read per frame.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::types::Frame;

const FALLBACK_FPS: f64 = 23.976;

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec_name: String,
    /// Container-reported frame count; absent for some formats.
    pub frame_count: Option<u64>,
}

pub fn extract_stream_info(probe: &FfprobeOutput) -> Result<VideoStreamInfo> {
    let video_stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = video_stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video_stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = video_stream
        .r_frame_rate
        .as_deref()
        .or(video_stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = parse_frame_rate(fps_str).unwrap_or(0.0);
    if fps <= 0.0 {
        warn!("could not determine frame rate (got {fps_str}), defaulting to {FALLBACK_FPS}");
    }
    let fps = if fps <= 0.0 { FALLBACK_FPS } else { fps };

    let frame_count = video_stream
        .nb_frames
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok());

    Ok(VideoStreamInfo {
        stream_index: video_stream.index,
        width,
        height,
        fps,
        codec_name: video_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        frame_count,
    })
}

/// Probe a source file and return its primary video stream geometry.
pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    if !path.exists() {
        bail!("input file does not exist: {}", path.display());
    }
    debug!(path = %path.display(), "running ffprobe");
    let probe = run_ffprobe(path)?;
    let info = extract_stream_info(&probe)?;
    debug!(
        stream_index = info.stream_index,
        width = info.width,
        height = info.height,
        fps = info.fps,
        codec = %info.codec_name,
        frames = ?info.frame_count,
        "video input probed"
    );
    Ok(info)
}

fn build_decoder_args(path: &Path, stream_index: usize, hwaccel: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["-nostdin".to_string()];

    // FFmpeg requires -hwaccel before -i
    if hwaccel {
        args.extend(["-hwaccel".to_string(), "cuda".to_string()]);
    }

    args.push("-i".to_string());
    args.push(path.to_string_lossy().into_owned());
    args.extend([
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-fps_mode".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Decodes video to raw RGB frames via an FFmpeg subprocess, yielding one
/// frame at a time. Drains stderr in a background thread to prevent pipe
/// deadlock. Kills FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    _stderr_thread: Option<thread::JoinHandle<()>>,
    buf: Vec<u8>,
    done: bool,
}

impl VideoDecoder {
    pub fn new(path: &Path, info: &VideoStreamInfo, hwaccel: bool) -> Result<Self> {
        let frame_size = info.width as usize * info.height as usize * 3;
        let decode_args = build_decoder_args(path, info.stream_index, hwaccel);

        if hwaccel {
            debug!("NVDEC hardware decode enabled (hwaccel=cuda)");
        }

        let mut child = Command::new("ffmpeg")
            .args(&decode_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not piped"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            width: info.width,
            height: info.height,
            frame_size,
            _stderr_thread: Some(stderr_thread),
            buf: vec![0u8; frame_size],
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    if total_read == 0 {
                        return Ok(None);
                    }
                    warn!(
                        "partial frame at EOF ({total_read}/{} bytes), discarding",
                        self.frame_size
                    );
                    return Ok(None);
                }
                Ok(n) => {
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        Ok(Some(Frame {
            data: self.buf[..self.frame_size].to_vec(),
            width: self.width,
            height: self.height,
        }))
    }

    pub fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with status {}", status);
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self._stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
