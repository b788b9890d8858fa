//! Encoder backed by an `ffmpeg` child process reading raw frames on stdin.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};

use tracing::{debug, info, warn};

use super::{Encoder, EncoderSession, EncoderSpec};
use crate::error::EncodeError;
use crate::{EncoderConfig, GpuMake};

pub struct FfmpegEncoder {
    program: String,
}

impl FfmpegEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Concrete codec name, output pixel format and encoder arguments for the
/// configured CPU/GPU combination.
fn codec_params(spec: &EncoderSpec) -> (String, String, Vec<String>) {
    let q = spec.quality.as_str();
    let rate = spec.frame_rate.to_string();
    let rate = rate.as_str();
    let gpu = spec.gpu_id.to_string();
    let gpu = gpu.as_str();
    let pix_out = spec.pixel_format_out.as_str();
    let pick = |h264: &str, h265: &str| match spec.codec.as_str() {
        "h264" => h264.to_string(),
        "h265" => h265.to_string(),
        other => other.to_string(),
    };
    let rgb0_to = |replacement: &str| {
        if pix_out == "rgb0" {
            replacement.to_string()
        } else {
            pix_out.to_string()
        }
    };

    if spec.gpu_id < 0 {
        return (
            pick("libx264", "libx265"),
            rgb0_to("yuv420p"),
            strings(&[
                "-r:v", rate, "-preset", "fast", "-tune", "fastdecode", "-crf", q, "-bufsize",
                "20M", "-maxrate", "10M", "-bf:v", "4", "-vsync", "0",
            ]),
        );
    }

    match spec.gpu_make {
        GpuMake::Nvidia => (
            pick("h264_nvenc", "hevc_nvenc"),
            pix_out.to_string(),
            strings(&[
                "-r:v", rate, "-preset", "fast", "-qp", q, "-bf:v", "0", "-vsync", "0",
                "-2pass", "0", "-gpu", gpu,
            ]),
        ),
        GpuMake::Amd => (
            pick("h264_amf", "hevc_amf"),
            rgb0_to("yuv420p"),
            strings(&[
                "-r:v", rate, "-usage", "lowlatency", "-rc", "cqp", "-qp_i", q, "-qp_p", q,
                "-qp_b", q, "-bf:v", "0", "-hwaccel", "auto", "-hwaccel_device", gpu,
            ]),
        ),
        GpuMake::Intel => (
            pick("h264_qsv", "hevc_qsv"),
            rgb0_to("nv12"),
            strings(&["-r:v", rate, "-bf:v", "0"]),
        ),
    }
}

/// Full ffmpeg command line (without the program) for `spec`.
pub fn ffmpeg_args(spec: &EncoderSpec) -> Vec<String> {
    let (codec, pix_out, codec_args) = codec_params(spec);
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), spec.log_level.clone()];

    if spec.pixel_format_in == "mjpeg" {
        args.extend(["-f", "mjpeg"].map(String::from));
    } else {
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            spec.pixel_format_in.clone(),
            "-s".into(),
            format!("{}x{}", spec.width, spec.height),
        ]);
    }
    args.extend([
        "-r".into(),
        spec.frame_rate.to_string(),
        "-an".into(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
        "-vcodec".into(),
        codec,
        "-pix_fmt".into(),
        pix_out,
    ]);
    args.extend(codec_args);
    args.push(spec.path.display().to_string());
    args
}

impl Encoder for FfmpegEncoder {
    type Session = FfmpegSession;

    fn open(&mut self, spec: &EncoderSpec) -> Result<FfmpegSession, EncodeError> {
        if let Some(folder) = spec.path.parent() {
            fs::create_dir_all(folder).map_err(|source| EncodeError::Folder {
                path: folder.to_path_buf(),
                source,
            })?;
        }

        let args = ffmpeg_args(spec);
        debug!("{} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncodeError::Rejected("ffmpeg stdin unavailable".into()))?;

        if spec.gpu_id < 0 {
            info!("Opened {} using CPU to compress the stream", spec.path.display());
        } else {
            info!(
                "Opened {} using {:?} GPU {} to compress the stream",
                spec.path.display(),
                spec.gpu_make,
                spec.gpu_id
            );
        }

        Ok(FfmpegSession {
            child,
            stdin: Some(BufWriter::new(stdin)),
            frame_len: spec.frame_len,
            path: spec.path.clone(),
        })
    }
}

pub struct FfmpegSession {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    frame_len: Option<usize>,
    path: PathBuf,
}

impl FfmpegSession {
    fn finish(&mut self) -> Result<(), EncodeError> {
        let Some(mut stdin) = self.stdin.take() else {
            return Err(EncodeError::Closed);
        };
        let flushed = stdin.flush();
        // Closing stdin is ffmpeg's end-of-stream.
        drop(stdin);
        let status = self.child.wait()?;
        flushed?;
        if status.success() {
            Ok(())
        } else {
            Err(EncodeError::Exited(status))
        }
    }
}

impl EncoderSession for FfmpegSession {
    fn write(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if let Some(expected) = self.frame_len {
            if data.len() != expected {
                return Err(EncodeError::FrameSize {
                    expected,
                    got: data.len(),
                });
            }
        }
        let stdin = self.stdin.as_mut().ok_or(EncodeError::Closed)?;
        stdin.write_all(data)?;
        Ok(())
    }

    fn close(mut self) -> Result<(), EncodeError> {
        self.finish()
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            if let Err(err) = self.finish() {
                warn!("ffmpeg for {} did not finish cleanly: {}", self.path.display(), err);
            }
        }
    }
}
