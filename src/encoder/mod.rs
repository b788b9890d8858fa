//! Video encoder capability driven by the writer loop.

pub mod ffmpeg;
pub mod memory;

use std::path::PathBuf;

use crate::capture::SourceGeometry;
use crate::error::EncodeError;
use crate::{CamParams, GpuMake};

pub use ffmpeg::FfmpegEncoder;
pub use memory::{EncoderEvent, MemoryEncoder};

/// Everything needed to open one output file.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSpec {
    pub path: PathBuf,
    pub segment: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codec: String,
    pub pixel_format_in: String,
    pub pixel_format_out: String,
    pub quality: String,
    pub gpu_id: i32,
    pub gpu_make: GpuMake,
    pub log_level: String,
    /// Bytes per raw frame, when the input format has a fixed size.
    pub frame_len: Option<usize>,
}

impl EncoderSpec {
    pub fn for_segment(params: &CamParams, geometry: &SourceGeometry, segment: u32) -> Self {
        let enc = &params.encoder;
        let frame_len = geometry
            .format
            .bytes_per_pixel()
            .map(|bpp| geometry.width as usize * geometry.height as usize * bpp as usize);
        Self {
            path: params.video_path(segment),
            segment,
            width: geometry.width,
            height: geometry.height,
            frame_rate: params.recording.frame_rate,
            codec: enc.codec.clone(),
            pixel_format_in: enc
                .pixel_format_input
                .clone()
                .unwrap_or_else(|| geometry.format.ffmpeg_name().to_string()),
            pixel_format_out: enc.pixel_format_output.clone(),
            quality: enc.quality.clone(),
            gpu_id: enc.gpu_id,
            gpu_make: enc.gpu_make,
            log_level: enc.ffmpeg_log_level.clone(),
            frame_len,
        }
    }
}

/// Opens encoder sessions. Only ever called from the writer thread.
pub trait Encoder: Send {
    type Session: EncoderSession;

    fn open(&mut self, spec: &EncoderSpec) -> Result<Self::Session, EncodeError>;
}

/// One open output file.
pub trait EncoderSession: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), EncodeError>;

    /// Flush and finalize the file.
    fn close(self) -> Result<(), EncodeError>;
}
