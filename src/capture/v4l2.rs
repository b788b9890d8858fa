//! V4L2 frame source with memory-mapped buffers

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, SourceGeometry};
use crate::error::GrabError;
use crate::CameraConfig;

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    geometry: SourceGeometry,
    path: String,
}

impl V4l2Capture {
    /// Open and configure the device named in `config` (auto-detect when empty).
    pub fn new(config: &CameraConfig, frame_rate: f64) -> Result<Self, GrabError> {
        let (path, format) = if config.device.is_empty() {
            auto_detect_device()?
        } else {
            (config.device.clone(), config.pixel_format)
        };
        info!("Initializing V4L2 capture: {} ({:?})", path, format);

        let device = Device::with_path(&path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(GrabError::Lost(format!("{path} does not support video capture")));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc_for(format)
            .ok_or_else(|| GrabError::Lost(format!("unsupported V4L2 pixel format {format:?}")))?;
        let fmt = device.set_format(&fmt)?;
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Device negotiated {}x{} instead of {}x{}",
                fmt.width, fmt.height, config.width, config.height
            );
        }

        if frame_rate >= 1.0 {
            let params = v4l::video::capture::Parameters::with_fps(frame_rate.round() as u32);
            if let Err(err) = device.set_params(&params) {
                warn!("Failed to set {} fps on {}: {}", frame_rate, path, err);
            }
        }

        Ok(Self {
            device: Box::new(device),
            stream: None,
            geometry: SourceGeometry {
                width: fmt.width,
                height: fmt.height,
                format,
            },
            path,
        })
    }

    /// Start streaming with memory-mapped buffers
    pub fn start_stream(&mut self) -> Result<(), GrabError> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)?;
        self.stream = Some(stream);
        info!("Capture stream started on {} with {} buffers", self.path, BUFFER_COUNT);
        Ok(())
    }
}

impl FrameSource for V4l2Capture {
    fn geometry(&self) -> SourceGeometry {
        self.geometry
    }

    #[instrument(skip(self), level = "trace")]
    fn grab(&mut self, timeout: Option<Duration>) -> Result<Frame, GrabError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GrabError::Lost("stream not started".into()))?;

        match timeout {
            Some(timeout) => stream.set_timeout(timeout),
            None => stream.clear_timeout(),
        }

        let (buf, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);
        let timestamp_ns =
            meta.timestamp.sec as i64 * 1_000_000_000 + meta.timestamp.usec as i64 * 1_000;

        let g = self.geometry;
        Ok(Frame::new(data, g.width, g.height, g.format, timestamp_ns))
    }

    fn close(&mut self) -> Result<(), GrabError> {
        if self.stream.take().is_some() {
            info!("Capture stream on {} closed", self.path);
        }
        Ok(())
    }
}

fn fourcc_for(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mjpeg => Some(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Some(FourCC::new(b"YUYV")),
        PixelFormat::Mono8 => Some(FourCC::new(b"GREY")),
        PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Some(FourCC::new(b"BGR3")),
        PixelFormat::BayerBggr8 => Some(FourCC::new(b"BA81")),
        PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
        PixelFormat::Bgra => None,
    }
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<(String, PixelFormat), GrabError> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        // Prefer devices with MJPEG support
        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok((path, PixelFormat::Mjpeg));
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    info!("Found YUYV device: {} - {}", path, caps.card);
                    return Ok((path, PixelFormat::Yuyv4));
                }
            }
        }
    }

    Err(GrabError::Lost("no suitable capture device found".into()))
}
