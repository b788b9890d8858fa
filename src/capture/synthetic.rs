//! Emulated camera that paces frames in real time.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::frame::Frame;
use super::source::{FrameSource, SourceGeometry};
use crate::error::GrabError;
use crate::{BurstPattern, CameraConfig};

/// Free-running or burst-triggered emulated camera.
pub struct SyntheticSource {
    geometry: SourceGeometry,
    frame_interval: Duration,
    burst: Option<BurstPattern>,
    epoch: Instant,
    next_due: Instant,
    in_burst: u32,
    produced: u64,
}

impl SyntheticSource {
    pub fn new(config: &CameraConfig, frame_rate: f64) -> Self {
        let frame_interval = Duration::from_secs_f64(1.0 / frame_rate.max(f64::MIN_POSITIVE));
        let epoch = Instant::now();
        info!(
            "Synthetic camera {} at {:.1} fps, {}x{} {:?}, bursts {:?}",
            config.name, frame_rate, config.width, config.height, config.pixel_format, config.burst
        );
        Self {
            geometry: SourceGeometry {
                width: config.width,
                height: config.height,
                format: config.pixel_format,
            },
            frame_interval,
            burst: config.burst.filter(|b| b.frames > 0),
            epoch,
            next_due: epoch + frame_interval,
            in_burst: 0,
            produced: 0,
        }
    }

    fn frame_len(&self) -> usize {
        let g = &self.geometry;
        g.format.row_bytes(g.width).unwrap_or(g.width) as usize * g.height as usize
    }

    fn render(&self, due: Instant) -> Frame {
        let g = self.geometry;
        let shade = (self.produced % 256) as u8;
        let data = Bytes::from(vec![shade; self.frame_len()]);
        let timestamp_ns = due.duration_since(self.epoch).as_nanos() as i64;
        Frame::new(data, g.width, g.height, g.format, timestamp_ns)
    }
}

impl FrameSource for SyntheticSource {
    fn geometry(&self) -> SourceGeometry {
        self.geometry
    }

    fn grab(&mut self, timeout: Option<Duration>) -> Result<Frame, GrabError> {
        let due = self.next_due;
        let wait = due.saturating_duration_since(Instant::now());
        if let Some(timeout) = timeout {
            if wait > timeout {
                thread::sleep(timeout);
                return Err(GrabError::Timeout);
            }
        }
        thread::sleep(wait);

        let frame = self.render(due);
        self.produced += 1;
        self.next_due = due + self.frame_interval;

        if let Some(burst) = self.burst {
            self.in_burst += 1;
            if self.in_burst >= burst.frames {
                self.in_burst = 0;
                self.next_due += Duration::from_millis(burst.gap_ms);
                debug!("Synthetic burst complete after {} frames", self.produced);
            }
        }
        Ok(frame)
    }
}
