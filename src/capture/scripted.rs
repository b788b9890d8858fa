//! Deterministic frame source replaying a fixed script of grab outcomes.
//!
//! No sleeping happens: an inter-trial gap is written as one or more
//! `Timeout` steps, which is exactly what a triggered camera reports when the
//! trigger goes quiet for longer than the grab timeout.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, SourceGeometry};
use crate::error::GrabError;
use crate::pipeline::StopHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Frame { timestamp_ns: i64 },
    Timeout,
    Incomplete,
    Error(String),
    Lost(String),
}

pub struct ScriptedSource {
    geometry: SourceGeometry,
    steps: VecDeque<ScriptStep>,
    clock_ns: i64,
    stop_on_exhaust: Option<StopHandle>,
}

impl ScriptedSource {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            geometry: SourceGeometry { width, height, format },
            steps: VecDeque::new(),
            clock_ns: 0,
            stop_on_exhaust: None,
        }
    }

    /// `count` frames spaced `interval` apart on the script clock.
    pub fn frames(mut self, count: usize, interval: Duration) -> Self {
        let step = interval.as_nanos() as i64;
        for _ in 0..count {
            self.clock_ns += step;
            self.steps.push_back(ScriptStep::Frame {
                timestamp_ns: self.clock_ns,
            });
        }
        self
    }

    /// A silent period reported as `timeouts` consecutive grab timeouts.
    pub fn gap(mut self, timeouts: usize, duration: Duration) -> Self {
        self.clock_ns += duration.as_nanos() as i64;
        self.steps
            .extend(std::iter::repeat(ScriptStep::Timeout).take(timeouts));
        self
    }

    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push_back(step);
        self
    }

    /// Raise `stop` once the script runs dry instead of timing out forever.
    pub fn stop_when_exhausted(mut self, stop: StopHandle) -> Self {
        self.stop_on_exhaust = Some(stop);
        self
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    fn frame_at(&self, timestamp_ns: i64) -> Frame {
        let g = self.geometry;
        let len = g.format.row_bytes(g.width).unwrap_or(g.width) as usize * g.height as usize;
        let fill = (timestamp_ns / 1_000 % 256) as u8;
        Frame::new(Bytes::from(vec![fill; len]), g.width, g.height, g.format, timestamp_ns)
    }
}

impl FrameSource for ScriptedSource {
    fn geometry(&self) -> SourceGeometry {
        self.geometry
    }

    fn grab(&mut self, _timeout: Option<Duration>) -> Result<Frame, GrabError> {
        match self.steps.pop_front() {
            Some(ScriptStep::Frame { timestamp_ns }) => Ok(self.frame_at(timestamp_ns)),
            Some(ScriptStep::Timeout) => Err(GrabError::Timeout),
            Some(ScriptStep::Incomplete) => Err(GrabError::Incomplete { status: -1 }),
            Some(ScriptStep::Error(msg)) => Err(GrabError::Device(msg)),
            Some(ScriptStep::Lost(msg)) => Err(GrabError::Lost(msg)),
            None => {
                if let Some(stop) = &self.stop_on_exhaust {
                    stop.request();
                }
                Err(GrabError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_frames_then_gaps() {
        let mut source = ScriptedSource::new(2, 2, PixelFormat::Mono8)
            .frames(2, Duration::from_millis(10))
            .gap(1, Duration::from_secs(1))
            .frames(1, Duration::from_millis(10));

        assert_eq!(source.grab(None).unwrap().timestamp_ns(), 10_000_000);
        assert_eq!(source.grab(None).unwrap().timestamp_ns(), 20_000_000);
        assert!(matches!(source.grab(None), Err(GrabError::Timeout)));
        assert_eq!(source.grab(None).unwrap().timestamp_ns(), 1_030_000_000);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn exhaustion_raises_stop() {
        let stop = StopHandle::new();
        let mut source =
            ScriptedSource::new(1, 1, PixelFormat::Mono8).stop_when_exhausted(stop.clone());
        assert!(source.grab(None).is_err());
        assert!(stop.is_requested());
    }
}
