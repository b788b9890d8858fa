//! Best-effort live preview.
//!
//! The preview drains the Display queue on whatever thread the caller picks.
//! It never pushes back on acquisition: when it is slow, the acquisition loop
//! simply drops preview frames.

pub mod decode;
#[cfg(feature = "sdl-preview")]
pub mod sdl;

use std::time::{Duration, Instant};

use flume::RecvTimeoutError;
use tracing::{debug, info, trace, warn};

use crate::capture::Frame;
use crate::error::DisplayError;
use crate::pipeline::{DisplayReceiver, StopHandle};

#[cfg(feature = "sdl-preview")]
pub use sdl::Sdl2Preview;

/// How long the preview waits for a frame before giving the sink an idle tick.
const IDLE_TICK: Duration = Duration::from_millis(50);

/// What the preview loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The user closed the preview; the session is asked to stop.
    Quit,
}

pub trait DisplaySink {
    fn show(&mut self, frame: &Frame) -> Result<Flow, DisplayError>;

    /// Called when no frame arrived for a while, so windowed sinks can
    /// keep handling events.
    fn idle(&mut self) -> Flow {
        Flow::Continue
    }
}

impl<D: DisplaySink + ?Sized> DisplaySink for Box<D> {
    fn show(&mut self, frame: &Frame) -> Result<Flow, DisplayError> {
        (**self).show(frame)
    }

    fn idle(&mut self) -> Flow {
        (**self).idle()
    }
}

/// Drain `queue` into `sink` until the acquisition side hangs up or the sink
/// quits. Returns the number of frames shown.
pub fn run_display_loop<D: DisplaySink>(
    queue: DisplayReceiver,
    mut sink: D,
    stop: &StopHandle,
) -> u64 {
    let mut shown = 0;
    let mut failures = 0u64;

    loop {
        let flow = match queue.recv_timeout(IDLE_TICK) {
            Ok(frame) => match sink.show(&frame) {
                Ok(flow) => {
                    shown += 1;
                    flow
                }
                Err(err) => {
                    if failures == 0 {
                        warn!("Preview failed to show frame {}: {}", frame.sequence(), err);
                    }
                    failures += 1;
                    Flow::Continue
                }
            },
            Err(RecvTimeoutError::Timeout) => sink.idle(),
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if flow == Flow::Quit {
            info!("Preview closed, requesting stop");
            stop.request();
            break;
        }
    }

    if failures > 0 {
        warn!("{} preview frames could not be shown", failures);
    }
    shown
}

/// Discards every preview frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn show(&mut self, _frame: &Frame) -> Result<Flow, DisplayError> {
        Ok(Flow::Continue)
    }
}

/// Headless preview: reports the preview cadence in the log.
#[derive(Debug)]
pub struct LogSink {
    interval: Duration,
    window_start: Instant,
    window_frames: u64,
    last_sequence: u64,
}

impl LogSink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            window_frames: 0,
            last_sequence: 0,
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl DisplaySink for LogSink {
    fn show(&mut self, frame: &Frame) -> Result<Flow, DisplayError> {
        trace!("preview frame {} ({:?})", frame.sequence(), frame);
        self.window_frames += 1;
        self.last_sequence = frame.sequence();

        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            debug!(
                "Preview at {:.1} fps, last frame {}",
                crate::utils::observed_fps(self.window_frames, elapsed.as_secs_f64()),
                self.last_sequence
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
        Ok(Flow::Continue)
    }
}
