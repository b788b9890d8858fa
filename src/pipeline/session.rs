//! Session orchestration: one acquisition thread, one writer thread and one
//! metadata thread per camera, connected by queues.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, instrument, warn};

use super::acquisition::{AcquisitionLoop, AcquisitionReport};
use super::ledger::{FlushOutcome, MetadataLedger, Segment};
use super::queue::{display_queue, write_queue, DisplayReceiver, QueueSnapshot, QueueStats};
use super::writer::{WriterLoop, WriterReport};
use crate::capture::FrameSource;
use crate::display::{run_display_loop, DisplaySink};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::CamParams;

/// Cooperative stop request, observed by the acquisition loop between grabs.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    QuotaReached,
    /// Camera lost or a queue consumer vanished.
    Fatal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::QuotaReached => f.write_str("frame quota reached"),
            StopReason::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// End-of-session outcome.
#[derive(Debug)]
pub struct SessionReport {
    pub frames_grabbed: u64,
    pub segments: u32,
    pub new_segment_messages: u32,
    pub display_frames_sent: u64,
    pub display_frames_dropped: u64,
    pub grab_errors: u64,
    pub stop_reason: StopReason,
    pub writer: WriterReport,
    pub metadata: Vec<FlushOutcome>,
    pub write_queue: QueueSnapshot,
    /// All zero when the preview is disabled.
    pub display_queue: QueueSnapshot,
}

impl SessionReport {
    /// Segments whose metadata was actually written.
    pub fn saved_segments(&self) -> usize {
        self.metadata
            .iter()
            .filter(|o| matches!(o, FlushOutcome::Written { .. }))
            .count()
    }

    /// Every segment with frames persisted both artifacts.
    pub fn metadata_complete(&self) -> bool {
        self.metadata
            .iter()
            .all(|o| matches!(o, FlushOutcome::Skipped { .. }) || o.is_complete())
    }
}

/// A running camera session.
pub struct Pipeline {
    stop: StopHandle,
    display: Option<DisplayReceiver>,
    write_stats: QueueStats,
    display_stats: Option<QueueStats>,
    acquisition: JoinHandle<AcquisitionReport>,
    writer: JoinHandle<WriterReport>,
    metadata: JoinHandle<Vec<FlushOutcome>>,
}

impl Pipeline {
    pub fn spawn<S, E>(params: &CamParams, source: S, encoder: E) -> Result<Self>
    where
        S: FrameSource + 'static,
        E: Encoder + 'static,
    {
        Self::spawn_with_stop(params, source, encoder, StopHandle::new())
    }

    /// Like [`Pipeline::spawn`], observing an existing stop handle.
    #[instrument(skip_all, fields(camera = %params.camera.name))]
    pub fn spawn_with_stop<S, E>(
        params: &CamParams,
        source: S,
        encoder: E,
        stop: StopHandle,
    ) -> Result<Self>
    where
        S: FrameSource + 'static,
        E: Encoder + 'static,
    {
        params.validate()?;
        let name = params.camera.name.clone();
        let geometry = source.geometry();
        info!(
            "Starting session: {}x{} {:?}, trial structure {}",
            geometry.width, geometry.height, geometry.format, params.recording.trial_structure
        );

        let (write_tx, write_rx) = write_queue();
        let write_stats = write_tx.stats();
        let (display_tx, display_rx) = match params.frame_ratio() {
            Some(_) => {
                let (tx, rx) = display_queue(params.display.queue_depth);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let display_stats = display_tx.as_ref().map(|tx| tx.stats());
        let (segment_tx, segment_rx) = flume::unbounded::<Segment>();

        let ledger = MetadataLedger::new(params);
        let metadata = spawn_named(format!("{name}-metadata"), "metadata", move || {
            segment_rx.iter().map(|segment| ledger.flush(&segment)).collect::<Vec<_>>()
        })?;

        let writer = WriterLoop::new(encoder, params, geometry, write_rx);
        let writer = spawn_named(format!("{name}-writer"), "writer", move || writer.run())?;

        let acquisition =
            AcquisitionLoop::new(source, params, write_tx, display_tx, segment_tx, stop.clone());
        let acquisition = match spawn_named(format!("{name}-acquisition"), "acquisition", move || {
            acquisition.run()
        }) {
            Ok(handle) => handle,
            Err(err) => {
                // The writer and metadata threads end once their senders are dropped.
                warn!("Acquisition thread failed to start for camera {}", name);
                return Err(err);
            }
        };

        Ok(Self {
            stop,
            display: display_rx,
            write_stats,
            display_stats,
            acquisition,
            writer,
            metadata,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The preview stream. `None` when the preview is disabled or already taken.
    pub fn display_queue(&mut self) -> Option<DisplayReceiver> {
        self.display.take()
    }

    /// Wait for all threads. Acquisition ends first and its `STOP` drains the writer.
    pub fn join(self) -> Result<SessionReport> {
        drop(self.display);
        let acquisition = self.acquisition.join().map_err(|_| Error::Panicked("acquisition"))?;
        let writer = self.writer.join().map_err(|_| Error::Panicked("writer"))?;
        let metadata = self.metadata.join().map_err(|_| Error::Panicked("metadata"))?;

        let report = SessionReport {
            frames_grabbed: acquisition.frames_grabbed,
            segments: acquisition.segments,
            new_segment_messages: acquisition.new_segment_messages,
            display_frames_sent: acquisition.display_frames_sent,
            display_frames_dropped: acquisition.display_frames_dropped,
            grab_errors: acquisition.grab_errors,
            stop_reason: acquisition.stop_reason,
            writer,
            metadata,
            write_queue: self.write_stats.snapshot(),
            display_queue: self
                .display_stats
                .map(|stats| stats.snapshot())
                .unwrap_or_default(),
        };
        info!(
            "Session finished ({}): {} frames grabbed, {} written, {} segments saved",
            report.stop_reason,
            report.frames_grabbed,
            report.writer.frames_written,
            report.saved_segments()
        );
        Ok(report)
    }
}

fn spawn_named<T, F>(thread_name: String, name: &'static str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(thread_name)
        .spawn(f)
        .map_err(|source| Error::Thread { name, source })
}

/// Run a whole session. The preview runs on the calling thread, so sinks
/// bound to one thread (SDL windows) work; the call returns once every
/// pipeline thread has finished.
pub fn run_session<S, E, D>(
    params: &CamParams,
    source: S,
    encoder: E,
    sink: D,
    stop: StopHandle,
) -> Result<SessionReport>
where
    S: FrameSource + 'static,
    E: Encoder + 'static,
    D: DisplaySink,
{
    let mut pipeline = Pipeline::spawn_with_stop(params, source, encoder, stop)?;
    if let Some(queue) = pipeline.display_queue() {
        let shown = run_display_loop(queue, sink, &pipeline.stop_handle());
        info!("Preview showed {} frames", shown);
    }
    pipeline.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, ScriptedSource};
    use crate::display::NullSink;
    use crate::encoder::MemoryEncoder;
    use std::time::Duration;

    #[test]
    fn stop_handle_is_shared_between_clones() {
        let stop = StopHandle::new();
        let other = stop.clone();
        assert!(!other.is_requested());
        stop.request();
        assert!(other.is_requested());
    }

    #[test]
    fn session_without_preview_runs_to_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = CamParams::default();
        params.recording.video_folder = dir.path().to_path_buf();
        params.recording.frame_rate = 100.0;
        params.recording.rec_time_in_sec = 0.2;
        params.display.enabled = false;

        let source =
            ScriptedSource::new(4, 4, PixelFormat::Mono8).frames(40, Duration::from_millis(10));
        let encoder = MemoryEncoder::new();
        let mut pipeline = Pipeline::spawn(&params, source, encoder.clone()).unwrap();
        assert!(pipeline.display_queue().is_none());

        let report = pipeline.join().unwrap();
        assert_eq!(report.stop_reason, StopReason::QuotaReached);
        assert_eq!(report.frames_grabbed, 20);
        assert_eq!(report.writer.frames_written, 20);
        assert_eq!(report.write_queue.enqueued, 21);
        assert_eq!(report.display_queue, QueueSnapshot::default());
        assert!(report.metadata_complete());
        assert_eq!(encoder.frames_per_file(), vec![20]);
    }

    #[test]
    fn invalid_params_are_rejected_before_threads_start() {
        let mut params = CamParams::default();
        params.recording.frame_rate = 0.0;
        let source = ScriptedSource::new(4, 4, PixelFormat::Mono8);
        let err = run_session(&params, source, MemoryEncoder::new(), NullSink, StopHandle::new());
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
