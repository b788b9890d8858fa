//! The per-camera grab loop.
//!
//! Owns the camera for the session. Every grabbed frame gets the next global
//! sequence number, is recorded in the active segment and appended to the
//! Write queue; every `frame_ratio`-th frame also goes to the preview. Nothing
//! here waits on disk or on the encoder.

use std::mem;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::ledger::Segment;
use super::queue::{DisplaySender, Offer, WriteMsg, WriteSender};
use super::segmenter::{Decision, GrabEvent, TrialSegmenter};
use super::session::{StopHandle, StopReason};
use crate::capture::FrameSource;
use crate::utils;
use crate::CamParams;

const GRAB_BACKOFF_START: Duration = Duration::from_millis(1);

/// Counters produced by one run of the acquisition loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionReport {
    pub frames_grabbed: u64,
    /// Segments handed to the metadata writer, empty ones included.
    pub segments: u32,
    pub new_segment_messages: u32,
    pub display_frames_sent: u64,
    pub display_frames_dropped: u64,
    pub grab_errors: u64,
    pub stop_reason: StopReason,
}

pub struct AcquisitionLoop<S: FrameSource> {
    source: S,
    params: CamParams,
    segmenter: TrialSegmenter,
    write: WriteSender,
    display: Option<DisplaySender>,
    segments: flume::Sender<Segment>,
    stop: StopHandle,
}

impl<S: FrameSource> AcquisitionLoop<S> {
    pub fn new(
        source: S,
        params: &CamParams,
        write: WriteSender,
        display: Option<DisplaySender>,
        segments: flume::Sender<Segment>,
        stop: StopHandle,
    ) -> Self {
        Self {
            source,
            segmenter: TrialSegmenter::from_params(params),
            params: params.clone(),
            write,
            display,
            segments,
            stop,
        }
    }

    pub fn run(mut self) -> AcquisitionReport {
        if let Some(core) = self.params.pipeline.pin_acquisition_core {
            pin_to_core(core);
        }

        let name = self.params.camera.name.clone();
        let quota = self.params.frame_quota();
        let frame_ratio = self.params.frame_ratio();
        let downsample = self.params.display.downsample;
        let chunk = self.params.chunk_length_frames();
        let backoff_max = Duration::from_millis(self.params.pipeline.grab_error_backoff_max_ms);

        info!(
            "Camera {} acquiring {} frames ({:?})",
            name,
            quota,
            self.segmenter.mode()
        );

        let mut display = self.display.take();
        let mut segment = Segment::new(0);
        let mut sequence: u64 = 0;
        let mut chunk_start = Instant::now();
        let mut backoff = GRAB_BACKOFF_START;
        let mut report = AcquisitionReport {
            frames_grabbed: 0,
            segments: 0,
            new_segment_messages: 0,
            display_frames_sent: 0,
            display_frames_dropped: 0,
            grab_errors: 0,
            stop_reason: StopReason::Requested,
        };

        let reason = loop {
            if self.stop.is_requested() {
                break StopReason::Requested;
            }
            if sequence >= quota {
                break StopReason::QuotaReached;
            }

            let timeout = self.segmenter.grab_timeout();
            let frame = match self.source.grab(Some(timeout)) {
                Ok(frame) => {
                    backoff = GRAB_BACKOFF_START;
                    Some(frame)
                }
                Err(err) if err.is_timeout() => None,
                Err(err) if err.is_fatal() => {
                    error!("Camera {}: {}", name, err);
                    break StopReason::Fatal(err.to_string());
                }
                Err(err) => {
                    report.grab_errors += 1;
                    metrics::counter!("grab_errors").increment(1);
                    warn!("Camera {} grab failed: {}, retrying in {:?}", name, err, backoff);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(backoff_max);
                    continue;
                }
            };

            let Some(frame) = frame else {
                // A stop raised while waiting wins over the trial end the timeout implies.
                if self.stop.is_requested() {
                    break StopReason::Requested;
                }
                if let Decision::EndTrial { closed, opened } =
                    self.segmenter.observe(GrabEvent::Timeout)
                {
                    if self.write.push(WriteMsg::NewSegment(opened)).is_err() {
                        break StopReason::Fatal("write queue disconnected".into());
                    }
                    report.new_segment_messages += 1;
                    let mut finished = mem::replace(&mut segment, Segment::new(opened));
                    finished.ended_by_trial = true;
                    info!("Camera {} trial {} ended after {} frames", name, closed, finished.len());
                    self.persist(finished, &mut report);
                }
                continue;
            };

            let timestamp_ns = frame.timestamp_ns();
            self.segmenter.observe(GrabEvent::Frame { timestamp_ns });
            sequence += 1;
            let frame = frame.sequenced(sequence);
            segment.record(sequence, timestamp_ns);
            report.frames_grabbed += 1;
            metrics::counter!("frames_grabbed").increment(1);

            let offered = match (display.as_ref(), frame_ratio) {
                (Some(tx), Some(ratio)) if sequence % ratio == 0 => {
                    Some(tx.offer(frame.downsample(downsample)))
                }
                _ => None,
            };
            match offered {
                Some(Offer::Sent) => {
                    report.display_frames_sent += 1;
                    metrics::counter!("display_frames_sent").increment(1);
                }
                Some(Offer::Dropped) => {
                    report.display_frames_dropped += 1;
                    metrics::counter!("display_frames_dropped").increment(1);
                }
                Some(Offer::Closed) => {
                    debug!("Preview closed, no more display frames for camera {}", name);
                    display = None;
                }
                None => {}
            }

            if self.write.push(WriteMsg::Frame(frame)).is_err() {
                break StopReason::Fatal("write queue disconnected".into());
            }

            if let Some(chunk) = chunk {
                if sequence % chunk == 0 {
                    let fps = utils::observed_fps(chunk, chunk_start.elapsed().as_secs_f64());
                    let backlog = self.write.backlog();
                    info!(
                        "Camera {} collected {} frames at {:.0} fps ({} queued for writing)",
                        name, sequence, fps, backlog
                    );
                    metrics::gauge!("observed_fps").set(fps);
                    metrics::gauge!("write_backlog").set(backlog as f64);
                    chunk_start = Instant::now();
                }
            }
        };

        info!("Camera {} stopping: {}", name, reason);
        if self.write.push(WriteMsg::Stop).is_err() {
            warn!("Camera {}: writer already gone, STOP not delivered", name);
        }
        self.persist(segment, &mut report);
        if let Err(err) = self.source.close() {
            warn!("Camera {} did not close cleanly: {}", name, err);
        }

        report.stop_reason = reason;
        report
    }

    /// Hand a closed segment to the metadata writer.
    fn persist(&self, segment: Segment, report: &mut AcquisitionReport) {
        report.segments += 1;
        let index = segment.index;
        if self.segments.send(segment).is_err() {
            error!("Metadata writer is gone, segment {} is not saved", index);
        }
    }
}

fn pin_to_core(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("Could not enumerate CPU cores, acquisition thread not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!("Acquisition thread pinned to core {}", core)
        }
        _ => warn!("Failed to pin acquisition thread to core {}", core),
    }
}
