//! Trial segmentation from inter-arrival timing.
//!
//! Hardware triggering carries no explicit "trial over" signal. In trial mode
//! the camera is polled with a timeout equal to the inter-trial interval (ITI):
//! a timeout after at least one frame closes the trial, a timeout before any
//! frame is just waiting for the first trigger.

use std::time::Duration;

use crate::CamParams;

/// What one grab attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabEvent {
    Frame { timestamp_ns: i64 },
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The frame belongs to `segment` as its `trial_frame`-th frame (1-based).
    Continue { segment: u32, trial_frame: u64 },
    /// Segment `closed` is finished and `opened` is now active and empty.
    EndTrial { closed: u32, opened: u32 },
    /// Nothing to do; keep polling.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    /// One segment for the whole session. `poll` only bounds how long a stop
    /// request may go unnoticed; its timeouts carry no meaning.
    FreeRun { poll: Duration },
    Trial { iti: Duration },
}

#[derive(Debug, Clone)]
pub struct TrialSegmenter {
    mode: SegmentationMode,
    segment: u32,
    frames_in_segment: u64,
}

impl TrialSegmenter {
    pub fn new(mode: SegmentationMode) -> Self {
        Self {
            mode,
            segment: 0,
            frames_in_segment: 0,
        }
    }

    pub fn from_params(params: &CamParams) -> Self {
        let mode = if params.recording.trial_structure {
            SegmentationMode::Trial {
                iti: params.trial_iti(),
            }
        } else {
            SegmentationMode::FreeRun {
                poll: Duration::from_millis(params.pipeline.free_run_poll_ms),
            }
        };
        Self::new(mode)
    }

    pub fn mode(&self) -> SegmentationMode {
        self.mode
    }

    /// Timeout to pass to the next `FrameSource::grab`.
    pub fn grab_timeout(&self) -> Duration {
        match self.mode {
            SegmentationMode::FreeRun { poll } => poll,
            SegmentationMode::Trial { iti } => iti,
        }
    }

    /// Index of the active segment.
    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn frames_in_segment(&self) -> u64 {
        self.frames_in_segment
    }

    pub fn observe(&mut self, event: GrabEvent) -> Decision {
        match event {
            GrabEvent::Frame { .. } => {
                self.frames_in_segment += 1;
                Decision::Continue {
                    segment: self.segment,
                    trial_frame: self.frames_in_segment,
                }
            }
            GrabEvent::Timeout => match self.mode {
                SegmentationMode::Trial { .. } if self.frames_in_segment > 0 => {
                    let closed = self.segment;
                    self.segment += 1;
                    self.frames_in_segment = 0;
                    Decision::EndTrial {
                        closed,
                        opened: self.segment,
                    }
                }
                _ => Decision::Idle,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITI: Duration = Duration::from_millis(500);

    fn frame(ts: i64) -> GrabEvent {
        GrabEvent::Frame { timestamp_ns: ts }
    }

    #[test]
    fn free_run_never_ends_a_trial() {
        let mut seg = TrialSegmenter::new(SegmentationMode::FreeRun {
            poll: Duration::from_secs(1),
        });
        assert_eq!(seg.observe(frame(1)), Decision::Continue { segment: 0, trial_frame: 1 });
        assert_eq!(seg.observe(GrabEvent::Timeout), Decision::Idle);
        assert_eq!(seg.observe(frame(2)), Decision::Continue { segment: 0, trial_frame: 2 });
    }

    #[test]
    fn timeout_after_frames_ends_trial() {
        let mut seg = TrialSegmenter::new(SegmentationMode::Trial { iti: ITI });
        seg.observe(frame(1));
        seg.observe(frame(2));
        assert_eq!(seg.observe(GrabEvent::Timeout), Decision::EndTrial { closed: 0, opened: 1 });
        assert_eq!(seg.frames_in_segment(), 0);
        assert_eq!(seg.observe(frame(3)), Decision::Continue { segment: 1, trial_frame: 1 });
    }

    #[test]
    fn timeouts_on_an_empty_segment_are_idle() {
        let mut seg = TrialSegmenter::new(SegmentationMode::Trial { iti: ITI });
        assert_eq!(seg.observe(GrabEvent::Timeout), Decision::Idle);
        assert_eq!(seg.observe(GrabEvent::Timeout), Decision::Idle);
        assert_eq!(seg.segment(), 0);

        seg.observe(frame(1));
        seg.observe(GrabEvent::Timeout);
        assert_eq!(seg.observe(GrabEvent::Timeout), Decision::Idle);
        assert_eq!(seg.segment(), 1);
    }

    #[test]
    fn grab_timeout_follows_mode() {
        assert_eq!(TrialSegmenter::new(SegmentationMode::Trial { iti: ITI }).grab_timeout(), ITI);

        let mut params = CamParams::default();
        params.pipeline.free_run_poll_ms = 250;
        assert_eq!(
            TrialSegmenter::from_params(&params).grab_timeout(),
            Duration::from_millis(250)
        );
    }
}
