//! Property tests for trial segmentation, rate arithmetic and the
//! acquisition ordering guarantees.

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use trialcam::capture::{ScriptStep, ScriptedSource};
use trialcam::pipeline::{
    write_queue, AcquisitionLoop, Decision, GrabEvent, SegmentationMode, TrialSegmenter, WriteMsg,
};
use trialcam::utils::{frame_quota, frame_ratio};
use trialcam::{CamParams, Frame, PixelFormat, StopHandle};

fn events() -> impl Strategy<Value = Vec<bool>> {
    // true = frame arrived, false = grab timed out
    prop::collection::vec(prop::bool::weighted(0.7), 0..200)
}

fn grab(i: usize, arrived: bool) -> GrabEvent {
    if arrived {
        GrabEvent::Frame {
            timestamp_ns: i as i64,
        }
    } else {
        GrabEvent::Timeout
    }
}

proptest! {
    #[test]
    fn free_run_has_exactly_one_segment(arrivals in events()) {
        let poll = Duration::from_secs(1);
        let mut seg = TrialSegmenter::new(SegmentationMode::FreeRun { poll });
        let mut frames = 0;
        for (i, arrived) in arrivals.iter().enumerate() {
            match seg.observe(grab(i, *arrived)) {
                Decision::Continue { segment, trial_frame } => {
                    frames += 1;
                    prop_assert_eq!(segment, 0);
                    prop_assert_eq!(trial_frame, frames);
                }
                Decision::EndTrial { .. } => prop_assert!(false, "free run ended a trial"),
                Decision::Idle => {}
            }
        }
        prop_assert_eq!(seg.segment(), 0);
    }

    #[test]
    fn trials_end_only_after_frames(arrivals in events()) {
        let iti = Duration::from_millis(500);
        let mut seg = TrialSegmenter::new(SegmentationMode::Trial { iti });
        let mut in_segment = 0u64;
        let mut ended = 0u32;
        for (i, arrived) in arrivals.iter().enumerate() {
            match seg.observe(grab(i, *arrived)) {
                Decision::Continue { segment, trial_frame } => {
                    in_segment += 1;
                    prop_assert_eq!(segment, ended);
                    prop_assert_eq!(trial_frame, in_segment);
                }
                Decision::EndTrial { closed, opened } => {
                    prop_assert!(in_segment > 0);
                    prop_assert_eq!(closed, ended);
                    prop_assert_eq!(opened, closed + 1);
                    ended += 1;
                    in_segment = 0;
                }
                Decision::Idle => prop_assert_eq!(in_segment, 0),
            }
        }
        // One trial end per run of frames that a timeout follows.
        let runs = arrivals.windows(2).filter(|w| w[0] && !w[1]).count() as u32;
        prop_assert_eq!(ended, runs);
    }

    #[test]
    fn frame_ratio_is_at_least_one(rate in 1.0f64..1000.0, display in 0.1f64..2000.0) {
        let ratio = frame_ratio(rate, display).unwrap();
        prop_assert!(ratio >= 1);
        prop_assert_eq!(ratio, ((rate / display).round() as u64).max(1));
    }

    #[test]
    fn frame_quota_rounds_rate_times_duration(rate in 1u32..500, secs in 1u32..600) {
        prop_assert_eq!(frame_quota(rate as f64, secs as f64), rate as u64 * secs as u64);
    }

    #[test]
    fn downsample_keeps_ceil_dimensions(w in 1u32..64, h in 1u32..64, factor in 1u32..6) {
        let data = Bytes::from(vec![7u8; (w * h) as usize]);
        let frame = Frame::new(data, w, h, PixelFormat::Mono8, 0);
        let small = frame.downsample(factor);
        prop_assert_eq!(small.meta.width, w.div_ceil(factor));
        prop_assert_eq!(small.meta.height, h.div_ceil(factor));
        prop_assert_eq!(small.data.len() as u32, w.div_ceil(factor) * h.div_ceil(factor));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Sequence numbers are contiguous and every `NEW_SEGMENT` sits between
    /// two trials, whatever the burst layout.
    #[test]
    fn write_queue_order_matches_trials(
        bursts in prop::collection::vec((1usize..15, 0usize..3), 1..6),
    ) {
        let mut params = CamParams::default();
        params.recording.trial_structure = true;
        params.recording.rec_time_in_sec = 1000.0;
        params.display.enabled = false;

        let stop = StopHandle::new();
        let mut source = ScriptedSource::new(2, 2, PixelFormat::Mono8);
        for (frames, gap) in &bursts {
            source = source.frames(*frames, Duration::from_millis(10));
            for _ in 0..*gap {
                source = source.step(ScriptStep::Timeout);
            }
        }
        let source = source.stop_when_exhausted(stop.clone());

        let (write_tx, write_rx) = write_queue();
        let (segment_tx, _segment_rx) = flume::unbounded();
        let report = AcquisitionLoop::new(source, &params, write_tx, None, segment_tx, stop).run();

        let mut expected_seq = 1;
        let mut segment = 0;
        let mut since_boundary = 0;
        let messages = write_rx.drain();
        for msg in &messages[..messages.len() - 1] {
            match msg {
                WriteMsg::Frame(frame) => {
                    prop_assert_eq!(frame.sequence(), expected_seq);
                    expected_seq += 1;
                    since_boundary += 1;
                }
                WriteMsg::NewSegment(n) => {
                    prop_assert!(since_boundary > 0, "NEW_SEGMENT with no frames before it");
                    segment += 1;
                    prop_assert_eq!(*n, segment);
                    since_boundary = 0;
                }
                WriteMsg::Stop => prop_assert!(false, "STOP before the end"),
            }
        }
        prop_assert!(matches!(messages.last(), Some(WriteMsg::Stop)));

        let total: usize = bursts.iter().map(|(f, _)| f).sum();
        prop_assert_eq!(report.frames_grabbed, total as u64);
        // A trailing gap ends the last trial too, leaving an empty segment.
        let closing_gaps = bursts.iter().filter(|(_, gap)| *gap > 0).count() as u32;
        prop_assert_eq!(report.new_segment_messages, closing_gaps);
    }
}
