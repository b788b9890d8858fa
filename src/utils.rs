//! Rate arithmetic shared by the acquisition loop and configuration.

/// Total frames to grab: `round(frame_rate × duration)`.
pub fn frame_quota(frame_rate: f64, rec_time_in_sec: f64) -> u64 {
    let quota = (frame_rate * rec_time_in_sec).round();
    if quota.is_finite() && quota > 0.0 {
        quota as u64
    } else {
        0
    }
}

/// Every how many grabbed frames one preview frame is emitted.
///
/// `None` when the preview rate is zero or negative; never less than 1 otherwise,
/// so a preview rate above the capture rate previews every frame.
pub fn frame_ratio(frame_rate: f64, display_frame_rate: f64) -> Option<u64> {
    if !(display_frame_rate > 0.0) {
        return None;
    }
    let ratio = (frame_rate / display_frame_rate).round();
    if ratio.is_finite() && ratio >= 1.0 {
        Some(ratio as u64)
    } else {
        Some(1)
    }
}

/// Diagnostic FPS reporting interval in frames; `None` disables reporting.
pub fn chunk_length_frames(chunk_length_in_sec: f64, frame_rate: f64) -> Option<u64> {
    let frames = (chunk_length_in_sec * frame_rate).round();
    if frames.is_finite() && frames >= 1.0 {
        Some(frames as u64)
    } else {
        None
    }
}

/// Frames per second over `elapsed_secs`, 0 when no time has passed.
pub fn observed_fps(frames: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        frames as f64 / elapsed_secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_rounds() {
        assert_eq!(frame_quota(100.0, 2.0), 200);
        assert_eq!(frame_quota(29.97, 10.0), 300);
        assert_eq!(frame_quota(0.0, 10.0), 0);
    }

    #[test]
    fn ratio_is_at_least_one() {
        assert_eq!(frame_ratio(100.0, 10.0), Some(10));
        assert_eq!(frame_ratio(100.0, 30.0), Some(3));
        assert_eq!(frame_ratio(10.0, 100.0), Some(1));
        assert_eq!(frame_ratio(100.0, 0.0), None);
    }

    #[test]
    fn chunk_length_disabled_below_one_frame() {
        assert_eq!(chunk_length_frames(5.0, 100.0), Some(500));
        assert_eq!(chunk_length_frames(0.0, 100.0), None);
    }
}
