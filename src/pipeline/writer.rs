//! Write-queue consumer that owns the encoder session lifecycle.

use std::thread;
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use super::queue::{WriteMsg, WriteReceiver};
use crate::capture::SourceGeometry;
use crate::encoder::{Encoder, EncoderSession, EncoderSpec};
use crate::{CamParams, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub idle_wait: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl From<&PipelineConfig> for WriterConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            idle_wait: Duration::from_millis(config.writer_idle_wait_ms.max(1)),
            retry_initial: Duration::from_millis(config.open_retry_initial_ms),
            retry_max: Duration::from_millis(config.open_retry_max_ms),
        }
    }
}

/// What the writer did over the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub files_opened: u32,
    pub frames_written: u64,
    pub write_errors: u64,
    pub open_failures: u32,
    pub close_errors: u32,
    /// A `STOP` was received, as opposed to the queue disconnecting.
    pub stopped: bool,
}

pub struct WriterLoop<E: Encoder> {
    encoder: E,
    params: CamParams,
    geometry: SourceGeometry,
    config: WriterConfig,
    queue: WriteReceiver,
}

struct OpenFile<S> {
    session: S,
    segment: u32,
    frames: u64,
}

impl<E: Encoder> WriterLoop<E> {
    pub fn new(
        encoder: E,
        params: &CamParams,
        geometry: SourceGeometry,
        queue: WriteReceiver,
    ) -> Self {
        Self {
            encoder,
            params: params.clone(),
            geometry,
            config: WriterConfig::from(&params.pipeline),
            queue,
        }
    }

    pub fn with_config(mut self, config: WriterConfig) -> Self {
        self.config = config;
        self
    }

    /// Consume the Write queue until `STOP` (or until the producer disappears).
    pub fn run(mut self) -> WriterReport {
        let mut report = WriterReport::default();
        let mut file = self.open(0, &mut report);

        loop {
            match self.queue.pop(self.config.idle_wait) {
                Ok(WriteMsg::Frame(frame)) => match file.session.write(&frame.data) {
                    Ok(()) => {
                        file.frames += 1;
                        report.frames_written += 1;
                        metrics::counter!("frames_written").increment(1);
                    }
                    Err(err) => {
                        if report.write_errors == 0 {
                            error!("Failed to write frame {}: {}", frame.sequence(), err);
                        }
                        report.write_errors += 1;
                    }
                },
                Ok(WriteMsg::NewSegment(segment)) => {
                    info!(
                        "Closing + reopening video writer for camera {} (segment {})",
                        self.params.camera.name, segment
                    );
                    self.close(file, &mut report);
                    file = self.open(segment, &mut report);
                }
                Ok(WriteMsg::Stop) => {
                    info!(
                        "STOP received, closing video writer for camera {}",
                        self.params.camera.name
                    );
                    self.close(file, &mut report);
                    report.stopped = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Write queue closed without STOP, closing video writer");
                    self.close(file, &mut report);
                    break;
                }
            }
        }

        if report.write_errors > 0 {
            warn!("{} frames failed to write", report.write_errors);
        }
        report
    }

    /// Open the file for `segment`, retrying with capped exponential backoff
    /// until it succeeds. Frames wait in the Write queue meanwhile.
    fn open(&mut self, segment: u32, report: &mut WriterReport) -> OpenFile<E::Session> {
        let spec = EncoderSpec::for_segment(&self.params, &self.geometry, segment);
        let mut delay = self.config.retry_initial;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.encoder.open(&spec) {
                Ok(session) => {
                    report.files_opened += 1;
                    debug!("Writing segment {} to {}", segment, spec.path.display());
                    return OpenFile {
                        session,
                        segment,
                        frames: 0,
                    };
                }
                Err(err) => {
                    report.open_failures += 1;
                    metrics::counter!("encoder_open_retries").increment(1);
                    warn!(
                        "Opening {} failed (attempt {}), retrying in {:?}: {}",
                        spec.path.display(),
                        attempt,
                        delay,
                        err
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(self.config.retry_max);
                }
            }
        }
    }

    fn close(&self, file: OpenFile<E::Session>, report: &mut WriterReport) {
        match file.session.close() {
            Ok(()) => info!("Closed segment {} after {} frames", file.segment, file.frames),
            Err(err) => {
                report.close_errors += 1;
                error!("Closing segment {} failed: {}", file.segment, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};
    use crate::encoder::{EncoderEvent, MemoryEncoder};
    use crate::pipeline::queue::write_queue;
    use bytes::Bytes;

    fn geometry() -> SourceGeometry {
        SourceGeometry {
            width: 2,
            height: 2,
            format: PixelFormat::Mono8,
        }
    }

    fn frame(seq: u64) -> WriteMsg {
        let frame = Frame::new(Bytes::from_static(&[1; 4]), 2, 2, PixelFormat::Mono8, 0);
        WriteMsg::Frame(frame.sequenced(seq))
    }

    fn fast() -> WriterConfig {
        WriterConfig {
            idle_wait: Duration::from_millis(1),
            retry_initial: Duration::from_millis(1),
            retry_max: Duration::from_millis(2),
        }
    }

    #[test]
    fn new_segment_rotates_files_in_queue_order() {
        let (tx, rx) = write_queue();
        for msg in [frame(1), frame(2), WriteMsg::NewSegment(1), frame(3), WriteMsg::Stop] {
            tx.push(msg).unwrap();
        }
        let encoder = MemoryEncoder::new();
        let report = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast())
            .run();

        assert!(report.stopped);
        assert_eq!(report.files_opened, 2);
        assert_eq!(report.frames_written, 3);
        assert_eq!(encoder.frames_per_file(), vec![2, 1]);
        assert_eq!(
            encoder.events()[3],
            EncoderEvent::Close { segment: 0, frames: 2 }
        );
        let names: Vec<_> = encoder
            .opened_paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["emuvideo-t0.mp4", "emuvideo-t1.mp4"]);
    }

    #[test]
    fn open_failures_are_retried() {
        let (tx, rx) = write_queue();
        tx.push(frame(1)).unwrap();
        tx.push(WriteMsg::Stop).unwrap();
        let encoder = MemoryEncoder::new().fail_next_opens(2);
        let report = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast())
            .run();

        assert_eq!(report.open_failures, 2);
        assert_eq!(report.frames_written, 1);
    }

    #[test]
    fn long_open_outage_loses_no_frames() {
        let (tx, rx) = write_queue();
        for seq in 1..=5 {
            tx.push(frame(seq)).unwrap();
        }
        tx.push(WriteMsg::Stop).unwrap();
        let encoder = MemoryEncoder::new().fail_next_opens(20);
        let report = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast())
            .run();

        assert!(report.stopped);
        assert_eq!(report.open_failures, 20);
        assert_eq!(report.files_opened, 1);
        assert_eq!(report.frames_written, 5);
        assert_eq!(encoder.frames_per_file(), vec![5]);
    }

    #[test]
    fn failed_reopen_keeps_the_next_segment_frames() {
        let (tx, rx) = write_queue();
        tx.push(frame(1)).unwrap();
        let encoder = MemoryEncoder::new();
        let writer = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast());
        let handle = thread::spawn(move || writer.run());

        // Let segment 0 open before arming the failures for segment 1.
        while encoder.opened_paths().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        let encoder = encoder.fail_next_opens(4);
        tx.push(WriteMsg::NewSegment(1)).unwrap();
        tx.push(frame(2)).unwrap();
        tx.push(frame(3)).unwrap();
        tx.push(WriteMsg::Stop).unwrap();

        let report = handle.join().unwrap();
        assert_eq!(report.open_failures, 4);
        assert_eq!(report.frames_written, 3);
        assert_eq!(encoder.frames_per_file(), vec![1, 2]);
    }

    #[test]
    fn waits_on_an_empty_queue_until_stop() {
        let (tx, rx) = write_queue();
        let encoder = MemoryEncoder::new();
        let writer = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast());
        let handle = thread::spawn(move || writer.run());

        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        tx.push(frame(1)).unwrap();
        tx.push(WriteMsg::Stop).unwrap();

        let report = handle.join().unwrap();
        assert!(report.stopped);
        assert_eq!(report.frames_written, 1);
    }

    #[test]
    fn disconnect_without_stop_still_closes_the_file() {
        let (tx, rx) = write_queue();
        tx.push(frame(1)).unwrap();
        drop(tx);
        let encoder = MemoryEncoder::new();
        let report = WriterLoop::new(encoder.clone(), &CamParams::default(), geometry(), rx)
            .with_config(fast())
            .run();
        assert!(!report.stopped);
        assert_eq!(encoder.frames_per_file(), vec![1]);
    }
}
