//! Per-segment frame bookkeeping and its persisted form.
//!
//! Each closed segment produces two independent artifacts in the camera folder:
//! - `frametimes-t{n}.npy`: a `(2, frames)` float64 table, row 0 the global
//!   frame numbers, row 1 the timestamps in seconds since the segment's first frame.
//! - `metadata-t{n}.csv`: flat, fully quoted key/value rows with the session
//!   parameters and segment summary.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::MetadataError;
use crate::CamParams;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const NPY_ALIGN: usize = 64;

/// Bookkeeping for one contiguous recording unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: u32,
    /// Global, session-wide frame numbers.
    pub frame_numbers: Vec<u64>,
    /// 1-based frame numbers within this segment.
    pub trial_frame_numbers: Vec<u64>,
    /// Seconds since this segment's first frame.
    pub timestamps: Vec<f64>,
    /// Capture timestamp of the first frame, in nanoseconds.
    pub first_grab_ns: Option<i64>,
    /// Closed because the trial ended rather than because the session stopped.
    pub ended_by_trial: bool,
}

impl Segment {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            frame_numbers: Vec::new(),
            trial_frame_numbers: Vec::new(),
            timestamps: Vec::new(),
            first_grab_ns: None,
            ended_by_trial: false,
        }
    }

    /// Append a frame; returns its 1-based number within the segment.
    pub fn record(&mut self, sequence: u64, timestamp_ns: i64) -> u64 {
        let first = *self.first_grab_ns.get_or_insert(timestamp_ns);
        let trial_frame = self.frame_numbers.len() as u64 + 1;
        self.frame_numbers.push(sequence);
        self.trial_frame_numbers.push(trial_frame);
        self.timestamps.push((timestamp_ns - first) as f64 / 1e9);
        trial_frame
    }

    pub fn is_empty(&self) -> bool {
        self.frame_numbers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frame_numbers.len()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timestamps.last().copied().unwrap_or(0.0)
    }

    /// Average rate over the intervals between frames.
    pub fn average_fps(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if self.len() > 1 && elapsed > 0.0 {
            (self.len() - 1) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn first_grab_secs(&self) -> Option<f64> {
        self.first_grab_ns.map(|ns| ns as f64 / 1e9)
    }

    /// 1 on the last frame of a segment that a trial end closed, 0 elsewhere.
    pub fn newfile_flags(&self) -> Vec<u8> {
        let mut flags = vec![0; self.len()];
        if self.ended_by_trial {
            if let Some(last) = flags.last_mut() {
                *last = 1;
            }
        }
        flags
    }
}

/// Result of flushing one segment.
#[derive(Debug)]
pub enum FlushOutcome {
    /// The segment never received a frame; nothing was written.
    Skipped { segment: u32 },
    Written {
        segment: u32,
        frames: usize,
        frametimes: Result<PathBuf, MetadataError>,
        metadata: Result<PathBuf, MetadataError>,
    },
}

impl FlushOutcome {
    pub fn segment(&self) -> u32 {
        match self {
            FlushOutcome::Skipped { segment } | FlushOutcome::Written { segment, .. } => *segment,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            FlushOutcome::Written {
                frametimes: Ok(_),
                metadata: Ok(_),
                ..
            }
        )
    }
}

/// Persists closed segments next to the video files.
#[derive(Debug, Clone)]
pub struct MetadataLedger {
    params: CamParams,
}

impl MetadataLedger {
    pub fn new(params: &CamParams) -> Self {
        Self {
            params: params.clone(),
        }
    }

    /// Write both artifacts for `segment`. Each write is attempted on its own;
    /// a failure of one does not prevent the other.
    pub fn flush(&self, segment: &Segment) -> FlushOutcome {
        if segment.is_empty() {
            info!("Segment {} has no frames, nothing to save", segment.index);
            return FlushOutcome::Skipped {
                segment: segment.index,
            };
        }

        info!(
            "Camera {} saved {} frames at {:.0} fps (segment {})",
            self.params.camera.name,
            segment.len(),
            segment.average_fps(),
            segment.index
        );

        let frametimes_path = self.params.frametimes_path(segment.index);
        let frametimes = write_frametimes(&frametimes_path, segment).map(|_| frametimes_path);
        if let Err(err) = &frametimes {
            error!("Failed to save frametimes for segment {}: {}", segment.index, err);
        }

        let metadata_path = self.params.metadata_path(segment.index);
        let metadata = self.write_metadata(&metadata_path, segment).map(|_| metadata_path);
        if let Err(err) = &metadata {
            error!("Failed to save metadata for segment {}: {}", segment.index, err);
        }

        metrics::counter!("segments_closed").increment(1);
        FlushOutcome::Written {
            segment: segment.index,
            frames: segment.len(),
            frametimes,
            metadata,
        }
    }

    fn write_metadata(&self, path: &Path, segment: &Segment) -> Result<(), MetadataError> {
        ensure_parent(path)?;
        let mut wtr = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_path(path)?;

        for (key, value) in self.params.metadata_rows() {
            wtr.write_record([key, value])?;
        }

        let first = segment.frame_numbers.first().copied().unwrap_or(0);
        let last = segment.frame_numbers.last().copied().unwrap_or(0);
        let rows = [
            ("segment", segment.index.to_string()),
            ("totalFrames", segment.len().to_string()),
            ("totalTime", segment.elapsed_secs().to_string()),
            ("averageFps", segment.average_fps().to_string()),
            (
                "grabtimeFirstframe",
                segment.first_grab_secs().map(|s| s.to_string()).unwrap_or_default(),
            ),
            ("firstFrameNumber", first.to_string()),
            ("lastFrameNumber", last.to_string()),
            ("newfile", list(&segment.newfile_flags())),
            ("frameNumber", list(&segment.frame_numbers)),
            ("frameNumberThisTrial", list(&segment.trial_frame_numbers)),
            ("timeStamp", list(&segment.timestamps)),
        ];
        for (key, value) in rows {
            wtr.write_record([key, value.as_str()])?;
        }
        wtr.flush().map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn list<T: Display>(values: &[T]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

fn ensure_parent(path: &Path) -> Result<(), MetadataError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| MetadataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Write the `(2, n)` frame-number/timestamp table as NumPy `.npy` v1.0.
pub fn write_frametimes(path: &Path, segment: &Segment) -> Result<(), MetadataError> {
    let io_err = |source: std::io::Error| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    };
    ensure_parent(path)?;

    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': (2, {}), }}",
        segment.len()
    );
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    out.write_all(NPY_MAGIC).map_err(io_err)?;
    out.write_all(&[1, 0]).map_err(io_err)?;
    out.write_all(&(header.len() as u16).to_le_bytes()).map_err(io_err)?;
    out.write_all(header.as_bytes()).map_err(io_err)?;
    for n in &segment.frame_numbers {
        out.write_all(&(*n as f64).to_le_bytes()).map_err(io_err)?;
    }
    for t in &segment.timestamps {
        out.write_all(&t.to_le_bytes()).map_err(io_err)?;
    }
    out.flush().map_err(io_err)
}

/// Load a table written by [`write_frametimes`]: `(frame numbers, timestamps)`.
pub fn read_frametimes(path: &Path) -> Result<(Vec<u64>, Vec<f64>), MetadataError> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let bad = |msg: &str| MetadataError::Format(msg.to_string());
    if !bytes.starts_with(NPY_MAGIC) || bytes.len() < 10 {
        return Err(bad("missing npy magic"));
    }
    if bytes[6] != 1 {
        return Err(bad("unsupported npy version"));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    let header = bytes
        .get(10..data_start)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| bad("truncated header"))?;
    if !header.contains("'descr': '<f8'") || !header.contains("'fortran_order': False") {
        return Err(bad("expected C-ordered <f8 data"));
    }
    let shape = header
        .split("'shape': (")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .ok_or_else(|| bad("missing shape"))?;
    let dims: Vec<usize> = shape
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| bad("bad shape")))
        .collect::<Result<_, _>>()?;
    let n = match dims.as_slice() {
        [2, n] => *n,
        _ => return Err(bad("expected shape (2, n)")),
    };

    let values: Vec<f64> = bytes[data_start..]
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    if values.len() != 2 * n {
        return Err(bad("data length does not match shape"));
    }
    let frames = values[..n].iter().map(|v| *v as u64).collect();
    Ok((frames, values[n..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_in(dir: &Path) -> CamParams {
        let mut params = CamParams::default();
        params.recording.video_folder = dir.to_path_buf();
        params.camera.name = "cam".into();
        params
    }

    fn segment(index: u32, first_seq: u64, n: u64) -> Segment {
        let mut seg = Segment::new(index);
        for i in 0..n {
            seg.record(first_seq + i, 5_000_000_000 + i as i64 * 10_000_000);
        }
        seg
    }

    #[test]
    fn record_resets_clock_per_segment() {
        let seg = segment(2, 31, 3);
        assert_eq!(seg.frame_numbers, vec![31, 32, 33]);
        assert_eq!(seg.trial_frame_numbers, vec![1, 2, 3]);
        assert_eq!(seg.timestamps, vec![0.0, 0.01, 0.02]);
        assert_eq!(seg.first_grab_secs(), Some(5.0));
        assert!((seg.average_fps() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn newfile_marks_last_frame_of_a_trial() {
        let mut seg = segment(0, 1, 3);
        assert_eq!(seg.newfile_flags(), vec![0, 0, 0]);
        seg.ended_by_trial = true;
        assert_eq!(seg.newfile_flags(), vec![0, 0, 1]);
    }

    #[test]
    fn empty_segment_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetadataLedger::new(&params_in(dir.path()));
        let outcome = ledger.flush(&Segment::new(4));
        assert!(matches!(outcome, FlushOutcome::Skipped { segment: 4 }));
        assert!(!dir.path().join("cam").exists());
    }

    #[test]
    fn frametimes_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frametimes-t0.npy");
        let mut seg = Segment::new(0);
        for (i, ts) in [0_i64, 9_999_937, 20_000_001, 1_234_567_891].iter().enumerate() {
            seg.record(100 + i as u64, *ts);
        }
        write_frametimes(&path, &seg).unwrap();

        let bytes = fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % NPY_ALIGN, 0);

        let (frames, times) = read_frametimes(&path).unwrap();
        assert_eq!(frames, seg.frame_numbers);
        assert_eq!(times, seg.timestamps);
    }

    #[test]
    fn metadata_rows_are_quoted_key_values() {
        let dir = tempfile::tempdir().unwrap();
        let params = params_in(dir.path());
        let ledger = MetadataLedger::new(&params);
        let outcome = ledger.flush(&segment(1, 11, 2));
        assert!(outcome.is_complete());

        let text = fs::read_to_string(params.metadata_path(1)).unwrap();
        assert!(text.contains("\"cameraName\",\"cam\""));
        assert!(text.contains("\"totalFrames\",\"2\""));
        assert!(text.contains("\"frameNumber\",\"[11, 12]\""));
        assert!(text.lines().all(|l| l.starts_with('"') && l.ends_with('"')));
    }

    #[test]
    fn one_artifact_failing_does_not_block_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let params = params_in(dir.path());
        fs::create_dir_all(params.frametimes_path(0)).unwrap();

        let outcome = MetadataLedger::new(&params).flush(&segment(0, 1, 2));
        match outcome {
            FlushOutcome::Written {
                frametimes,
                metadata,
                ..
            } => {
                assert!(frametimes.is_err());
                assert!(metadata.is_ok());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
