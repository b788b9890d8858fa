pub mod capture;
pub mod display;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{BackendKind, Frame, FrameSource, PixelFormat};
pub use error::{ConfigError, Error, Result};
pub use pipeline::{run_session, Pipeline, SessionReport, StopHandle, StopReason};

/// Environment prefix for configuration overrides, e.g.
/// `TRIALCAM__RECORDING__FRAME_RATE=200`.
pub const ENV_PREFIX: &str = "TRIALCAM";

/// Per-camera session configuration.
///
/// Read-only for the lifetime of a recording session; every pipeline stage
/// borrows or clones the parts it needs at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamParams {
    pub camera: CameraConfig,
    pub recording: RecordingConfig,
    pub display: DisplayConfig,
    pub encoder: EncoderConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub backend: BackendKind,
    /// Device path for hardware backends (`/dev/videoN`). Empty means auto-detect.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Emulated trigger pattern for the synthetic backend.
    pub burst: Option<BurstPattern>,
}

/// Bursts of frames separated by idle gaps, as a triggered rig produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstPattern {
    pub frames: u32,
    pub gap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub video_folder: PathBuf,
    pub video_filename: String,
    pub frame_rate: f64,
    pub rec_time_in_sec: f64,
    pub chunk_length_in_sec: f64,
    pub trial_structure: bool,
    /// Inter-trial interval in milliseconds.
    pub trial_iti_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    pub downsample: u32,
    pub frame_rate: f64,
    /// Preview frames held before new ones are dropped.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMake {
    Nvidia,
    Amd,
    Intel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: String,
    pub codec: String,
    /// Overrides the pixel format reported by the frame source.
    pub pixel_format_input: Option<String>,
    pub pixel_format_output: String,
    pub quality: String,
    /// `-1` selects CPU encoding.
    pub gpu_id: i32,
    pub gpu_make: GpuMake,
    pub ffmpeg_log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on one idle wait of the writer when the queue is empty.
    pub writer_idle_wait_ms: u64,
    pub open_retry_initial_ms: u64,
    /// Cap on the backoff between encoder open attempts, which never give up.
    pub open_retry_max_ms: u64,
    /// Grab timeout in free-run mode; only bounds how long a stop request can go unseen.
    pub free_run_poll_ms: u64,
    pub grab_error_backoff_max_ms: u64,
    pub pin_acquisition_core: Option<usize>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "cam0".into(),
            backend: BackendKind::Synthetic,
            device: String::new(),
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Mono8,
            burst: None,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            video_folder: PathBuf::from("videos"),
            video_filename: "video.mp4".into(),
            frame_rate: 100.0,
            rec_time_in_sec: 60.0,
            chunk_length_in_sec: 5.0,
            trial_structure: false,
            trial_iti_ms: 500,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            downsample: 2,
            frame_rate: 10.0,
            queue_depth: 4,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            codec: "h264".into(),
            pixel_format_input: None,
            pixel_format_output: "yuv420p".into(),
            quality: "21".into(),
            gpu_id: -1,
            gpu_make: GpuMake::Nvidia,
            ffmpeg_log_level: "warning".into(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            writer_idle_wait_ms: 10,
            open_retry_initial_ms: 100,
            open_retry_max_ms: 2_000,
            free_run_poll_ms: 1_000,
            grab_error_backoff_max_ms: 50,
            pin_acquisition_core: None,
        }
    }
}

impl CamParams {
    /// Layer defaults, an optional TOML file and `TRIALCAM__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&CamParams::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let params: CamParams = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.camera.name.trim().is_empty() {
            return invalid("camera.name must not be empty");
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("camera.width and camera.height must be positive");
        }
        if !(self.recording.frame_rate > 0.0) {
            return invalid("recording.frame_rate must be positive");
        }
        if !(self.recording.rec_time_in_sec > 0.0) {
            return invalid("recording.rec_time_in_sec must be positive");
        }
        if self.recording.chunk_length_in_sec < 0.0 {
            return invalid("recording.chunk_length_in_sec must not be negative");
        }
        if self.recording.trial_structure && self.recording.trial_iti_ms == 0 {
            return invalid("recording.trial_iti_ms must be positive in trial mode");
        }
        if self.display.downsample == 0 {
            return invalid("display.downsample must be at least 1");
        }
        if self.recording.video_filename.trim().is_empty() {
            return invalid("recording.video_filename must not be empty");
        }
        Ok(())
    }

    /// Frames after which the session stops on its own.
    pub fn frame_quota(&self) -> u64 {
        utils::frame_quota(self.recording.frame_rate, self.recording.rec_time_in_sec)
    }

    /// Preview decimation; `None` when the preview is off.
    pub fn frame_ratio(&self) -> Option<u64> {
        if !self.display.enabled {
            return None;
        }
        utils::frame_ratio(self.recording.frame_rate, self.display.frame_rate)
    }

    pub fn chunk_length_frames(&self) -> Option<u64> {
        utils::chunk_length_frames(self.recording.chunk_length_in_sec, self.recording.frame_rate)
    }

    pub fn trial_iti(&self) -> Duration {
        Duration::from_millis(self.recording.trial_iti_ms)
    }

    pub fn camera_folder(&self) -> PathBuf {
        self.recording.video_folder.join(&self.camera.name)
    }

    /// `{videoFolder}/{cameraName}/{base}-t{segment}.{ext}`
    pub fn video_path(&self, segment: u32) -> PathBuf {
        let file = Path::new(&self.recording.video_filename);
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.recording.video_filename.clone());
        let prefix = if self.camera.backend == BackendKind::Synthetic {
            "emu"
        } else {
            ""
        };
        let name = match file.extension() {
            Some(ext) => format!("{prefix}{stem}-t{segment}.{}", ext.to_string_lossy()),
            None => format!("{prefix}{stem}-t{segment}"),
        };
        self.camera_folder().join(name)
    }

    pub fn metadata_path(&self, segment: u32) -> PathBuf {
        self.camera_folder().join(format!("metadata-t{segment}.csv"))
    }

    pub fn frametimes_path(&self, segment: u32) -> PathBuf {
        self.camera_folder().join(format!("frametimes-t{segment}.npy"))
    }

    /// Flat parameter rows written at the top of every metadata record.
    pub fn metadata_rows(&self) -> Vec<(String, String)> {
        let pix_in = self
            .encoder
            .pixel_format_input
            .clone()
            .unwrap_or_else(|| self.camera.pixel_format.ffmpeg_name().to_string());
        let rows: [(&str, String); 19] = [
            ("cameraName", self.camera.name.clone()),
            ("cameraMake", self.camera.backend.to_string()),
            ("videoFolder", self.recording.video_folder.display().to_string()),
            ("videoFilename", self.recording.video_filename.clone()),
            ("frameRate", self.recording.frame_rate.to_string()),
            ("recTimeInSec", self.recording.rec_time_in_sec.to_string()),
            ("chunkLengthInSec", self.recording.chunk_length_in_sec.to_string()),
            ("displayDownsample", self.display.downsample.to_string()),
            ("displayFrameRate", self.display.frame_rate.to_string()),
            ("trialStructure", self.recording.trial_structure.to_string()),
            ("trialITI", self.recording.trial_iti_ms.to_string()),
            ("frameWidth", self.camera.width.to_string()),
            ("frameHeight", self.camera.height.to_string()),
            ("pixelFormatInput", pix_in),
            ("pixelFormatOutput", self.encoder.pixel_format_output.clone()),
            ("codec", self.encoder.codec.clone()),
            ("quality", self.encoder.quality.clone()),
            ("gpuID", self.encoder.gpu_id.to_string()),
            ("gpuMake", format!("{:?}", self.encoder.gpu_make).to_lowercase()),
        ];
        rows.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
