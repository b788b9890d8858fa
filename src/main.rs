//! trialcam: trial-segmented camera recording

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trialcam::capture::open_source;
use trialcam::display::{DisplaySink, LogSink};
use trialcam::encoder::FfmpegEncoder;
use trialcam::{run_session, CamParams, SessionReport, StopHandle, StopReason};

#[derive(Debug, Parser)]
#[command(name = "trialcam", version, about = "Record a camera into per-trial video segments")]
struct Cli {
    /// TOML configuration file, layered over the defaults.
    #[arg(short, long, env = "TRIALCAM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    camera_name: Option<String>,

    #[arg(long)]
    video_folder: Option<PathBuf>,

    /// Recording duration in seconds.
    #[arg(long)]
    rec_time: Option<f64>,

    /// Split the recording into trials at inter-trial gaps.
    #[arg(long)]
    trial_structure: bool,

    #[arg(long)]
    no_display: bool,
}

impl Cli {
    fn apply(&self, params: &mut CamParams) {
        if let Some(name) = &self.camera_name {
            params.camera.name = name.clone();
        }
        if let Some(folder) = &self.video_folder {
            params.recording.video_folder = folder.clone();
        }
        if let Some(secs) = self.rec_time {
            params.recording.rec_time_in_sec = secs;
        }
        if self.trial_structure {
            params.recording.trial_structure = true;
        }
        if self.no_display {
            params.display.enabled = false;
        }
    }
}

#[cfg(feature = "sdl-preview")]
fn preview_sink(params: &CamParams) -> Box<dyn DisplaySink> {
    let ds = params.display.downsample.max(1);
    let (width, height) = (params.camera.width.div_ceil(ds), params.camera.height.div_ceil(ds));
    match trialcam::display::Sdl2Preview::new(&params.camera.name, width, height) {
        Ok(preview) => Box::new(preview),
        Err(err) => {
            warn!("No preview window ({}), logging preview cadence instead", err);
            Box::new(LogSink::default())
        }
    }
}

#[cfg(not(feature = "sdl-preview"))]
fn preview_sink(_params: &CamParams) -> Box<dyn DisplaySink> {
    Box::new(LogSink::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trialcam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let mut params =
        CamParams::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;
    cli.apply(&mut params);
    params.validate()?;

    info!(
        "trialcam launching: camera {} -> {}",
        params.camera.name,
        params.camera_folder().display()
    );

    let stop = StopHandle::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping acquisition");
            on_signal.request();
        }
    });

    // Pipeline threads are plain OS threads; this one hosts the preview.
    let session = tokio::task::spawn_blocking(move || -> Result<SessionReport> {
        let source = open_source(&params)?;
        let encoder = FfmpegEncoder::new(&params.encoder);
        let sink = preview_sink(&params);
        Ok(run_session(&params, source, encoder, sink, stop)?)
    });
    let report = session.await??;

    info!(
        "{} frames grabbed, {} written, {} segments saved",
        report.frames_grabbed,
        report.writer.frames_written,
        report.saved_segments()
    );
    if !report.metadata_complete() {
        warn!("Some segment metadata could not be saved");
    }

    match report.stop_reason {
        StopReason::Fatal(msg) => Err(eyre!("session aborted: {msg}")),
        _ => Ok(()),
    }
}
