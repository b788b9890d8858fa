//! The camera capability the pipeline core pulls frames through.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::frame::{Frame, PixelFormat};
use super::synthetic::SyntheticSource;
use crate::error::GrabError;
use crate::CamParams;

/// Frame geometry a source commits to for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A camera, opened and configured, ready to deliver frames.
///
/// Owned exclusively by the acquisition thread for the session.
pub trait FrameSource: Send {
    fn geometry(&self) -> SourceGeometry;

    /// Block until the next frame or until `timeout` elapses.
    ///
    /// `None` waits indefinitely. Returns `GrabError::Timeout` when nothing
    /// arrived in time.
    fn grab(&mut self, timeout: Option<Duration>) -> Result<Frame, GrabError>;

    fn close(&mut self) -> Result<(), GrabError> {
        Ok(())
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn geometry(&self) -> SourceGeometry {
        (**self).geometry()
    }

    fn grab(&mut self, timeout: Option<Duration>) -> Result<Frame, GrabError> {
        (**self).grab(timeout)
    }

    fn close(&mut self) -> Result<(), GrabError> {
        (**self).close()
    }
}

/// Camera backend variants, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Emulated camera (`emu`).
    Synthetic,
    V4l2,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Synthetic => f.write_str("emu"),
            BackendKind::V4l2 => f.write_str("v4l2"),
        }
    }
}

/// Open the backend named in `params.camera`.
pub fn open_source(params: &CamParams) -> Result<Box<dyn FrameSource>, GrabError> {
    info!(
        camera = %params.camera.name,
        backend = %params.camera.backend,
        "Opening frame source"
    );
    match params.camera.backend {
        BackendKind::Synthetic => Ok(Box::new(SyntheticSource::new(
            &params.camera,
            params.recording.frame_rate,
        ))),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => {
            let mut source =
                super::v4l2::V4l2Capture::new(&params.camera, params.recording.frame_rate)?;
            source.start_stream()?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(GrabError::Lost(
            "built without the `v4l2` feature".to_string(),
        )),
    }
}
