pub mod frame;
pub mod scripted;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use scripted::{ScriptStep, ScriptedSource};
pub use source::{open_source, BackendKind, FrameSource, SourceGeometry};
pub use synthetic::SyntheticSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;
