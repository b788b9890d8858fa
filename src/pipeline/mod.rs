pub mod acquisition;
pub mod ledger;
pub mod queue;
pub mod segmenter;
pub mod session;
pub mod writer;

pub use acquisition::{AcquisitionLoop, AcquisitionReport};
pub use ledger::{read_frametimes, FlushOutcome, MetadataLedger, Segment};
pub use queue::{
    display_queue, write_queue, DisplayReceiver, DisplaySender, Offer, QueueSnapshot, WriteMsg,
    WriteReceiver, WriteSender,
};
pub use segmenter::{Decision, GrabEvent, SegmentationMode, TrialSegmenter};
pub use session::{run_session, Pipeline, SessionReport, StopHandle, StopReason};
pub use writer::{WriterConfig, WriterLoop, WriterReport};
