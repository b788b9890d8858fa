//! In-memory encoder that records what the writer asked of it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Encoder, EncoderSession, EncoderSpec};
use crate::error::EncodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Open { segment: u32, path: PathBuf },
    Write { segment: u32, bytes: usize },
    Close { segment: u32, frames: u64 },
}

#[derive(Default)]
struct Shared {
    events: Vec<EncoderEvent>,
    failing_opens: u32,
}

/// Cloneable; all clones observe the same event log.
#[derive(Clone, Default)]
pub struct MemoryEncoder {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` opens fail as if the output file were locked.
    pub fn fail_next_opens(self, n: u32) -> Self {
        self.lock().failing_opens = n;
        self
    }

    pub fn events(&self) -> Vec<EncoderEvent> {
        self.lock().events.clone()
    }

    pub fn opened_paths(&self) -> Vec<PathBuf> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                EncoderEvent::Open { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Frames written per closed session, in order.
    pub fn frames_per_file(&self) -> Vec<u64> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                EncoderEvent::Close { frames, .. } => Some(*frames),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panicking test thread must not hide the log from the others.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Encoder for MemoryEncoder {
    type Session = MemorySession;

    fn open(&mut self, spec: &EncoderSpec) -> Result<MemorySession, EncodeError> {
        let mut shared = self.lock();
        if shared.failing_opens > 0 {
            shared.failing_opens -= 1;
            return Err(EncodeError::Rejected(format!(
                "{} is locked",
                spec.path.display()
            )));
        }
        shared.events.push(EncoderEvent::Open {
            segment: spec.segment,
            path: spec.path.clone(),
        });
        Ok(MemorySession {
            encoder: self.clone(),
            segment: spec.segment,
            frames: 0,
        })
    }
}

pub struct MemorySession {
    encoder: MemoryEncoder,
    segment: u32,
    frames: u64,
}

impl EncoderSession for MemorySession {
    fn write(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        self.frames += 1;
        self.encoder.lock().events.push(EncoderEvent::Write {
            segment: self.segment,
            bytes: data.len(),
        });
        Ok(())
    }

    fn close(self) -> Result<(), EncodeError> {
        self.encoder.lock().events.push(EncoderEvent::Close {
            segment: self.segment,
            frames: self.frames,
        });
        Ok(())
    }
}
