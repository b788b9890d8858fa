//! Write and Display queues between the acquisition loop and its consumers.
//!
//! The Write queue is unbounded: appends never block, and if the encoder falls
//! behind, memory grows instead of frames being lost. The Display queue is
//! small and lossy: when the preview is slow, new preview frames are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::capture::Frame;

/// One entry of the Write queue.
#[derive(Debug, Clone)]
pub enum WriteMsg {
    Frame(Frame),
    /// Close the current file and open the file for segment `.0`.
    NewSegment(u32),
    Stop,
}

impl WriteMsg {
    pub fn is_control(&self) -> bool {
        !matches!(self, WriteMsg::Frame(_))
    }
}

#[derive(Default)]
struct Stats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
}

#[derive(Clone, Default)]
pub struct QueueStats(Arc<CachePadded<Stats>>);

impl QueueStats {
    fn enqueued(&self) {
        self.0.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn dequeued(&self) {
        self.0.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    fn dropped(&self) {
        self.0.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            enqueued: self.0.enqueued.load(Ordering::Relaxed),
            dequeued: self.0.dequeued.load(Ordering::Relaxed),
            dropped: self.0.dropped.load(Ordering::Relaxed),
        }
    }
}

/// The consumer of a queue has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue consumer disconnected")]
pub struct Disconnected;

pub fn write_queue() -> (WriteSender, WriteReceiver) {
    let (tx, rx) = flume::unbounded();
    let stats = QueueStats::default();
    (
        WriteSender {
            tx,
            stats: stats.clone(),
        },
        WriteReceiver { rx, stats },
    )
}

pub struct WriteSender {
    tx: Sender<WriteMsg>,
    stats: QueueStats,
}

impl WriteSender {
    /// Append without blocking.
    pub fn push(&self, msg: WriteMsg) -> Result<(), Disconnected> {
        self.tx.send(msg).map_err(|_| Disconnected)?;
        self.stats.enqueued();
        Ok(())
    }

    /// Entries pushed but not yet popped by the writer.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }
}

pub struct WriteReceiver {
    rx: Receiver<WriteMsg>,
    stats: QueueStats,
}

impl WriteReceiver {
    /// Wait at most `idle` for the next entry.
    pub fn pop(&self, idle: Duration) -> Result<WriteMsg, RecvTimeoutError> {
        let msg = self.rx.recv_timeout(idle)?;
        self.stats.dequeued();
        Ok(msg)
    }

    /// Everything currently queued, without waiting. Intended for inspection in tests.
    pub fn drain(&self) -> Vec<WriteMsg> {
        let msgs: Vec<_> = self.rx.drain().collect();
        for _ in &msgs {
            self.stats.dequeued();
        }
        msgs
    }

}

/// Result of offering a preview frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Sent,
    Dropped,
    Closed,
}

pub fn display_queue(depth: usize) -> (DisplaySender, DisplayReceiver) {
    let (tx, rx) = flume::bounded(depth.max(1));
    let stats = QueueStats::default();
    (
        DisplaySender {
            tx,
            stats: stats.clone(),
        },
        DisplayReceiver { rx, stats },
    )
}

pub struct DisplaySender {
    tx: Sender<Frame>,
    stats: QueueStats,
}

impl DisplaySender {
    /// Hand a preview frame over if there is room. Never blocks.
    pub fn offer(&self, frame: Frame) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.enqueued();
                Offer::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped();
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }
}

pub struct DisplayReceiver {
    rx: Receiver<Frame>,
    stats: QueueStats,
}

impl DisplayReceiver {
    /// Wait at most `timeout` for a preview frame. `Disconnected` once the
    /// acquisition loop has finished and the queue is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        let frame = self.rx.recv_timeout(timeout)?;
        self.stats.dequeued();
        Ok(frame)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from_static(&[0; 4]), 2, 2, PixelFormat::Mono8, 0).sequenced(seq)
    }

    #[test]
    fn write_queue_keeps_order() {
        let (tx, rx) = write_queue();
        tx.push(WriteMsg::Frame(frame(1))).unwrap();
        tx.push(WriteMsg::NewSegment(1)).unwrap();
        tx.push(WriteMsg::Frame(frame(2))).unwrap();
        tx.push(WriteMsg::Stop).unwrap();

        let got = rx.drain();
        assert!(matches!(&got[0], WriteMsg::Frame(f) if f.sequence() == 1));
        assert!(matches!(got[1], WriteMsg::NewSegment(1)));
        assert!(matches!(&got[2], WriteMsg::Frame(f) if f.sequence() == 2));
        assert!(matches!(got[3], WriteMsg::Stop));
        assert_eq!(tx.stats().snapshot().dequeued, 4);
    }

    #[test]
    fn backlog_counts_entries_the_writer_has_not_popped() {
        let (tx, rx) = write_queue();
        assert_eq!(tx.backlog(), 0);
        tx.push(WriteMsg::Frame(frame(1))).unwrap();
        tx.push(WriteMsg::Frame(frame(2))).unwrap();
        assert_eq!(tx.backlog(), 2);

        rx.pop(Duration::from_millis(1)).unwrap();
        assert_eq!(tx.backlog(), 1);
    }

    #[test]
    fn write_push_fails_once_writer_is_gone() {
        let (tx, rx) = write_queue();
        drop(rx);
        assert_eq!(tx.push(WriteMsg::Stop), Err(Disconnected));
    }

    #[test]
    fn display_drops_when_full_instead_of_blocking() {
        let (tx, rx) = display_queue(2);
        assert_eq!(tx.offer(frame(1)), Offer::Sent);
        assert_eq!(tx.offer(frame(2)), Offer::Sent);
        assert_eq!(tx.offer(frame(3)), Offer::Dropped);
        assert_eq!(tx.stats().snapshot().dropped, 1);

        let first = rx.recv_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(tx.stats().snapshot().dequeued, 1);
        drop(rx);
        assert_eq!(tx.offer(frame(4)), Offer::Closed);
    }
}
