//! Single-slot latest-frame buffer.
//!
//! One writer (the shared source's reader task) replaces the slot on every
//! complete frame; any number of readers observe it through a
//! [`FrameCursor`]. The slot holds an `Arc<Frame>`, so a publish is a pointer
//! swap and a reader can never see a partially written frame. Readers that
//! fall behind skip straight to the newest frame: nothing is ever queued per
//! reader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;

/// One complete JPEG frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number, starting at 1. Never reset, even across
    /// capture session restarts.
    pub seq: u64,
    pub data: Bytes,
    pub arrived_at: Instant,
}

/// The latest published frame, shared between the writer and all readers.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the slot with `data` and return its sequence number.
    pub fn publish(&self, data: Bytes) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|slot| {
            seq = slot.as_ref().map_or(0, |f| f.seq) + 1;
            *slot = Some(Arc::new(Frame {
                seq,
                data,
                arrived_at: Instant::now(),
            }));
        });
        seq
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    /// Sequence number of the latest frame, 0 if nothing was published yet.
    pub fn current_seq(&self) -> u64 {
        self.tx.borrow().as_ref().map_or(0, |f| f.seq)
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.tx.borrow().as_ref().map(|f| f.arrived_at.elapsed())
    }

    /// A cursor positioned at the current frame: its first
    /// [`FrameCursor::next_frame`] yields the next one published.
    pub fn subscribe(&self) -> FrameCursor {
        let rx = self.tx.subscribe();
        let last_seq = rx.borrow().as_ref().map_or(0, |f| f.seq);
        FrameCursor { rx, last_seq }
    }

    /// Number of live cursors.
    pub fn reader_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A reader's position in the frame sequence.
#[derive(Debug)]
pub struct FrameCursor {
    rx: watch::Receiver<Option<Arc<Frame>>>,
    last_seq: u64,
}

impl FrameCursor {
    /// Wait for a frame newer than the last one returned.
    ///
    /// Returns `None` once the buffer is gone.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        loop {
            {
                let slot = self.rx.borrow_and_update();
                if let Some(frame) = slot.as_ref() {
                    if frame.seq > self.last_seq {
                        self.last_seq = frame.seq;
                        return Some(Arc::clone(frame));
                    }
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_increments_seq() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.current_seq(), 0);
        assert!(buffer.latest().is_none());
        assert!(buffer.last_frame_age().is_none());

        assert_eq!(buffer.publish(Bytes::from_static(b"a")), 1);
        assert_eq!(buffer.publish(Bytes::from_static(b"b")), 2);

        let latest = buffer.latest().unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(&latest.data[..], b"b");
    }

    #[tokio::test]
    async fn cursor_starts_at_next_frame() {
        let buffer = FrameBuffer::new();
        buffer.publish(Bytes::from_static(b"old"));

        let mut cursor = buffer.subscribe();
        assert_eq!(cursor.last_seq(), 1);

        buffer.publish(Bytes::from_static(b"new"));
        let frame = cursor.next_frame().await.unwrap();
        assert_eq!(frame.seq, 2);
        assert_eq!(&frame.data[..], b"new");
    }

    #[tokio::test]
    async fn slow_cursor_skips_to_latest() {
        let buffer = FrameBuffer::new();
        let mut cursor = buffer.subscribe();

        for i in 0..10u8 {
            buffer.publish(Bytes::from(vec![i]));
        }

        let frame = cursor.next_frame().await.unwrap();
        assert_eq!(frame.seq, 10);
        assert_eq!(&frame.data[..], &[9]);
    }

    #[tokio::test]
    async fn cursor_waits_for_publish() {
        let buffer = FrameBuffer::new();
        let mut cursor = buffer.subscribe();

        let pending =
            tokio::time::timeout(Duration::from_millis(50), cursor.next_frame()).await;
        assert!(pending.is_err());

        let writer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.publish(Bytes::from_static(b"x"));
        });

        let frame = tokio::time::timeout(Duration::from_secs(2), cursor.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.seq, 1);
    }

    #[tokio::test]
    async fn concurrent_readers_see_non_decreasing_seq() {
        let buffer = FrameBuffer::new();
        let mut readers = Vec::new();

        for _ in 0..8 {
            let mut cursor = buffer.subscribe();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = cursor.next_frame().await {
                    seen.push(frame.seq);
                    if frame.seq >= 200 {
                        break;
                    }
                }
                seen
            }));
        }

        for _ in 0..200 {
            buffer.publish(Bytes::from_static(b"f"));
            tokio::task::yield_now().await;
        }

        for reader in readers {
            let seen = reader.await.unwrap();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(*seen.last().unwrap(), 200);
        }
    }

    #[test]
    fn reader_count_tracks_cursors() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.reader_count(), 0);
        let a = buffer.subscribe();
        let _b = buffer.subscribe();
        assert_eq!(buffer.reader_count(), 2);
        drop(a);
        assert_eq!(buffer.reader_count(), 1);
    }
}
