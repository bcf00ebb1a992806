//! Latest-frame store shared between the capture thread and every client.
//!
//! A single slot holds the newest encoded frame. Publishing replaces it and
//! wakes all waiting readers; readers ask for "anything newer than N" and
//! never see intermediate frames they were too slow to pick up.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// One JPEG-compressed image. Immutable once published.
#[derive(Debug)]
pub struct Frame {
    /// Sequence number assigned by the buffer (first frame is 1)
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub jpeg: Bytes,
}

/// Result of waiting on the buffer
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Arc<Frame>),
    Timeout,
    /// The buffer was closed for shutdown
    Closed,
}

#[derive(Default)]
struct Slot {
    latest: Option<Arc<Frame>>,
    closed: bool,
}

pub struct SharedFrameBuffer {
    slot: watch::Sender<Slot>,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Slot::default());
        Self { slot }
    }

    /// Replace the stored frame and wake every reader.
    ///
    /// Returns the sequence number given to the frame, or `None` once the
    /// buffer has been closed.
    pub fn publish(&self, jpeg: Bytes, captured_at: DateTime<Utc>) -> Option<u64> {
        let mut assigned = None;
        self.slot.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            let seq = slot.latest.as_ref().map_or(0, |f| f.seq) + 1;
            slot.latest = Some(Arc::new(Frame {
                seq,
                captured_at,
                jpeg,
            }));
            assigned = Some(seq);
            true
        });
        assigned
    }

    /// Wait for a frame newer than `last_seen`.
    ///
    /// Returns immediately when one is already stored. Readers that lag
    /// only ever get the newest frame.
    pub async fn read(&self, last_seen: u64, timeout: Duration) -> ReadOutcome {
        let mut rx = self.slot.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|slot| slot.closed || slot.latest.as_ref().is_some_and(|f| f.seq > last_seen)),
        )
        .await;

        match waited {
            Err(_) => ReadOutcome::Timeout,
            Ok(Err(_)) => ReadOutcome::Closed,
            Ok(Ok(slot)) if slot.closed => ReadOutcome::Closed,
            Ok(Ok(slot)) => match slot.latest.as_ref() {
                Some(frame) => ReadOutcome::Frame(Arc::clone(frame)),
                None => ReadOutcome::Closed,
            },
        }
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.borrow().latest.clone()
    }

    /// Highest sequence number published so far (0 before the first frame)
    pub fn sequence(&self) -> u64 {
        self.slot.borrow().latest.as_ref().map_or(0, |f| f.seq)
    }

    /// Stop accepting frames and release every waiting reader.
    pub fn close(&self) {
        self.slot.send_if_modified(|slot| {
            let changed = !slot.closed;
            slot.closed = true;
            changed
        });
    }

    pub fn is_closed(&self) -> bool {
        self.slot.borrow().closed
    }
}

impl Default for SharedFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    #[test]
    fn test_sequence_increments_by_one() {
        let buffer = SharedFrameBuffer::new();
        assert_eq!(buffer.sequence(), 0);
        for expected in 1..=20 {
            assert_eq!(buffer.publish(jpeg(expected as u8), Utc::now()), Some(expected));
        }
        assert_eq!(buffer.sequence(), 20);
    }

    #[tokio::test]
    async fn test_read_returns_latest_only() {
        let buffer = SharedFrameBuffer::new();
        for i in 0..5u8 {
            buffer.publish(jpeg(i), Utc::now());
        }

        match buffer.read(0, Duration::from_millis(10)).await {
            ReadOutcome::Frame(frame) => {
                assert_eq!(frame.seq, 5);
                assert_eq!(frame.jpeg, jpeg(4));
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_never_returns_seen_sequence() {
        let buffer = SharedFrameBuffer::new();
        buffer.publish(jpeg(1), Utc::now());

        let outcome = buffer.read(1, Duration::from_millis(30)).await;
        assert!(matches!(outcome, ReadOutcome::Timeout));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_wakes_on_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        buffer.publish(jpeg(1), Utc::now());

        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.read(1, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        buffer.publish(jpeg(2), Utc::now());

        match reader.await.unwrap() {
            ReadOutcome::Frame(frame) => assert_eq!(frame.seq, 2),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_readers_share_one_frame() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        buffer.publish(jpeg(7), Utc::now());

        let a = buffer.read(0, Duration::from_millis(10)).await;
        let b = buffer.read(0, Duration::from_millis(10)).await;
        match (a, b) {
            (ReadOutcome::Frame(a), ReadOutcome::Frame(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("expected frames, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_readers_see_increasing_sequences() {
        let buffer = Arc::new(SharedFrameBuffer::new());

        let mut readers = Vec::new();
        for _ in 0..8 {
            let buffer = Arc::clone(&buffer);
            readers.push(tokio::spawn(async move {
                let mut last = 0;
                let mut seen = Vec::new();
                loop {
                    match buffer.read(last, Duration::from_secs(2)).await {
                        ReadOutcome::Frame(frame) => {
                            assert!(frame.seq > last);
                            last = frame.seq;
                            seen.push(frame.seq);
                        }
                        ReadOutcome::Timeout => panic!("reader timed out"),
                        ReadOutcome::Closed => break,
                    }
                }
                seen
            }));
        }

        let publisher = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    buffer.publish(jpeg(i as u8), Utc::now());
                    if i % 20 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                buffer.close();
            })
        };
        publisher.join().unwrap();

        for reader in readers {
            let seen = reader.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn test_close_releases_readers_and_rejects_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.read(0, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        buffer.close();

        assert!(matches!(reader.await.unwrap(), ReadOutcome::Closed));
        assert!(buffer.is_closed());
        assert_eq!(buffer.publish(jpeg(1), Utc::now()), None);
    }
}
