//! MJPEG streaming: one multipart part per frame, latest frame only.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::SecondsFormat;
use futures_util::Stream;
use tracing::debug;

use crate::config::Transport;
use crate::frame::{Frame, ReadOutcome, SharedFrameBuffer};

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Counters shared by every streaming connection
#[derive(Default)]
pub struct ClientStats {
    active: AtomicUsize,
    total: AtomicU64,
    frames_sent: AtomicU64,
}

impl ClientStats {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Per-connection streaming state. Dropped when the client goes away or
/// the buffer closes, which is when the connection counts as closed.
pub struct ClientSession {
    peer: SocketAddr,
    transport: Transport,
    stats: Arc<ClientStats>,
    last_seen: u64,
    frames: u64,
    opened: Instant,
}

impl ClientSession {
    pub fn open(stats: Arc<ClientStats>, peer: SocketAddr, transport: Transport) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        stats.total.fetch_add(1, Ordering::Relaxed);
        debug!("Client {} connected to {} stream", peer, transport.scheme());
        Self {
            peer,
            transport,
            stats,
            last_seen: 0,
            frames: 0,
            opened: Instant::now(),
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    fn sent(&mut self, frame: &Frame) {
        self.last_seen = frame.seq;
        self.frames += 1;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        debug!(
            "Client {} left {} stream after {} frames in {:.1}s",
            self.peer,
            self.transport.scheme(),
            self.frames,
            self.opened.elapsed().as_secs_f64()
        );
    }
}

/// Encode one frame as a multipart part, boundary line included.
pub fn encode_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-Sequence: {}\r\nX-Timestamp: {}\r\n\r\n",
        BOUNDARY,
        frame.jpeg.len(),
        frame.seq,
        frame.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    );

    let mut part = BytesMut::with_capacity(header.len() + frame.jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Body of a `/stream` response.
///
/// Waits on the buffer for anything newer than the last part sent. A
/// timeout just loops; the stream ends when the buffer closes or when
/// the body is dropped because a write to the client failed.
pub fn frame_parts(
    buffer: Arc<SharedFrameBuffer>,
    mut session: ClientSession,
    poll: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        loop {
            match buffer.read(session.last_seen(), poll).await {
                ReadOutcome::Frame(frame) => {
                    session.sent(&frame);
                    yield Ok(encode_part(&frame));
                }
                ReadOutcome::Timeout => continue,
                ReadOutcome::Closed => break,
            }
        }
        drop(session);
    }
}
