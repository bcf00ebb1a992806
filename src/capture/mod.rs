//! Capture pipeline.
//!
//! Pulls frames from the source on a dedicated thread, JPEG-compresses
//! them and publishes into the shared frame buffer at the target rate.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::config::{CapturePolicy, SourceConfig};
use crate::frame::SharedFrameBuffer;
use crate::source::{FrameSource, SyntheticGenerator};

/// Live capture state, readable from the status endpoint
#[derive(Default)]
pub struct CaptureStatus {
    source: Mutex<String>,
    degraded: AtomicBool,
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
}

impl CaptureStatus {
    pub fn source(&self) -> String {
        self.source.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// True once the loop has fallen back to synthetic frames
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn capture_failures(&self) -> u64 {
        self.capture_failures.load(Ordering::Relaxed)
    }

    fn set_source(&self, name: String) {
        if let Ok(mut slot) = self.source.lock() {
            *slot = name;
        }
    }
}

/// Capture thread handle. Dropping it stops the thread.
pub struct CaptureLoop {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    status: Arc<CaptureStatus>,
}

impl CaptureLoop {
    /// Spawn the capture thread. The source is owned by the thread from
    /// here on and released by it on shutdown.
    pub fn start(
        source: Box<dyn FrameSource>,
        config: SourceConfig,
        policy: CapturePolicy,
        buffer: Arc<SharedFrameBuffer>,
    ) -> Result<Self> {
        let status = Arc::new(CaptureStatus::default());
        status.set_source(source.describe());

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_status = Arc::clone(&status);
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let worker = Worker {
                    source,
                    config,
                    policy,
                    buffer,
                    status: thread_status,
                    stop_rx,
                };
                worker.run();
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            status,
        })
    }

    pub fn status(&self) -> Arc<CaptureStatus> {
        Arc::clone(&self.status)
    }

    /// Signal the thread and wait until it has released the source.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the rate-limit sleep
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    source: Box<dyn FrameSource>,
    config: SourceConfig,
    policy: CapturePolicy,
    buffer: Arc<SharedFrameBuffer>,
    status: Arc<CaptureStatus>,
    stop_rx: mpsc::Receiver<()>,
}

impl Worker {
    fn run(mut self) {
        let frame_interval = self.config.frame_interval();
        let mut consecutive_failures = 0u32;

        info!(
            "Capture started: {} at {}x{} @ {}fps",
            self.source.describe(),
            self.config.width,
            self.config.height,
            self.config.fps
        );

        loop {
            let frame_start = Instant::now();

            match self.source.next() {
                Ok(image) => {
                    // Stamp on arrival; encoding can take longer than a frame slot
                    let captured_at = Utc::now();
                    consecutive_failures = 0;
                    self.status.frames_captured.fetch_add(1, Ordering::Relaxed);
                    match jpeg_encode(&image, self.config.quality) {
                        Ok(jpeg) => {
                            if self.buffer.publish(Bytes::from(jpeg), captured_at).is_none() {
                                debug!("Frame buffer closed, stopping capture");
                                break;
                            }
                        }
                        Err(e) => warn!("Skipping frame: {}", e),
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.status.capture_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to read frame from {} ({}/{}): {}",
                        self.source.describe(),
                        consecutive_failures,
                        self.policy.max_retries,
                        e
                    );

                    if consecutive_failures > self.policy.max_retries {
                        consecutive_failures = 0;
                        if self.policy.fallback && !self.status.degraded() {
                            self.degrade();
                            continue;
                        }
                        // Retries exhausted with no fallback: try again next frame slot
                        if self.wait_or_stop(frame_interval) {
                            break;
                        }
                        continue;
                    }
                    if self.wait_or_stop(self.policy.backoff) {
                        break;
                    }
                    continue;
                }
            }

            // Maintain target frame rate
            let remaining = frame_interval.saturating_sub(frame_start.elapsed());
            if self.wait_or_stop(remaining) {
                break;
            }
        }

        self.source.release();
        info!("Capture stopped: {}", self.source.describe());
    }

    /// Swap the failing source for the synthetic generator.
    fn degrade(&mut self) {
        error!(
            "{} keeps failing, falling back to synthetic frames",
            self.source.describe()
        );
        self.source.release();
        self.source = Box::new(SyntheticGenerator::new(self.config.width, self.config.height));
        self.status.set_source(self.source.describe());
        self.status.degraded.store(true, Ordering::Relaxed);
    }

    /// Sleep for `duration` unless a stop arrives first. Returns true on stop.
    fn wait_or_stop(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty));
        }
        !matches!(self.stop_rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

/// JPEG encode an RGB image
pub fn jpeg_encode(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    image
        .write_with_encoder(encoder)
        .map_err(|e| anyhow::anyhow!("JPEG encode failed: {}", e))?;

    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::frame::ReadOutcome;
    use chrono::DateTime;
    use rand::RngCore;
    use std::sync::atomic::AtomicUsize;

    /// Source that fails on demand and counts releases
    struct FlakySource {
        fail_from: u64,
        calls: u64,
        releases: Arc<AtomicUsize>,
    }

    impl FrameSource for FlakySource {
        fn next(&mut self) -> Result<RgbImage, DeviceError> {
            self.calls += 1;
            if self.calls > self.fail_from {
                Err(DeviceError::Busy("simulated".into()))
            } else {
                Ok(RgbImage::new(32, 24))
            }
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    /// Random pixels, which JPEG cannot compress quickly. Records when
    /// each frame was handed over.
    struct NoiseSource {
        width: u32,
        height: u32,
        handed_over: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    impl FrameSource for NoiseSource {
        fn next(&mut self) -> Result<RgbImage, DeviceError> {
            let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];
            rand::thread_rng().fill_bytes(&mut pixels);
            let image = RgbImage::from_raw(self.width, self.height, pixels)
                .ok_or_else(|| DeviceError::Closed("bad noise buffer".into()))?;
            self.handed_over.lock().unwrap().push(Utc::now());
            Ok(image)
        }

        fn release(&mut self) {}

        fn describe(&self) -> String {
            "noise".into()
        }
    }

    fn config(fps: u32) -> SourceConfig {
        SourceConfig {
            fps,
            ..SourceConfig::synthetic(32, 24)
        }
    }

    fn policy() -> CapturePolicy {
        CapturePolicy {
            max_retries: 2,
            backoff: Duration::ZERO,
            fallback: true,
        }
    }

    #[test]
    fn test_jpeg_encode_produces_jpeg() {
        let jpeg = jpeg_encode(&RgbImage::new(16, 16), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publishes_at_bounded_rate() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let source = Box::new(SyntheticGenerator::new(32, 24));
        let mut capture = CaptureLoop::start(source, config(20), policy(), Arc::clone(&buffer)).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        capture.stop();

        let published = buffer.sequence();
        // 20 fps for half a second, with slack for scheduling
        assert!(published >= 5, "too few frames: {}", published);
        assert!(published <= 12, "rate not bounded: {}", published);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_falls_back_to_synthetic_after_retries() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(FlakySource {
            fail_from: 3,
            calls: 0,
            releases: Arc::clone(&releases),
        });
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mut capture = CaptureLoop::start(source, config(50), policy(), Arc::clone(&buffer)).unwrap();
        let status = capture.status();

        // Stream keeps flowing well past the failure point
        let mut last = 0;
        for _ in 0..15 {
            match buffer.read(last, Duration::from_secs(2)).await {
                ReadOutcome::Frame(frame) => last = frame.seq,
                other => panic!("stream went silent: {:?}", other),
            }
        }
        assert!(status.degraded());
        assert!(status.source().contains("synthetic"));
        assert!(status.capture_failures() >= 3);

        capture.stop();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_without_fallback_keeps_retrying() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(FlakySource {
            fail_from: 0,
            calls: 0,
            releases: Arc::clone(&releases),
        });
        let buffer = Arc::new(SharedFrameBuffer::new());
        let policy = CapturePolicy {
            fallback: false,
            ..policy()
        };
        let mut capture = CaptureLoop::start(source, config(50), policy, Arc::clone(&buffer)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!capture.status().degraded());
        capture.stop();

        assert_eq!(buffer.sequence(), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_releases_source_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(FlakySource {
            fail_from: u64::MAX,
            calls: 0,
            releases: Arc::clone(&releases),
        });
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mut capture = CaptureLoop::start(source, config(5), policy(), buffer).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        capture.stop();
        // The 200ms frame sleep is interrupted
        assert!(started.elapsed() < Duration::from_millis(150));
        capture.stop();
        drop(capture);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_buffer_stops_capture() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(FlakySource {
            fail_from: u64::MAX,
            calls: 0,
            releases: Arc::clone(&releases),
        });
        let buffer = Arc::new(SharedFrameBuffer::new());
        buffer.close();
        let mut capture = CaptureLoop::start(source, config(50), policy(), buffer).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        capture.stop();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frame_time_is_taken_before_encoding() {
        let handed_over = Arc::new(Mutex::new(Vec::new()));
        let source = Box::new(NoiseSource {
            width: 1920,
            height: 1080,
            handed_over: Arc::clone(&handed_over),
        });
        let config = SourceConfig {
            quality: 100,
            ..SourceConfig::synthetic(1920, 1080)
        };
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mut capture = CaptureLoop::start(source, config, policy(), Arc::clone(&buffer)).unwrap();

        let mut last = 0;
        let mut frames = Vec::new();
        while frames.len() < 3 {
            match buffer.read(last, Duration::from_secs(10)).await {
                ReadOutcome::Frame(frame) => {
                    last = frame.seq;
                    frames.push(frame);
                }
                other => panic!("no frame: {:?}", other),
            }
        }
        capture.stop();

        let handed_over = handed_over.lock().unwrap();
        for frame in frames {
            let arrived = handed_over[(frame.seq - 1) as usize];
            let lag = frame.captured_at - arrived;
            // Encoding a full HD noise frame takes far longer than this
            assert!(
                lag >= chrono::Duration::zero() && lag < chrono::Duration::milliseconds(5),
                "frame {} stamped {}ms after the source returned it",
                frame.seq,
                lag.num_milliseconds()
            );
        }
    }
}
