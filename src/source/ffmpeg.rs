//! Camera and video-file capture through an `ffmpeg` child process.
//!
//! ffmpeg decodes the input and writes raw RGB24 frames, already scaled to
//! the configured resolution, to stdout. A reader thread slices stdout into
//! frames and hands them over a bounded channel so the capture loop can
//! wait with a timeout.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;
use tracing::{debug, info};

use super::{normalize, FrameSource};
use crate::config::SourceConfig;
use crate::error::DeviceError;

/// A running ffmpeg decoder
struct FfmpegPipe {
    child: Child,
    frames: Receiver<std::io::Result<Vec<u8>>>,
    last_error: Arc<Mutex<Option<String>>>,
    width: u32,
    height: u32,
}

impl FfmpegPipe {
    fn spawn(input: &[String], width: u32, height: u32) -> Result<Self, DeviceError> {
        let frame_len = frame_len(width, height)
            .ok_or_else(|| DeviceError::Unsupported(format!("{}x{} frames are too large", width, height)))?;

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend_from_slice(input);
        args.extend(
            [
                "-an".to_string(),
                "-vf".to_string(),
                format!("scale={}:{}", width, height),
                "-pix_fmt".to_string(),
                "rgb24".to_string(),
                "-f".to_string(),
                "rawvideo".to_string(),
                "-".to_string(),
            ],
        );
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DeviceError::NotFound("ffmpeg executable not found in PATH".to_string())
                }
                _ => DeviceError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Closed("ffmpeg stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        // Capacity 1: ffmpeg stalls instead of racing ahead of the capture loop
        let (tx, frames) = mpsc::sync_channel(1);
        std::thread::spawn(move || read_frames(stdout, frame_len, tx));

        let last_error = Arc::new(Mutex::new(None));
        if let Some(stderr) = stderr {
            let last_error = Arc::clone(&last_error);
            std::thread::spawn(move || read_stderr(stderr, last_error));
        }

        Ok(Self {
            child,
            frames,
            last_error,
            width,
            height,
        })
    }

    /// `Ok(None)` means ffmpeg reached end of input or exited.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RgbImage>, DeviceError> {
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(buf)) => RgbImage::from_raw(self.width, self.height, buf)
                .map(Some)
                .ok_or_else(|| DeviceError::Closed("short frame from ffmpeg".to_string())),
            Ok(Err(e)) => Err(DeviceError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Classify why the stream ended, using ffmpeg's last stderr line.
    fn exit_error(&mut self, label: &str) -> DeviceError {
        let _ = self.child.try_wait();
        let message = self
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| "stream ended".to_string());
        let lower = message.to_lowercase();
        if lower.contains("busy") {
            DeviceError::Busy(format!("{}: {}", label, message))
        } else if lower.contains("no such file") || lower.contains("not found") {
            DeviceError::NotFound(format!("{}: {}", label, message))
        } else {
            DeviceError::Closed(format!("{}: {}", label, message))
        }
    }

    fn close(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Bytes in one RGB24 frame, `None` if that does not fit in memory
fn frame_len(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)?.checked_mul(3)
}

fn read_frames<R: Read>(mut reader: R, frame_len: usize, tx: SyncSender<std::io::Result<Vec<u8>>>) {
    let mut count = 0u64;
    loop {
        let mut buf = vec![0u8; frame_len];
        match reader.read_exact(&mut buf) {
            Ok(()) => {
                count += 1;
                if tx.send(Ok(buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    debug!("ffmpeg reader finished after {} frames", count);
}

fn read_stderr(stderr: ChildStderr, last_error: Arc<Mutex<Option<String>>>) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("ffmpeg: {}", line);
        if let Ok(mut slot) = last_error.lock() {
            *slot = Some(line);
        }
    }
}

/// Live camera by index (or explicit device path)
pub struct DeviceCapture {
    label: String,
    input: Vec<String>,
    width: u32,
    height: u32,
    timeout: Duration,
    pipe: Option<FfmpegPipe>,
    pending: Option<RgbImage>,
    released: bool,
}

impl DeviceCapture {
    pub fn open(device: &str, config: &SourceConfig) -> Result<Self, DeviceError> {
        let (label, input) = device_input(device, config.fps)?;
        let mut capture = Self {
            label,
            input,
            width: config.width,
            height: config.height,
            timeout: config.read_timeout,
            pipe: None,
            pending: None,
            released: false,
        };

        // Wait for the first frame so an unusable camera fails here
        let first = capture.read()?;
        capture.pending = Some(first);
        info!("Camera initialized successfully: {}", capture.label);
        Ok(capture)
    }

    fn read(&mut self) -> Result<RgbImage, DeviceError> {
        if self.pipe.is_none() {
            self.pipe = Some(FfmpegPipe::spawn(&self.input, self.width, self.height)?);
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(DeviceError::Closed(self.label.clone()));
        };

        match pipe.next_frame(self.timeout)? {
            Some(image) => Ok(image),
            None => {
                let err = pipe.exit_error(&self.label);
                // Reopen on the next call
                if let Some(pipe) = self.pipe.take() {
                    pipe.close();
                }
                Err(err)
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn device_input(device: &str, fps: u32) -> Result<(String, Vec<String>), DeviceError> {
    let path = if device.chars().all(|c| c.is_ascii_digit()) {
        PathBuf::from(format!("/dev/video{}", device))
    } else {
        PathBuf::from(device)
    };
    if !path.exists() {
        return Err(DeviceError::NotFound(path.display().to_string()));
    }
    let path = path.display().to_string();
    Ok((
        format!("camera {}", path),
        vec![
            "-f".to_string(),
            "v4l2".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            path,
        ],
    ))
}

#[cfg(target_os = "macos")]
fn device_input(device: &str, fps: u32) -> Result<(String, Vec<String>), DeviceError> {
    Ok((
        format!("camera {}", device),
        vec![
            "-f".to_string(),
            "avfoundation".to_string(),
            "-framerate".to_string(),
            fps.to_string(),
            "-i".to_string(),
            format!("{}:none", device),
        ],
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn device_input(device: &str, _fps: u32) -> Result<(String, Vec<String>), DeviceError> {
    Err(DeviceError::Unsupported(format!(
        "camera capture is not supported on this platform ({})",
        device
    )))
}

impl FrameSource for DeviceCapture {
    fn next(&mut self) -> Result<RgbImage, DeviceError> {
        if self.released {
            return Err(DeviceError::Closed(self.label.clone()));
        }
        let image = match self.pending.take() {
            Some(image) => image,
            None => self.read()?,
        };
        Ok(normalize(image, self.width, self.height))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pipe) = self.pipe.take() {
            pipe.close();
        }
        info!("Camera resources released: {}", self.label);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            pipe.close();
        }
    }
}

/// Video file played in a loop
pub struct FileCapture {
    path: PathBuf,
    width: u32,
    height: u32,
    timeout: Duration,
    pipe: Option<FfmpegPipe>,
    pending: Option<RgbImage>,
    released: bool,
}

impl FileCapture {
    pub fn open(path: &Path, config: &SourceConfig) -> Result<Self, DeviceError> {
        if !path.is_file() {
            return Err(DeviceError::NotFound(path.display().to_string()));
        }
        let mut capture = Self {
            path: path.to_path_buf(),
            width: config.width,
            height: config.height,
            timeout: config.read_timeout,
            pipe: None,
            pending: None,
            released: false,
        };
        let first = capture.read_looping()?;
        capture.pending = Some(first);
        info!("Video file opened: {}", path.display());
        Ok(capture)
    }

    fn spawn(&self) -> Result<FfmpegPipe, DeviceError> {
        let input = vec!["-i".to_string(), self.path.display().to_string()];
        FfmpegPipe::spawn(&input, self.width, self.height)
    }

    /// Next decoded frame, restarting from the first frame at end of file.
    fn read_looping(&mut self) -> Result<RgbImage, DeviceError> {
        let mut restarted = false;
        loop {
            if self.pipe.is_none() {
                self.pipe = Some(self.spawn()?);
            }
            let Some(pipe) = self.pipe.as_mut() else {
                return Err(DeviceError::Closed(self.path.display().to_string()));
            };

            match pipe.next_frame(self.timeout)? {
                Some(image) => return Ok(image),
                None if restarted => {
                    let label = self.path.display().to_string();
                    let err = pipe.exit_error(&label);
                    if let Some(pipe) = self.pipe.take() {
                        pipe.close();
                    }
                    return Err(err);
                }
                None => {
                    debug!("End of {}, looping", self.path.display());
                    if let Some(pipe) = self.pipe.take() {
                        pipe.close();
                    }
                    restarted = true;
                }
            }
        }
    }
}

impl FrameSource for FileCapture {
    fn next(&mut self) -> Result<RgbImage, DeviceError> {
        if self.released {
            return Err(DeviceError::Closed(self.path.display().to_string()));
        }
        let image = match self.pending.take() {
            Some(image) => image,
            None => self.read_looping()?,
        };
        Ok(normalize(image, self.width, self.height))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pipe) = self.pipe.take() {
            pipe.close();
        }
        info!("Video file released: {}", self.path.display());
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

impl Drop for FileCapture {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            pipe.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_found() {
        let config = SourceConfig::synthetic(32, 24);
        let err = FileCapture::open(Path::new("/no/such/video.mp4"), &config)
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_device_is_not_found() {
        let config = SourceConfig::synthetic(32, 24);
        let err = DeviceCapture::open("/dev/video-does-not-exist", &config)
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(640, 480), Some(921_600));
        assert_eq!(frame_len(0, 480), Some(0));
        assert_eq!(frame_len(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_oversized_frames_rejected_before_spawning() {
        let video = tempfile::NamedTempFile::new().unwrap();
        let config = SourceConfig::synthetic(u32::MAX, u32::MAX);
        let err = FileCapture::open(video.path(), &config).err().unwrap();
        assert!(matches!(err, DeviceError::Unsupported(_)), "{}", err);
    }

    #[test]
    fn test_read_frames_slices_stream() {
        let (tx, rx) = mpsc::sync_channel(4);
        // 2.5 frames of 12 bytes: the trailing partial frame is dropped
        let data: Vec<u8> = (0..30).collect();
        read_frames(std::io::Cursor::new(data), 12, tx);

        let received: Vec<_> = rx.iter().map(|r| r.unwrap()).collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1][0], 12);
    }

    #[test]
    fn test_read_frames_stops_when_receiver_gone() {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        read_frames(std::io::Cursor::new(vec![0u8; 48]), 12, tx);
    }
}
