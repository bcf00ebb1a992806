//! Frame sources: camera device, video file, or synthetic pattern.
//!
//! Every source hands back raw RGB images already sized to the configured
//! resolution. The capture loop owns the source and is the only caller.

pub mod ffmpeg;
mod font;
pub mod synthetic;

use image::imageops::FilterType;
use image::RgbImage;
use tracing::{info, warn};

use crate::config::{SourceConfig, SourceKind};
use crate::error::DeviceError;

pub use ffmpeg::{DeviceCapture, FileCapture};
pub use synthetic::SyntheticGenerator;

/// Capability shared by every source variant
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn next(&mut self) -> Result<RgbImage, DeviceError>;

    /// Close the underlying device or file handle. Idempotent.
    fn release(&mut self);

    /// Human-readable description for logs and the status endpoint
    fn describe(&self) -> String;
}

/// Open the source named by the configuration.
pub fn open(config: &SourceConfig) -> Result<Box<dyn FrameSource>, DeviceError> {
    let source: Box<dyn FrameSource> = match &config.kind {
        SourceKind::Device(index) => Box::new(DeviceCapture::open(index, config)?),
        SourceKind::File(path) => Box::new(FileCapture::open(path, config)?),
        SourceKind::Synthetic => Box::new(SyntheticGenerator::new(config.width, config.height)),
    };
    info!("📷 Frame source opened: {}", source.describe());
    Ok(source)
}

/// Open the configured source, degrading to the synthetic generator when
/// it cannot be opened and fallback is allowed.
pub fn open_or_fallback(config: &SourceConfig, fallback: bool) -> Result<Box<dyn FrameSource>, DeviceError> {
    match open(config) {
        Ok(source) => Ok(source),
        Err(e) if fallback => {
            warn!("Failed to open {}: {}", config.kind, e);
            warn!("Falling back to simulation mode");
            Ok(Box::new(SyntheticGenerator::new(config.width, config.height)))
        }
        Err(e) => Err(e),
    }
}

/// Resize to the target resolution unless it already matches.
pub fn normalize(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    }
}
