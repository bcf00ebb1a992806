//! Synthetic test pattern.
//!
//! Output depends only on the frame counter and the timestamp handed in,
//! so two generators fed the same inputs produce identical frames.

use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

use super::font::{draw_text, GLYPH_HEIGHT};
use super::FrameSource;
use crate::error::DeviceError;

/// Frames per revolution of the moving disc
pub const MOTION_PERIOD: u64 = 126;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const CYAN: Rgb<u8> = Rgb([0, 255, 255]);

pub struct SyntheticGenerator {
    width: u32,
    height: u32,
    counter: u64,
}

impl SyntheticGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            counter: 0,
        }
    }

    /// Render the pattern for a given counter and wall-clock time.
    pub fn render(&self, counter: u64, at: DateTime<Utc>) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let mut image = RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                100,
                (50 + x * 50 / w) as u8,
                (50 + y * 50 / h) as u8,
            ])
        });

        let scale = (h / 240).max(1);
        let margin = 10 * scale;
        let line = (GLYPH_HEIGHT + 4) * scale;

        let (cx, cy) = disc_center(counter, w, h);
        fill_disc(&mut image, cx, cy, (h / 24).max(2) as i64, GREEN);

        let timestamp = at.format("%Y-%m-%d %H:%M:%S").to_string();
        draw_text(&mut image, &timestamp, margin, margin, scale, WHITE);

        let bottom = h.saturating_sub(margin + GLYPH_HEIGHT * scale);
        draw_text(&mut image, "SIMULATION MODE", margin, bottom.saturating_sub(line), scale, YELLOW);
        draw_text(&mut image, "VIRTUAL SECURITY CAMERA", margin, bottom, scale, CYAN);

        image
    }
}

/// Disc position for a counter. Only `counter % MOTION_PERIOD` matters.
pub fn disc_center(counter: u64, width: u32, height: u32) -> (i64, i64) {
    let phase = (counter % MOTION_PERIOD) as f64 / MOTION_PERIOD as f64 * std::f64::consts::TAU;
    let x = width as f64 / 2.0 + width as f64 * 0.3125 * phase.sin();
    let y = height as f64 / 2.0 + height as f64 * 0.2 * phase.cos();
    (x.round() as i64, y.round() as i64)
}

fn fill_disc(image: &mut RgbImage, cx: i64, cy: i64, radius: i64, color: Rgb<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for y in (cy - radius).max(0)..(cy + radius + 1).min(h) {
        for x in (cx - radius).max(0)..(cx + radius + 1).min(w) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius {
                image.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

impl FrameSource for SyntheticGenerator {
    fn next(&mut self) -> Result<RgbImage, DeviceError> {
        let image = self.render(self.counter, Utc::now());
        self.counter += 1;
        Ok(image)
    }

    fn release(&mut self) {}

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 34, 56).unwrap()
    }

    #[test]
    fn test_identical_generators_render_identical_frames() {
        let a = SyntheticGenerator::new(160, 120);
        let b = SyntheticGenerator::new(160, 120);
        for counter in [0, 1, 42, 125, 9_999] {
            assert_eq!(
                a.render(counter, fixed_time()).into_raw(),
                b.render(counter, fixed_time()).into_raw()
            );
        }
    }

    #[test]
    fn test_identical_generators_encode_identical_jpeg() {
        let a = SyntheticGenerator::new(160, 120);
        let b = SyntheticGenerator::new(160, 120);
        let ja = crate::capture::jpeg_encode(&a.render(7, fixed_time()), 85).unwrap();
        let jb = crate::capture::jpeg_encode(&b.render(7, fixed_time()), 85).unwrap();
        assert_eq!(ja, jb);
    }

    #[test]
    fn test_motion_repeats_with_period() {
        let g = SyntheticGenerator::new(160, 120);
        assert_eq!(
            g.render(3, fixed_time()).into_raw(),
            g.render(3 + MOTION_PERIOD, fixed_time()).into_raw()
        );
        assert_ne!(disc_center(0, 160, 120), disc_center(MOTION_PERIOD / 4, 160, 120));
    }

    #[test]
    fn test_timestamp_changes_frame() {
        let g = SyntheticGenerator::new(320, 240);
        let later = fixed_time() + chrono::Duration::seconds(1);
        assert_ne!(g.render(0, fixed_time()), g.render(0, later));
    }

    #[test]
    fn test_next_matches_resolution() {
        let mut g = SyntheticGenerator::new(64, 48);
        for _ in 0..3 {
            assert_eq!(g.next().unwrap().dimensions(), (64, 48));
        }
    }

    #[test]
    fn test_tiny_resolution_does_not_panic() {
        let g = SyntheticGenerator::new(1, 1);
        assert_eq!(g.render(5, fixed_time()).dimensions(), (1, 1));
    }
}
