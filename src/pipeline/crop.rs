//! Colour-mask cropping of frames before reconstruction.
//!
//! Each frame is cut down to the bounding box of the pixels whose colour lies
//! within `mean ± k·stdev` on every channel. Frames without a single matching
//! pixel are passed through unchanged.

use std::path::{Path, PathBuf};

use image::{GenericImageView, Rgb, RgbImage};
use tracing::debug;

use crate::error::{RigError, RigResult};
use crate::model::ColorSetting;

/// Inclusive per-channel RGB bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl ColorRange {
    /// Bounds `mean ± k·stdev`, clamped to `[0, 255]`.
    pub fn from_setting(color: &ColorSetting, k: f64) -> Self {
        let mut lower = [0u8; 3];
        let mut upper = [0u8; 3];
        for c in 0..3 {
            let spread = k * color.stdev[c];
            lower[c] = (color.mean[c] - spread).clamp(0.0, 255.0).floor() as u8;
            upper[c] = (color.mean[c] + spread).clamp(0.0, 255.0).ceil() as u8;
        }
        Self { lower, upper }
    }

    pub fn contains(&self, pixel: &Rgb<u8>) -> bool {
        (0..3).all(|c| self.lower[c] <= pixel[c] && pixel[c] <= self.upper[c])
    }
}

/// Bounding box `(x, y, width, height)` of the pixels inside `range`.
pub fn mask_bounding_box(img: &RgbImage, range: &ColorRange) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in img.enumerate_pixels() {
        if !range.contains(pixel) {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 - x0 + 1, y1 - y0 + 1))
}

/// Crop to the mask's bounding box, or `None` when nothing matches.
pub fn crop_to_mask(img: &RgbImage, range: &ColorRange) -> Option<RgbImage> {
    let (x, y, w, h) = mask_bounding_box(img, range)?;
    Some(img.view(x, y, w, h).to_image())
}

fn crop_file(source: &Path, target: &Path, range: &ColorRange) -> RigResult<bool> {
    let img = image::open(source)?.to_rgb8();
    match crop_to_mask(&img, range) {
        Some(cropped) => {
            cropped.save(target)?;
            Ok(true)
        }
        None => {
            std::fs::copy(source, target)?;
            Ok(false)
        }
    }
}

/// Crop every frame into `out_dir`, keeping file names. Returns the written
/// paths in input order.
pub async fn crop_frames(
    frames: &[PathBuf],
    out_dir: &Path,
    range: ColorRange,
) -> RigResult<Vec<PathBuf>> {
    tokio::fs::create_dir_all(out_dir).await?;
    let mut written = Vec::with_capacity(frames.len());
    let mut uncropped = 0usize;
    for source in frames {
        let name = source.file_name().ok_or_else(|| {
            RigError::DataInconsistency(format!("frame path {} has no file name", source.display()))
        })?;
        let target = out_dir.join(name);
        let (src, dst) = (source.clone(), target.clone());
        let cropped = tokio::task::spawn_blocking(move || crop_file(&src, &dst, &range))
            .await
            .map_err(|e| RigError::Io(std::io::Error::other(format!("crop task failed: {e}"))))??;
        if !cropped {
            uncropped += 1;
        }
        written.push(target);
    }
    debug!(frames = frames.len(), uncropped, "frames cropped");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn green_square() -> RgbImage {
        let mut img = RgbImage::from_pixel(40, 30, Rgb([10, 10, 10]));
        for y in 5..15 {
            for x in 20..30 {
                img.put_pixel(x, y, Rgb([40, 200, 40]));
            }
        }
        img
    }

    fn green() -> ColorSetting {
        ColorSetting {
            mean: [40.0, 200.0, 40.0],
            stdev: [5.0, 5.0, 5.0],
        }
    }

    #[test]
    fn test_range_clamps_to_byte() {
        let color = ColorSetting {
            mean: [250.0, 3.0, 128.0],
            stdev: [10.0, 10.0, 0.0],
        };
        let range = ColorRange::from_setting(&color, 2.0);
        assert_eq!(range.lower, [230, 0, 128]);
        assert_eq!(range.upper, [255, 23, 128]);
    }

    #[test]
    fn test_bounding_box() {
        let range = ColorRange::from_setting(&green(), 2.0);
        assert_eq!(mask_bounding_box(&green_square(), &range), Some((20, 5, 10, 10)));
    }

    #[test]
    fn test_crop_dimensions() {
        let range = ColorRange::from_setting(&green(), 2.0);
        let cropped = crop_to_mask(&green_square(), &range).unwrap();
        assert_eq!(cropped.dimensions(), (10, 10));
    }

    #[test]
    fn test_no_match_returns_none() {
        let red = ColorSetting {
            mean: [220.0, 10.0, 10.0],
            stdev: [1.0, 1.0, 1.0],
        };
        let range = ColorRange::from_setting(&red, 1.0);
        assert!(crop_to_mask(&green_square(), &range).is_none());
    }

    #[tokio::test]
    async fn test_crop_frames_passes_unmatched_through() {
        let dir = tempfile::tempdir().unwrap();
        let matched = dir.path().join("a.png");
        let plain = dir.path().join("b.png");
        green_square().save(&matched).unwrap();
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])).save(&plain).unwrap();

        let out = dir.path().join("cropped");
        let range = ColorRange::from_setting(&green(), 2.0);
        let written = crop_frames(&[matched, plain], &out, range).await.unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(image::open(&written[0]).unwrap().dimensions(), (10, 10));
        assert_eq!(image::open(&written[1]).unwrap().dimensions(), (8, 8));
    }
}
