//! Image comparison for visual regression
//!
//! The scorer never modifies its inputs. Its only output file is the diff
//! visualisation, written when the images differ.

use std::path::Path;

use image::{GenericImageView, Pixel, RgbaImage};
use sha2::{Digest, Sha256};
use tracing::debug;

use gallery_common::DiffScore;

use crate::error::E2eResult;

/// Compares a generated image against its reference
pub trait ImageDiffer: Send + Sync {
    fn diff(&self, diff_path: &Path, generated: &Path, reference: &Path) -> E2eResult<DiffScore>;
}

/// In-process pixel comparison
#[derive(Debug, Clone)]
pub struct PixelDiffer {
    /// Largest per-channel difference still counted as equal
    tolerance: u8,
}

impl PixelDiffer {
    pub fn new(tolerance: u8) -> Self {
        Self { tolerance }
    }

    fn pixels_differ(&self, a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
        a.channels()
            .iter()
            .zip(b.channels())
            .any(|(x, y)| x.abs_diff(*y) > self.tolerance)
    }
}

impl Default for PixelDiffer {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ImageDiffer for PixelDiffer {
    fn diff(&self, diff_path: &Path, generated: &Path, reference: &Path) -> E2eResult<DiffScore> {
        if hash_file(generated)? == hash_file(reference)? {
            debug!("Images match exactly (same hash)");
            return Ok(DiffScore::Match);
        }

        let generated_img = image::open(generated)?;
        let reference_img = image::open(reference)?;

        if generated_img.dimensions() != reference_img.dimensions() {
            debug!(
                "Image dimensions differ: generated {:?} vs reference {:?}",
                generated_img.dimensions(),
                reference_img.dimensions()
            );
            return Ok(DiffScore::DimensionMismatch);
        }

        let (width, height) = generated_img.dimensions();
        let total_pixels = u64::from(width) * u64::from(height);
        if total_pixels == 0 {
            return Ok(DiffScore::Match);
        }

        let generated_rgba = generated_img.to_rgba8();
        let reference_rgba = reference_img.to_rgba8();

        let mut diff_img = RgbaImage::new(width, height);
        let mut diff_pixels = 0u64;

        for (x, y, generated_pixel) in generated_rgba.enumerate_pixels() {
            let reference_pixel = reference_rgba.get_pixel(x, y);

            if self.pixels_differ(generated_pixel, reference_pixel) {
                diff_pixels += 1;
                diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
            } else {
                // Dimmed copy of the original
                let c = generated_pixel.channels();
                diff_img.put_pixel(x, y, image::Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128]));
            }
        }

        if diff_pixels == 0 {
            return Ok(DiffScore::Match);
        }

        if let Some(parent) = diff_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        diff_img.save(diff_path)?;

        let percent = diff_pixels as f64 / total_pixels as f64 * 100.0;
        Ok(DiffScore::Differs(percent))
    }
}

/// Hash a file using SHA256
fn hash_file(path: &Path) -> E2eResult<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}
