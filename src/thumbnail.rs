//! Story thumbnails: a full-frame still stamped with the channel logo, kept
//! as a PNG for the intro segment and as a JPEG small enough for upload.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::AssetSettings;
use crate::error::{PipelineError, Result};

const START_QUALITY: u8 = 95;
const MIN_QUALITY: u8 = 40;
const QUALITY_STEP: u8 = 5;

#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// Frame-sized PNG, used as the intro background.
    pub frame: PathBuf,
    pub jpeg: PathBuf,
    pub quality: u8,
}

/// Encodes at falling quality until the JPEG fits `max_bytes` or the floor is reached.
pub fn encode_jpeg_within(img: &RgbImage, max_bytes: u64) -> Result<(Vec<u8>, u8)> {
    let mut quality = START_QUALITY;
    loop {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality)
            .encode_image(img)
            .map_err(|e| PipelineError::asset("thumbnail", e.to_string()))?;
        if buf.len() as u64 <= max_bytes || quality <= MIN_QUALITY {
            debug!("Thumbnail JPEG at quality {}: {} bytes", quality, buf.len());
            return Ok((buf, quality));
        }
        quality -= QUALITY_STEP;
    }
}

fn stamp_logo(canvas: &mut RgbaImage, logo: &Path, width: u32, padding: u32) -> Result<()> {
    let logo = image::open(logo)
        .map_err(|e| PipelineError::asset(logo.display().to_string(), e.to_string()))?
        .to_rgba8();
    let height = (width as f64 * logo.height() as f64 / logo.width().max(1) as f64).round().max(1.0) as u32;
    let logo = imageops::resize(&logo, width, height, FilterType::Lanczos3);
    let x = canvas.width().saturating_sub(width + padding);
    imageops::overlay(canvas, &logo, x as i64, padding as i64);
    Ok(())
}

/// Builds `thumbnail.png` and `thumbnail.jpg` in `out_dir` from `source`.
pub fn prepare(
    source: &Path,
    logo: Option<&Path>,
    assets: &AssetSettings,
    size: (u32, u32),
    max_bytes: u64,
    out_dir: &Path,
) -> Result<Thumbnail> {
    let (width, height) = size;
    let mut canvas = image::open(source)
        .map_err(|e| PipelineError::asset(source.display().to_string(), e.to_string()))?
        .to_rgba8();
    if canvas.dimensions() != (width, height) {
        canvas = imageops::resize(&canvas, width, height, FilterType::Lanczos3);
    }
    if let Some(logo) = logo {
        if let Err(e) = stamp_logo(&mut canvas, logo, assets.logo_width, assets.logo_padding) {
            warn!("Thumbnail left without logo: {}", e);
        }
    }

    fs::create_dir_all(out_dir)?;
    let frame = out_dir.join("thumbnail.png");
    canvas
        .save_with_format(&frame, ImageFormat::Png)
        .map_err(|e| PipelineError::Io(std::io::Error::other(format!("{}: {e}", frame.display()))))?;

    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let (bytes, quality) = encode_jpeg_within(&rgb, max_bytes)?;
    if bytes.len() as u64 > max_bytes {
        warn!("Thumbnail is {} bytes even at quality {}", bytes.len(), quality);
    }
    let jpeg = out_dir.join("thumbnail.jpg");
    fs::write(&jpeg, &bytes)?;
    info!("Thumbnail ready: {} ({:.2} MB, quality {})", jpeg.display(), bytes.len() as f64 / 1_048_576.0, quality);
    Ok(Thumbnail { frame, jpeg, quality })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn noise(width: u32, height: u32) -> RgbImage {
        let mut state = 0x9e37_79b9u32;
        RgbImage::from_fn(width, height, |_, _| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let b = state.to_le_bytes();
            image::Rgb([b[1], b[2], b[3]])
        })
    }

    #[test]
    fn quality_drops_until_the_jpeg_fits() {
        let img = noise(256, 256);
        let (full, q) = encode_jpeg_within(&img, u64::MAX).unwrap();
        assert_eq!(q, START_QUALITY);

        let limit = full.len() as u64 - 1;
        let (smaller, q) = encode_jpeg_within(&img, limit).unwrap();
        assert!(q < START_QUALITY);
        assert!(smaller.len() as u64 <= limit);
        assert_eq!(image::guess_format(&smaller).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn quality_never_goes_below_the_floor() {
        let (_, q) = encode_jpeg_within(&noise(64, 64), 1).unwrap();
        assert_eq!(q, MIN_QUALITY);
    }

    #[test]
    fn prepare_resizes_and_stamps_the_logo() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        noise(40, 30).save(&source).unwrap();
        let logo = dir.path().join("logo.png");
        RgbaImage::from_pixel(10, 5, Rgba([255, 0, 0, 255])).save(&logo).unwrap();
        let assets = AssetSettings {
            logo_width: 20,
            logo_padding: 4,
            ..AssetSettings::default()
        };

        let thumb = prepare(&source, Some(logo.as_path()), &assets, (90, 160), 2 * 1024 * 1024, dir.path()).unwrap();
        let frame = image::open(&thumb.frame).unwrap().to_rgba8();
        assert_eq!(frame.dimensions(), (90, 160));
        // logo is 20x10 at x = 90 - 20 - 4, y = 4
        assert_eq!(frame.get_pixel(70, 6).0, [255, 0, 0, 255]);
        assert_eq!(frame.get_pixel(83, 11).0, [255, 0, 0, 255]);
        assert!(fs::metadata(&thumb.jpeg).unwrap().len() <= 2 * 1024 * 1024);
        assert_eq!(thumb.quality, START_QUALITY);
    }

    #[test]
    fn unreadable_source_is_an_asset_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("thumb.png");
        fs::write(&bogus, b"not an image").unwrap();
        let err = prepare(&bogus, None, &AssetSettings::default(), (90, 160), 1024, dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::AssetUnavailable { .. }));
    }
}
