//! Image conversion for clipboard payloads.
//!
//! The canonical wire form is an RGBA8 PNG. Encoding the same pixels
//! always yields the same bytes, so content that makes a round trip
//! through an OS clipboard hashes the same as what was written.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbaImage};
use tracing::debug;

use crate::error::RelayError;

/// Decode any supported format and re-encode it as canonical PNG.
pub fn to_png(data: &[u8]) -> Result<Vec<u8>, RelayError> {
    let image = image::load_from_memory(data)?;
    encode_png(&image)
}

/// Like [`to_png`], but only accepts PNG input.
pub fn reencode_png(data: &[u8]) -> Result<Vec<u8>, RelayError> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Png)?;
    encode_png(&image)
}

/// Canonical PNG for `data`, or `data` unchanged when it cannot be decoded.
pub fn normalize_image(data: &[u8]) -> Vec<u8> {
    match to_png(data) {
        Ok(png) => png,
        Err(e) => {
            debug!(len = data.len(), "passing undecodable image through: {e}");
            data.to_vec()
        }
    }
}

/// Encode raw RGBA pixels as canonical PNG.
pub fn rgba_to_png(width: usize, height: usize, rgba: Vec<u8>) -> Result<Vec<u8>, RelayError> {
    let (w, h) = (dimension(width)?, dimension(height)?);
    let image = RgbaImage::from_raw(w, h, rgba).ok_or_else(|| {
        RelayError::Image(format!("pixel buffer does not match {width}x{height} RGBA"))
    })?;
    encode_png(&DynamicImage::ImageRgba8(image))
}

/// Decode an image into `(width, height, rgba)`.
pub fn decode_rgba(data: &[u8]) -> Result<(usize, usize, Vec<u8>), RelayError> {
    let rgba = image::load_from_memory(data)?.to_rgba8();
    let (w, h) = rgba.dimensions();
    Ok((w as usize, h as usize, rgba.into_raw()))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, RelayError> {
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    let mut out = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

fn dimension(value: usize) -> Result<u32, RelayError> {
    u32::try_from(value).map_err(|_| RelayError::Image(format!("dimension {value} too large")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgba;

    pub(crate) fn sample_png() -> Vec<u8> {
        let image = RgbaImage::from_fn(4, 3, |x, y| Rgba([x as u8 * 60, y as u8 * 80, 200, 255]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn sample_bmp() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Bmp)
            .unwrap();
        out
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_image(&sample_png());
        let twice = normalize_image(&once);
        assert_eq!(once, twice);
        assert_eq!(image::guess_format(&once).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn other_formats_become_png() {
        let png = normalize_image(&sample_bmp());
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
        let (w, h, rgba) = decode_rgba(&png).unwrap();
        assert_eq!((w, h), (2, 2));
        assert_eq!(&rgba[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_passes_through() {
        let junk = b"definitely not an image".to_vec();
        assert_eq!(normalize_image(&junk), junk);
        assert!(to_png(&junk).is_err());
    }

    #[test]
    fn reencode_requires_png() {
        assert!(reencode_png(&sample_bmp()).is_err());
        assert!(reencode_png(&sample_png()).is_ok());
    }

    #[test]
    fn rgba_round_trip_is_stable() {
        let png = normalize_image(&sample_png());
        let (w, h, rgba) = decode_rgba(&png).unwrap();
        assert_eq!(rgba_to_png(w, h, rgba).unwrap(), png);
    }

    #[test]
    fn rgba_size_mismatch_is_an_error() {
        assert!(matches!(
            rgba_to_png(10, 10, vec![0; 3]),
            Err(RelayError::Image(_))
        ));
    }
}
