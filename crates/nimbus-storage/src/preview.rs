//! Preview placeholders for unencrypted images
//!
//! A placeholder is the image downscaled so its longest edge is at most
//! `max_dim` pixels, re-encoded as PNG. Generation is best-effort.

use anyhow::{Context, Result};
use image::ImageFormat;
use std::io::Cursor;

/// File extension appended to the storage key for placeholder files.
pub const PREVIEW_SUFFIX: &str = "preview.png";

pub fn is_image_mime(mime_type: &str) -> bool {
    mime_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("image/")
}

/// Decode `data` and render a small PNG placeholder.
pub fn render_placeholder(data: &[u8], max_dim: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data).context("decoding image for preview")?;
    let thumb = img.thumbnail(max_dim.max(1), max_dim.max(1));

    let mut out = Vec::new();
    thumb
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .context("encoding preview PNG")?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_mime_detection() {
        assert!(is_image_mime("image/png"));
        assert!(is_image_mime("IMAGE/JPEG"));
        assert!(!is_image_mime("application/pdf"));
        assert!(!is_image_mime("text/plain"));
    }

    #[test]
    fn placeholder_is_downscaled() {
        let png = sample_png(64, 48);
        let preview = render_placeholder(&png, 16).unwrap();

        let decoded = image::load_from_memory(&preview).unwrap();
        assert!(decoded.width() <= 16 && decoded.height() <= 16);
        assert_eq!(decoded.width(), 16, "aspect ratio keeps the longest edge");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(render_placeholder(b"definitely not an image", 16).is_err());
    }
}
