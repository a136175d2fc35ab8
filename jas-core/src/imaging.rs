//! PNG encoding and decoding for generated images.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use base64::prelude::*;
use image::{DynamicImage, ImageFormat};

/// Decodes raw bytes returned by an inference endpoint, sniffing the format.
pub fn decode_image(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    image::load_from_memory(bytes)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(bytes)
}

pub fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    Ok(BASE64_STANDARD.encode(encode_png(img)?))
}

/// Writes `img` as PNG regardless of the extension on `path`.
pub fn save_png(img: &DynamicImage, path: &Path) -> Result<()> {
    img.save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("failed to save image to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn checkerboard() -> DynamicImage {
        let img = RgbImage::from_fn(8, 5, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([250, 10, 30])
            } else {
                Rgb([0, 200, 99])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn png_bytes_decode_to_same_pixels() {
        let original = checkerboard();
        let bytes = encode_png(&original).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.to_rgb8(), original.to_rgb8());
    }

    #[test]
    fn garbage_is_not_an_image() {
        assert!(decode_image(b"{\"error\":\"model is loading\"}").is_err());
    }

    #[test]
    fn base64_output_is_png() {
        let encoded = image_to_base64_png(&checkerboard()).unwrap();
        let raw = BASE64_STANDARD.decode(encoded).unwrap();
        assert!(decode_image(&raw).is_ok());
    }
}
