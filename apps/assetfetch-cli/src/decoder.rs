use assetfetch_core::{DecodeError, DecodedImage, ImageDecoder, RawImage, MAX_DISCARD_LEVEL};
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

/// Decoder for the formats the `image` crate reads (PNG, JPEG, BMP, TGA).
/// These are never partial, so a discard level is applied by downscaling.
pub struct ImageCrateDecoder;

#[async_trait]
impl ImageDecoder for ImageCrateDecoder {
    async fn decode(
        &self,
        data: Bytes,
        _priority: u32,
        discard: u8,
        want_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        tokio::task::spawn_blocking(move || decode_blocking(&data, discard, want_aux))
            .await
            .map_err(|err| DecodeError::Malformed(err.to_string()))?
    }
}

fn decode_blocking(data: &[u8], discard: u8, want_aux: bool) -> Result<DecodedImage, DecodeError> {
    let format = image::guess_format(data).map_err(|_| DecodeError::Unsupported)?;
    let mut img = image::load_from_memory_with_format(data, format)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let discard = discard.min(MAX_DISCARD_LEVEL);
    if discard > 0 {
        let (w, h) = img.dimensions();
        let w = (w >> discard).max(1);
        let h = (h >> discard).max(1);
        img = img.resize_exact(w, h, FilterType::Triangle);
    }
    let aux = (want_aux && img.color().has_alpha()).then(|| alpha_plane(&img));
    let rgba = img.to_rgba8();
    Ok(DecodedImage {
        raw: RawImage {
            width: rgba.width(),
            height: rgba.height(),
            components: 4,
            pixels: Bytes::from(rgba.into_raw()),
        },
        aux,
        discard,
    })
}

fn alpha_plane(img: &DynamicImage) -> RawImage {
    let rgba = img.to_rgba8();
    let alpha: Vec<u8> = rgba.pixels().map(|p| p.0[3]).collect();
    RawImage {
        width: rgba.width(),
        height: rgba.height(),
        components: 1,
        pixels: Bytes::from(alpha),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Bytes {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode");
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn decodes_and_downscales() {
        let full = ImageCrateDecoder
            .decode(png(16, 8), 0, 0, true)
            .await
            .expect("decode");
        assert_eq!((full.raw.width, full.raw.height), (16, 8));
        assert_eq!(full.raw.pixels.len(), 16 * 8 * 4);
        let aux = full.aux.expect("alpha plane");
        assert_eq!(aux.components, 1);
        assert!(aux.pixels.iter().all(|&a| a == 128));

        let reduced = ImageCrateDecoder
            .decode(png(16, 8), 0, 2, false)
            .await
            .expect("decode");
        assert_eq!((reduced.raw.width, reduced.raw.height), (4, 2));
        assert_eq!(reduced.discard, 2);
        assert!(reduced.aux.is_none());
    }

    #[tokio::test]
    async fn unknown_bytes_are_unsupported() {
        let err = ImageCrateDecoder
            .decode(Bytes::from_static(b"\x00\x01garbage"), 0, 0, false)
            .await
            .expect_err("not an image");
        assert!(matches!(err, DecodeError::Unsupported));
    }
}
