//! Raster image re-encoding between jpg, png and gif.

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::info;

use super::{ensure_supported, ConvertError, ConvertedFile, Converter};
use crate::capability::{CapabilityClass, Format};
use crate::job::ConvertRequest;

/// Converter for the image capability class.
///
/// Decoding and encoding are CPU-bound and run on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct ImageConverter;

impl ImageConverter {
    pub fn new() -> Self {
        Self
    }
}

/// Composites an image over a white background, dropping alpha.
///
/// JPEG has no alpha channel; transparent regions become white rather
/// than black.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let px = rgba.get_pixel(x, y);
        let alpha = px[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(px[0]), blend(px[1]), blend(px[2])])
    })
}

/// Re-encodes `input` as `target`.
pub fn reencode(input: &[u8], target: Format) -> Result<Vec<u8>, ConvertError> {
    let img = image::load_from_memory(input).map_err(|e| ConvertError::Decode(e.to_string()))?;
    let mut out = Cursor::new(Vec::new());

    let encoded = match target {
        Format::Jpg => DynamicImage::ImageRgb8(flatten_onto_white(&img))
            .write_to(&mut out, ImageFormat::Jpeg),
        Format::Gif => DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut out, ImageFormat::Gif),
        Format::Png => img.write_to(&mut out, ImageFormat::Png),
        other => {
            return Err(ConvertError::Encode(format!(
                "{} is not an image format",
                other
            )))
        }
    };
    encoded.map_err(|e| ConvertError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

#[async_trait]
impl Converter for ImageConverter {
    fn class(&self) -> CapabilityClass {
        CapabilityClass::Image
    }

    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertedFile, ConvertError> {
        ensure_supported(self.class(), request)?;

        let payload = request.payload.clone();
        let target = request.target;
        let bytes = tokio::task::spawn_blocking(move || reencode(&payload, target))
            .await
            .map_err(|e| ConvertError::TaskFailed(e.to_string()))??;

        info!(
            filename = %request.filename,
            source = %request.source,
            target = %target,
            bytes = bytes.len(),
            "Image converted"
        );
        Ok(ConvertedFile::new(
            Bytes::from(bytes),
            format!("{}.{}", request.stem(), target),
            target.mime_type(),
        ))
    }
}
