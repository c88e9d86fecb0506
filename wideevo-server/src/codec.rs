//! Decode/encode collaborators around the normalizer.

use crate::error::ItemError;
use crate::geometry::{NormalizedFrame, SourceImage};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use std::io::Cursor;

/// Reference quality (0.95 on a 0..1 scale).
pub const DEFAULT_QUALITY: u8 = 95;

/// Turns a normalized frame into a baseline JPEG stream starting with SOI.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &NormalizedFrame) -> Result<Vec<u8>, ItemError>;
}

/// Baseline encoder from the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageJpegEncoder {
    quality: u8,
}

impl ImageJpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for ImageJpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY)
    }
}

impl FrameEncoder for ImageJpegEncoder {
    fn encode(&self, frame: &NormalizedFrame) -> Result<Vec<u8>, ItemError> {
        let px = frame.pixels();
        let mut buf = Vec::with_capacity((px.width() * px.height() / 4) as usize);
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .write_image(px.as_raw(), px.width(), px.height(), ExtendedColorType::Rgb8)
            .map_err(|e| ItemError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

/// Decode raw bytes and apply the file's EXIF orientation to the pixels.
pub fn decode(bytes: &[u8]) -> Result<SourceImage, ItemError> {
    let tag = extract_exif_orientation(bytes);
    let mut img = image::load_from_memory(bytes).map_err(|e| ItemError::Decode(e.to_string()))?;
    if let Some(tag) = tag {
        img = apply_exif_orientation(img, tag);
    }
    SourceImage::new(img).ok_or_else(|| ItemError::Decode("image has no pixels".into()))
}

/// Orientation (1-8) from the container's EXIF block, if any.
fn extract_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field
        .value
        .get_uint(0)
        .and_then(|v| u16::try_from(v).ok())
}

/// Bring pixels into display orientation.
fn apply_exif_orientation(img: DynamicImage, tag: u16) -> DynamicImage {
    match tag {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
