use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, RgbImage};

/// Width of every normalized frame.
pub const OUTPUT_WIDTH: u32 = 2560;
/// Height of every normalized frame.
pub const OUTPUT_HEIGHT: u32 = 1920;

const LANDSCAPE_RATIO: f64 = 4.0 / 3.0;
const PORTRAIT_RATIO: f64 = 3.0 / 4.0;
/// Sources this close to the target ratio are used uncropped.
const RATIO_TOLERANCE: f64 = 0.01;
const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrientation {
    Landscape,
    Portrait,
}

impl FrameOrientation {
    pub fn from_dims(w: u32, h: u32) -> Self {
        if w < h {
            FrameOrientation::Portrait
        } else {
            FrameOrientation::Landscape
        }
    }

    /// Aspect ratio (width / height) the source is cropped to.
    pub fn crop_ratio(self) -> f64 {
        match self {
            FrameOrientation::Landscape => LANDSCAPE_RATIO,
            FrameOrientation::Portrait => PORTRAIT_RATIO,
        }
    }
}

/// Region of the source kept by the center crop, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropPlan {
    pub orientation: FrameOrientation,
    pub rect: CropRect,
}

impl CropPlan {
    pub fn is_full_frame(&self, width: u32, height: u32) -> bool {
        self.rect
            == (CropRect {
                x: 0,
                y: 0,
                width,
                height,
            })
    }
}

/// A decoded photo in display orientation. Both dimensions are non-zero.
pub struct SourceImage {
    image: DynamicImage,
}

impl SourceImage {
    /// Wrap a decoded image, refusing empty buffers.
    pub fn new(image: DynamicImage) -> Option<Self> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return None;
        }
        Some(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Always `OUTPUT_WIDTH` x `OUTPUT_HEIGHT` RGB pixels.
pub struct NormalizedFrame {
    pixels: RgbImage,
    plan: CropPlan,
}

impl NormalizedFrame {
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn plan(&self) -> &CropPlan {
        &self.plan
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Compute the centered crop that brings a `width` x `height` source to 4:3
/// (landscape) or 3:4 (portrait).
pub fn plan_crop(width: u32, height: u32) -> CropPlan {
    let orientation = FrameOrientation::from_dims(width, height);
    let crop_ratio = orientation.crop_ratio();
    let source_ratio = width as f64 / height as f64;

    let rect = if (source_ratio - crop_ratio).abs() < RATIO_TOLERANCE {
        CropRect {
            x: 0,
            y: 0,
            width,
            height,
        }
    } else if source_ratio > crop_ratio {
        // Too wide: keep the full height, trim the sides.
        let crop_w = round_dim(height as f64 * crop_ratio, width);
        CropRect {
            x: centered_offset(width, crop_w),
            y: 0,
            width: crop_w,
            height,
        }
    } else {
        // Too tall: keep the full width, trim top and bottom.
        let crop_h = round_dim(width as f64 / crop_ratio, height);
        CropRect {
            x: 0,
            y: centered_offset(height, crop_h),
            width,
            height: crop_h,
        }
    };
    CropPlan { orientation, rect }
}

fn round_dim(v: f64, max: u32) -> u32 {
    (v.round() as u32).clamp(1, max)
}

fn centered_offset(full: u32, kept: u32) -> u32 {
    let slack = full - kept;
    ((slack as f64 / 2.0).round() as u32).min(slack)
}

/// Crop, resize and (for portrait sources) rotate into the fixed landscape grid.
pub fn normalize(source: SourceImage) -> NormalizedFrame {
    let plan = plan_crop(source.width(), source.height());
    let full_frame = plan.is_full_frame(source.width(), source.height());
    let r = plan.rect;
    let cropped = source.image.crop_imm(r.x, r.y, r.width, r.height).to_rgb8();
    drop(source);

    let pixels = match plan.orientation {
        FrameOrientation::Landscape => {
            imageops::resize(&cropped, OUTPUT_WIDTH, OUTPUT_HEIGHT, RESIZE_FILTER)
        }
        FrameOrientation::Portrait => {
            let upright = imageops::resize(&cropped, OUTPUT_HEIGHT, OUTPUT_WIDTH, RESIZE_FILTER);
            rotate_portrait(&upright)
        }
    };
    tracing::trace!(
        orientation = ?plan.orientation,
        full_frame,
        crop_x = r.x,
        crop_y = r.y,
        crop_w = r.width,
        crop_h = r.height,
        "normalized frame"
    );
    NormalizedFrame { pixels, plan }
}

/// Turn an upright portrait buffer 90° clockwise: pixel (x, y) lands on
/// (h - 1 - y, x) where h is the upright height.
pub fn rotate_portrait(upright: &RgbImage) -> RgbImage {
    imageops::rotate90(upright)
}
