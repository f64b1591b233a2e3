use std::borrow::Cow;

use image::RgbaImage;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::resize_to_fit;
use super::geometry::{transform_to_bitmap, PixelRect, RectF, Rotation};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CropError {
    #[error("source bitmap has been released")]
    RecycledSource,
    #[error("crop region is degenerate: {width}x{height}")]
    DegenerateCrop { width: u32, height: u32 },
    #[error("box {bbox:?} lies outside the {frame_width}x{frame_height} frame")]
    OutOfBounds {
        bbox: RectF,
        frame_width: u32,
        frame_height: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Padding added on each side, as a fraction of the box extent on that axis.
    pub padding_fraction: f32,
    /// Sources larger than this (longest side) are downscaled before cropping.
    pub max_source_dimension: u32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            padding_fraction: 0.2,
            max_source_dimension: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CropResult {
    pub image: RgbaImage,
    /// Region of the (possibly downscaled) source that was copied.
    pub source_rect: PixelRect,
    /// Padding in source pixels on the x and y axes.
    pub padding_applied: (f32, f32),
    /// Scale of the working source relative to the bitmap passed in.
    pub source_scale: f32,
}

/// 裁剪器：分析帧坐标 -> 位图坐标 -> 加边距 -> 裁剪
pub struct CropExtractor {
    config: CropConfig,
}

impl CropExtractor {
    pub fn new(config: CropConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CropConfig {
        &self.config
    }

    pub fn extract(
        &self,
        source: &RgbaImage,
        bbox: &RectF,
        frame_width: u32,
        frame_height: u32,
        rotation: Rotation,
    ) -> Result<CropResult, CropError> {
        if source.width() == 0 || source.height() == 0 || source.as_raw().is_empty() {
            return Err(CropError::RecycledSource);
        }
        if !bbox.is_valid() || frame_width == 0 || frame_height == 0 {
            return Err(CropError::DegenerateCrop {
                width: bbox.width().max(0.0) as u32,
                height: bbox.height().max(0.0) as u32,
            });
        }
        if !bbox.intersects_bounds(frame_width as f32, frame_height as f32) {
            return Err(CropError::OutOfBounds {
                bbox: *bbox,
                frame_width,
                frame_height,
            });
        }

        let working: Cow<'_, RgbaImage> =
            match resize_to_fit(source, self.config.max_source_dimension) {
                Some(scaled) => Cow::Owned(scaled),
                None => Cow::Borrowed(source),
            };
        let (bitmap_width, bitmap_height) = working.dimensions();
        let source_scale = bitmap_width as f32 / source.width() as f32;

        let mapped = transform_to_bitmap(
            bbox,
            frame_width,
            frame_height,
            bitmap_width,
            bitmap_height,
            rotation,
        );
        let padding = (
            mapped.width() * self.config.padding_fraction,
            mapped.height() * self.config.padding_fraction,
        );
        let padded = mapped
            .expand(self.config.padding_fraction)
            .clamp_to(bitmap_width as f32, bitmap_height as f32);
        let region = PixelRect::enclosing(&padded, bitmap_width, bitmap_height);

        if region.width == 0 || region.height == 0 {
            return Err(CropError::DegenerateCrop {
                width: region.width,
                height: region.height,
            });
        }
        if !region.fits_within(bitmap_width, bitmap_height) {
            return Err(CropError::OutOfBounds {
                bbox: *bbox,
                frame_width,
                frame_height,
            });
        }

        debug!(
            "✂️ crop {:?} from {}x{} (box {:?}, rotation {})",
            region,
            bitmap_width,
            bitmap_height,
            bbox,
            rotation.degrees()
        );

        let image = image::imageops::crop_imm(
            working.as_ref(),
            region.x,
            region.y,
            region.width,
            region.height,
        )
        .to_image();

        Ok(CropResult {
            image,
            source_rect: region,
            padding_applied: padding,
            source_scale,
        })
    }
}

impl Default for CropExtractor {
    fn default() -> Self {
        Self::new(CropConfig::default())
    }
}
