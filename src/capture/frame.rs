use std::fmt;

use image::imageops::FilterType;
use image::RgbaImage;
use rayon::prelude::*;
use thiserror::Error;

use super::geometry::Rotation;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("unsupported rotation: {0} degrees")]
    UnsupportedRotation(i32),
    #[error("{plane} plane too short: got {actual} bytes, need {expected}")]
    PlaneTooShort {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("RGBA buffer size mismatch: got {actual} bytes, need {expected}")]
    BufferSize { expected: usize, actual: usize },
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// 相机帧 (RGBA)
///
/// `width`/`height` are the sensor-reported dims, not rotation-corrected.
/// The optional release hook runs exactly once when the frame is dropped,
/// which hands the buffer back to the camera source on every exit path.
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
    release: Option<ReleaseHook>,
}

impl CameraFrame {
    pub fn new(
        width: u32,
        height: u32,
        rotation: Rotation,
        data: Vec<u8>,
        timestamp_ms: u64,
        frame_number: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            rotation,
            data,
            timestamp_ms,
            frame_number,
            release: None,
        })
    }

    /// Attach the camera source's release obligation.
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn corrected_dims(&self) -> (u32, u32) {
        self.rotation.corrected_dims(self.width, self.height)
    }

    /// Stable copy of the pixels for capture, in sensor orientation.
    ///
    /// Downscaled (aspect preserved) when the largest side exceeds `max_dimension`.
    pub fn to_capture_bitmap(&self, max_dimension: u32) -> Option<RgbaImage> {
        let image = RgbaImage::from_raw(self.width, self.height, self.data.clone())?;
        Some(downscale_to_fit(image, max_dimension))
    }

    /// Same pixels rotated into the upright orientation for `rotation`.
    pub fn to_upright_image(&self, rotation: Rotation) -> Option<RgbaImage> {
        let image = RgbaImage::from_raw(self.width, self.height, self.data.clone())?;
        Some(match rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => image::imageops::rotate90(&image),
            Rotation::Deg180 => image::imageops::rotate180(&image),
            Rotation::Deg270 => image::imageops::rotate270(&image),
        })
    }

    /// 明确释放帧（等价于 drop）
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for CameraFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation", &self.rotation)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("frame_number", &self.frame_number)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Scale `image` down so that its largest side is at most `max_dimension`.
pub fn downscale_to_fit(image: RgbaImage, max_dimension: u32) -> RgbaImage {
    resize_to_fit(&image, max_dimension).unwrap_or(image)
}

/// Downscaled copy of `image`, or `None` when it already fits.
///
/// Borrows the source so large bitmaps are never copied before resizing.
pub fn resize_to_fit(image: &RgbaImage, max_dimension: u32) -> Option<RgbaImage> {
    let (width, height) = image.dimensions();
    let largest = width.max(height);
    if max_dimension == 0 || largest <= max_dimension {
        return None;
    }

    let scale = max_dimension as f32 / largest as f32;
    let target_width = ((width as f32 * scale).round() as u32).max(1);
    let target_height = ((height as f32 * scale).round() as u32).max(1);
    Some(image::imageops::resize(image, target_width, target_height, FilterType::Triangle))
}

/// 从原生层传递的原始帧数据 (YUV_420_888)
///
/// `uv_pixel_stride` is 1 for planar I420 and 2 for the interleaved layouts
/// Android cameras usually deliver.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rotation_degrees: i32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub y_row_stride: u32,
    pub uv_row_stride: u32,
    pub uv_pixel_stride: u32,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl RawFrame {
    /// Tightly packed I420 planes.
    pub fn packed_i420(
        width: u32,
        height: u32,
        rotation_degrees: i32,
        y_plane: Vec<u8>,
        u_plane: Vec<u8>,
        v_plane: Vec<u8>,
        timestamp_ms: u64,
        frame_number: u64,
    ) -> Self {
        Self {
            width,
            height,
            rotation_degrees,
            y_plane,
            u_plane,
            v_plane,
            y_row_stride: width,
            uv_row_stride: width.div_ceil(2),
            uv_pixel_stride: 1,
            timestamp_ms,
            frame_number,
        }
    }

    fn validate(&self) -> Result<Rotation, FrameError> {
        let rotation = Rotation::from_degrees(self.rotation_degrees)
            .ok_or(FrameError::UnsupportedRotation(self.rotation_degrees))?;

        let w = self.width as usize;
        let h = self.height as usize;
        if w == 0 || h == 0 {
            return Ok(rotation);
        }

        let y_needed = (h - 1) * self.y_row_stride as usize + w;
        if self.y_plane.len() < y_needed {
            return Err(FrameError::PlaneTooShort {
                plane: "Y",
                expected: y_needed,
                actual: self.y_plane.len(),
            });
        }

        let uv_w = w.div_ceil(2);
        let uv_h = h.div_ceil(2);
        let uv_needed = (uv_h - 1) * self.uv_row_stride as usize
            + (uv_w - 1) * self.uv_pixel_stride.max(1) as usize
            + 1;
        for (plane, data) in [("U", &self.u_plane), ("V", &self.v_plane)] {
            if data.len() < uv_needed {
                return Err(FrameError::PlaneTooShort {
                    plane,
                    expected: uv_needed,
                    actual: data.len(),
                });
            }
        }

        Ok(rotation)
    }

    pub fn to_rgba(&self) -> Result<CameraFrame, FrameError> {
        let rotation = self.validate()?;

        let w = self.width as usize;
        let y_stride = self.y_row_stride as usize;
        let uv_stride = self.uv_row_stride as usize;
        let uv_pixel = self.uv_pixel_stride.max(1) as usize;

        let mut rgba_data = vec![0u8; w * self.height as usize * 4];

        rgba_data
            .par_chunks_mut((w * 4).max(1))
            .enumerate()
            .for_each(|(y, row)| {
                let uv_row = (y / 2) * uv_stride;
                for x in 0..w {
                    let uv_idx = uv_row + (x / 2) * uv_pixel;

                    let y_val = self.y_plane[y * y_stride + x] as f32;
                    let u_val = self.u_plane[uv_idx] as f32 - 128.0;
                    let v_val = self.v_plane[uv_idx] as f32 - 128.0;

                    let r = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
                    let g = (y_val - 0.344136 * u_val - 0.714136 * v_val).clamp(0.0, 255.0) as u8;
                    let b = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;

                    let idx = x * 4;
                    row[idx] = r;
                    row[idx + 1] = g;
                    row[idx + 2] = b;
                    row[idx + 3] = 255;
                }
            });

        CameraFrame::new(
            self.width,
            self.height,
            rotation,
            rgba_data,
            self.timestamp_ms,
            self.frame_number,
        )
    }
}
