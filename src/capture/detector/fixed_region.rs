use log::{debug, info};

use super::{DetectedObject, DetectionLabel, DetectorError, ObjectDetector};
use crate::capture::frame::CameraFrame;
use crate::capture::geometry::{RectF, Rotation};

const FIXED_REGION_LABEL: &str = "object";

/// 固定区域检测器（轻量降级方案）
///
/// Reports at most one object: a centered region covering `region_fraction`
/// of each upright axis, emitted only when that region shows enough edge
/// density and texture to hold something worth capturing.
pub struct FixedRegionDetector {
    region_fraction: f32,
    edge_threshold: f32,
    min_edge_density: f32,
    texture_threshold: f32,
    ready: bool,
}

impl FixedRegionDetector {
    pub fn new() -> Self {
        Self::with_region_fraction(0.5)
    }

    pub fn with_region_fraction(region_fraction: f32) -> Self {
        Self {
            region_fraction: region_fraction.clamp(0.05, 1.0),
            edge_threshold: 0.08,
            min_edge_density: 0.015,
            texture_threshold: 0.08,
            ready: false,
        }
    }

    /// Central region in upright frame coordinates.
    pub fn region(&self, frame_width: u32, frame_height: u32) -> RectF {
        let w = frame_width as f32 * self.region_fraction;
        let h = frame_height as f32 * self.region_fraction;
        RectF::from_xywh(
            (frame_width as f32 - w) / 2.0,
            (frame_height as f32 - h) / 2.0,
            w,
            h,
        )
    }

    fn region_luma(frame: &CameraFrame, x0: u32, y0: u32, x1: u32, y1: u32) -> (Vec<u8>, u32, u32) {
        let w = x1.saturating_sub(x0);
        let h = y1.saturating_sub(y0);
        let stride = frame.width as usize * 4;
        let mut gray = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y1 {
            let row = y as usize * stride;
            for x in x0..x1 {
                let idx = row + x as usize * 4;
                let r = frame.data[idx] as u32;
                let g = frame.data[idx + 1] as u32;
                let b = frame.data[idx + 2] as u32;
                gray.push(((r * 299 + g * 587 + b * 114) / 1000) as u8);
            }
        }
        (gray, w, h)
    }

    /// Every-3rd-pixel gradient check with integer math.
    fn edge_density(&self, gray: &[u8], width: u32, height: u32) -> f32 {
        let w = width as usize;
        let h = height as usize;
        if w < 3 || h < 3 {
            return 0.0;
        }
        let threshold = (self.edge_threshold * 255.0) as i32;
        let threshold_squared = threshold * threshold;
        let mut edge_count = 0u32;
        let mut total = 0u32;

        for y in (1..(h - 1)).step_by(3) {
            for x in (1..(w - 1)).step_by(3) {
                let idx = y * w + x;
                let gx = gray[idx + 1] as i32 - gray[idx - 1] as i32;
                let gy = gray[idx + w] as i32 - gray[idx - w] as i32;
                if gx * gx + gy * gy > threshold_squared {
                    edge_count += 1;
                }
                total += 1;
            }
        }

        if total == 0 {
            0.0
        } else {
            edge_count as f32 / total as f32
        }
    }

    fn texture(gray: &[u8]) -> f32 {
        if gray.is_empty() {
            return 0.0;
        }
        let mean = gray.iter().map(|&v| v as u32).sum::<u32>() as f32 / gray.len() as f32;
        let variance = gray
            .iter()
            .map(|&v| {
                let d = v as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / gray.len() as f32;
        variance.sqrt() / 255.0
    }
}

impl Default for FixedRegionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for FixedRegionDetector {
    fn name(&self) -> &'static str {
        "fixed_region"
    }

    fn initialize(&mut self) -> Result<(), DetectorError> {
        if !self.ready {
            info!(
                "🔧 FixedRegionDetector ready (region {:.0}%)",
                self.region_fraction * 100.0
            );
        }
        self.ready = true;
        Ok(())
    }

    fn detect_objects(
        &mut self,
        frame: &CameraFrame,
        rotation: Rotation,
    ) -> Result<Vec<DetectedObject>, DetectorError> {
        if !self.ready {
            return Err(DetectorError::NotInitialized);
        }
        if frame.data.len() < frame.pixel_count() * 4 || frame.pixel_count() == 0 {
            return Ok(Vec::new());
        }

        // A centered region keeps its place under rotation, only the axes swap.
        let sensor_region = self.region(frame.width, frame.height);
        let x0 = sensor_region.left.floor().max(0.0) as u32;
        let y0 = sensor_region.top.floor().max(0.0) as u32;
        let x1 = (sensor_region.right.ceil() as u32).min(frame.width);
        let y1 = (sensor_region.bottom.ceil() as u32).min(frame.height);
        let (gray, w, h) = Self::region_luma(frame, x0, y0, x1, y1);

        let edge_density = self.edge_density(&gray, w, h);
        let texture_score = Self::texture(&gray);
        let present = edge_density > self.min_edge_density && texture_score > self.texture_threshold;

        debug!(
            "FixedRegionDetector: frame {} edges={:.3} texture={:.3} present={}",
            frame.frame_number, edge_density, texture_score, present
        );

        if !present {
            return Ok(Vec::new());
        }

        let (frame_width, frame_height) = rotation.corrected_dims(frame.width, frame.height);
        Ok(vec![DetectedObject::new(
            self.region(frame_width, frame_height),
            Some(0),
            vec![DetectionLabel {
                text: FIXED_REGION_LABEL.to_string(),
                confidence: (edge_density + texture_score).min(1.0),
                category_index: 0,
            }],
        )])
    }

    fn stop(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
