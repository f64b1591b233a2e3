//! 垃圾识别扫描器（Flutter 接口）

use std::sync::Arc;

use flutter_rust_bridge::frb;
use image::RgbaImage;
use log::info;
use serde::{Deserialize, Serialize};

use crate::capture::classifier::LabelEchoClassifier;
use crate::capture::{
    AnalyzerStats, CaptureError, CaptureOutcome, CapturePipeline, ConfigError, DetectorError,
    DrawCommand, FrameError, PipelineConfig, PipelineEvent, RawFrame,
};

/// 扫描器错误类型，FRB 友好的设计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerApiError {
    pub error_type: String,
    pub message: String,
}

impl ScannerApiError {
    fn new(error_type: &str, message: String) -> Self {
        Self {
            error_type: error_type.to_string(),
            message,
        }
    }
}

impl std::fmt::Display for ScannerApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for ScannerApiError {}

impl From<CaptureError> for ScannerApiError {
    fn from(e: CaptureError) -> Self {
        Self::new(e.kind(), e.user_message())
    }
}

impl From<ConfigError> for ScannerApiError {
    fn from(e: ConfigError) -> Self {
        Self::new("Config", e.to_string())
    }
}

impl From<DetectorError> for ScannerApiError {
    fn from(e: DetectorError) -> Self {
        Self::new("Detector", e.to_string())
    }
}

impl From<FrameError> for ScannerApiError {
    fn from(e: FrameError) -> Self {
        Self::new("InvalidFrame", e.to_string())
    }
}

/// One box plus its label chip, in view pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayItem {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub color: u32,
    pub label: String,
    pub label_x: f32,
    pub label_y: f32,
}

fn overlay_items(commands: Vec<DrawCommand>) -> Vec<OverlayItem> {
    let mut items: Vec<OverlayItem> = Vec::new();
    for command in commands {
        match command {
            DrawCommand::Rect {
                rect, stroke_color, ..
            } => items.push(OverlayItem {
                left: rect.left,
                top: rect.top,
                right: rect.right,
                bottom: rect.bottom,
                color: stroke_color,
                label: String::new(),
                label_x: rect.left,
                label_y: rect.top,
            }),
            DrawCommand::LabelChip { text, x, y, .. } => {
                if let Some(item) = items.last_mut() {
                    item.label = text;
                    item.label_x = x;
                    item.label_y = y;
                }
            }
        }
    }
    items
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub image_path: String,
    pub fallback_label: String,
    pub tracking_id: Option<u32>,
    pub area_percentage: f32,
    pub score: f32,
    pub used_full_frame: bool,
}

impl From<CaptureOutcome> for CaptureInfo {
    fn from(outcome: CaptureOutcome) -> Self {
        Self {
            image_path: outcome.image_path.to_string_lossy().into_owned(),
            fallback_label: outcome.fallback_label,
            tracking_id: outcome.candidate.object.tracking_id,
            area_percentage: outcome.candidate.area_percentage,
            score: outcome.candidate.score,
            used_full_frame: outcome.used_full_frame,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScannerEvent {
    SnapshotPublished {
        frame_number: u64,
        object_count: u32,
    },
    OverlayCleared,
    Classified {
        tracking_id: Option<u32>,
        item_name: String,
        category: String,
        confidence: f32,
    },
    ClassificationFailed {
        message: String,
    },
}

impl From<PipelineEvent> for ScannerEvent {
    fn from(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::SnapshotPublished {
                frame_number,
                object_count,
            } => ScannerEvent::SnapshotPublished {
                frame_number,
                object_count: object_count as u32,
            },
            PipelineEvent::OverlayCleared => ScannerEvent::OverlayCleared,
            PipelineEvent::Classified {
                tracking_id,
                classification,
            } => ScannerEvent::Classified {
                tracking_id,
                item_name: classification.item_name,
                category: classification.category,
                confidence: classification.confidence,
            },
            PipelineEvent::ClassificationFailed { message } => {
                ScannerEvent::ClassificationFailed { message }
            }
        }
    }
}

/// 垃圾识别扫描器 - 实时检测 + 抓拍
///
/// ```dart
/// final scanner = WasteScanner.create(configJson: null);
/// scanner.start();
/// scanner.submitFrame(frame: rawFrame);
/// final boxes = scanner.overlay(viewWidth: w, viewHeight: h);
/// final info = scanner.capture();
/// ```
#[frb(opaque)]
pub struct WasteScanner {
    pipeline: CapturePipeline,
}

impl WasteScanner {
    /// 创建扫描器，config_json 为空时使用默认配置
    #[frb(sync)]
    pub fn create(config_json: Option<String>) -> Result<Self, ScannerApiError> {
        crate::init_logging();

        let config = match config_json {
            Some(json) => PipelineConfig::from_json(&json)?,
            None => PipelineConfig::default(),
        };
        // live results echo the detector label until a remote classifier is wired in Dart
        let pipeline =
            CapturePipeline::from_config(config).with_classifier(Arc::new(LabelEchoClassifier));
        info!("🗑️ WasteScanner: created ({} detector)", pipeline.detector_name());
        Ok(Self { pipeline })
    }

    /// 初始化检测器并开始分析
    #[frb(sync)]
    pub fn start(&self) -> Result<(), ScannerApiError> {
        self.pipeline.start()?;
        Ok(())
    }

    /// 提交一帧相机数据（只保留最新帧）
    #[frb(sync)]
    pub fn submit_frame(&self, frame: RawFrame) -> Result<bool, ScannerApiError> {
        Ok(self.pipeline.submit_raw_frame(&frame)?)
    }

    /// 当前检测框（视图坐标）
    #[frb(sync)]
    pub fn overlay(&self, view_width: f32, view_height: f32) -> Vec<OverlayItem> {
        overlay_items(self.pipeline.overlay(view_width, view_height))
    }

    /// 抓拍最显著的物体
    #[frb]
    pub fn capture(&self) -> Result<CaptureInfo, ScannerApiError> {
        Ok(self.pipeline.capture(None)?.into())
    }

    /// 使用高分辨率图片抓拍（RGBA，传感器方向）
    #[frb]
    pub fn capture_full_resolution(
        &self,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> Result<CaptureInfo, ScannerApiError> {
        let image = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
            ScannerApiError::new("InvalidFrame", format!("RGBA buffer does not match {}x{}", width, height))
        })?;
        Ok(self.pipeline.capture(Some(image))?.into())
    }

    /// 取出待处理事件
    #[frb(sync)]
    pub fn poll_events(&self) -> Vec<ScannerEvent> {
        self.pipeline.events().try_iter().map(ScannerEvent::from).collect()
    }

    /// 手动重置
    #[frb(sync)]
    pub fn reset(&self) {
        self.pipeline.reset()
    }

    #[frb(sync)]
    pub fn stop(&self) {
        self.pipeline.stop()
    }

    #[frb(sync, getter)]
    pub fn stats(&self) -> AnalyzerStats {
        self.pipeline.stats()
    }

    #[frb(sync, getter)]
    pub fn is_ready(&self) -> bool {
        self.pipeline.is_ready()
    }
}

impl Drop for WasteScanner {
    fn drop(&mut self) {
        info!("🗑️ WasteScanner: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::geometry::RectF;

    fn gray_frame(width: u32, height: u32, frame_number: u64) -> RawFrame {
        RawFrame::packed_i420(
            width,
            height,
            90,
            vec![128u8; (width * height) as usize],
            vec![128u8; (width * height / 4) as usize],
            vec![128u8; (width * height / 4) as usize],
            0,
            frame_number,
        )
    }

    #[test]
    fn test_create_with_invalid_config() {
        let err = WasteScanner::create(Some("{\"jpeg_quality\": 0}".to_string())).err().unwrap();
        assert_eq!(err.error_type, "Config");
    }

    #[test]
    fn test_capture_before_start() {
        let scanner = WasteScanner::create(None).unwrap();
        let err = scanner.capture().unwrap_err();
        assert_eq!(err.error_type, "NotReady");
        assert!(!scanner.is_ready());
    }

    #[test]
    fn test_lifecycle_with_flat_frames() {
        let scanner = WasteScanner::create(None).unwrap();
        scanner.start().unwrap();
        assert!(scanner.is_ready());

        // a flat gray scene has no edges, so the fixed-region backend reports nothing
        assert!(scanner.submit_frame(gray_frame(64, 48, 1)).unwrap());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while scanner.stats().frames_analyzed == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(scanner.stats().frames_analyzed, 1);
        assert!(scanner.overlay(1080.0, 1440.0).is_empty());
        assert_eq!(scanner.capture().unwrap_err().error_type, "NoCandidate");

        scanner.stop();
        scanner.stop();
        assert!(!scanner.is_ready());
    }

    #[test]
    fn test_invalid_raw_frame() {
        let scanner = WasteScanner::create(None).unwrap();
        let mut frame = gray_frame(8, 8, 0);
        frame.rotation_degrees = 45;
        assert_eq!(scanner.submit_frame(frame).unwrap_err().error_type, "InvalidFrame");
    }

    #[test]
    fn test_overlay_items_pair_rect_and_label() {
        let commands = vec![
            DrawCommand::Rect {
                rect: RectF::new(1.0, 2.0, 3.0, 4.0),
                stroke_color: 7,
                stroke_width: 4.0,
            },
            DrawCommand::LabelChip {
                text: "can 90%".to_string(),
                x: 1.0,
                y: 0.0,
                background_color: 7,
            },
        ];
        let items = overlay_items(commands);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "can 90%");
        assert_eq!(items[0].bottom, 4.0);
    }
}
