//! 检测框叠加层渲染
//!
//! A pure mapping from analysis results plus view geometry to draw
//! commands; the UI layer executes the commands with whatever toolkit
//! it uses.

use serde::{Deserialize, Serialize};

use super::geometry::{area_percentage, RectF};
use super::selector::CandidateSelector;
use super::snapshot::DetectionSnapshot;

/// Render-ready projection of one detected object.
///
/// `bounding_box` is in analysis-frame space; [`render`] maps it to view pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub bounding_box: RectF,
    pub label: String,
    pub area_percentage: f32,
    pub confidence: f32,
    pub tracking_id: Option<u32>,
}

impl AnalysisResult {
    /// Displayable objects of `snapshot`, in detection order.
    pub fn from_snapshot(snapshot: &DetectionSnapshot, selector: &CandidateSelector) -> Vec<Self> {
        selector
            .displayable(snapshot)
            .into_iter()
            .map(|object| {
                let top = object.top_label();
                AnalysisResult {
                    bounding_box: object.bounding_box,
                    label: top.map(|l| l.text.clone()).unwrap_or_default(),
                    area_percentage: area_percentage(
                        &object.bounding_box,
                        snapshot.frame_width,
                        snapshot.frame_height,
                    ),
                    confidence: top.map(|l| l.confidence).unwrap_or(0.0),
                    tracking_id: object.tracking_id,
                }
            })
            .collect()
    }
}

/// Device-specific preview alignment.
///
/// These are tuning values measured on the reference handset, not derived
/// geometry; use [`OverlayCalibration::none`] on unknown devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayCalibration {
    pub offset_x: f32,
    pub offset_y: f32,
    pub vertical_expansion: f32,
}

impl OverlayCalibration {
    pub fn none() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            vertical_expansion: 1.0,
        }
    }
}

impl Default for OverlayCalibration {
    fn default() -> Self {
        Self {
            offset_x: 60.0,
            offset_y: -75.0,
            vertical_expansion: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DrawCommand {
    Rect {
        rect: RectF,
        stroke_color: u32,
        stroke_width: f32,
    },
    LabelChip {
        text: String,
        /// Top-left corner of the chip in view pixels.
        x: f32,
        y: f32,
        background_color: u32,
    },
}

const PALETTE: [u32; 6] = [
    0xFF4CAF50, 0xFF2196F3, 0xFFFFC107, 0xFFE91E63, 0xFF9C27B0, 0xFF00BCD4,
];
const STROKE_WIDTH: f32 = 4.0;
const LABEL_CHIP_HEIGHT: f32 = 40.0;

fn color_for(result: &AnalysisResult, index: usize) -> u32 {
    let key = result.tracking_id.map(|id| id as usize).unwrap_or(index);
    PALETTE[key % PALETTE.len()]
}

pub fn render(
    results: &[AnalysisResult],
    frame_width: u32,
    frame_height: u32,
    view_width: f32,
    view_height: f32,
    calibration: &OverlayCalibration,
) -> Vec<DrawCommand> {
    if results.is_empty()
        || frame_width == 0
        || frame_height == 0
        || view_width <= 0.0
        || view_height <= 0.0
    {
        return Vec::new();
    }

    let fw = frame_width as f32;
    let fh = frame_height as f32;
    let scale = (view_width / fw).min(view_height / fh);
    let offset_x = (view_width - fw * scale) / 2.0;
    let offset_y = (view_height - fh * scale) / 2.0;

    let mut commands = Vec::with_capacity(results.len() * 2);
    for (index, result) in results.iter().enumerate() {
        let b = &result.bounding_box;
        let left = b.left * scale + offset_x + calibration.offset_x;
        let right = b.right * scale + offset_x + calibration.offset_x;
        let top = b.top * scale + offset_y + calibration.offset_y;
        let bottom = b.bottom * scale + offset_y + calibration.offset_y;

        let center_y = (top + bottom) / 2.0;
        let half_height = (bottom - top) / 2.0 * calibration.vertical_expansion;
        let rect = RectF::new(left, center_y - half_height, right, center_y + half_height);

        let color = color_for(result, index);
        commands.push(DrawCommand::Rect {
            rect,
            stroke_color: color,
            stroke_width: STROKE_WIDTH,
        });
        commands.push(DrawCommand::LabelChip {
            text: format!("{} {:.0}%", result.label, result.confidence * 100.0),
            x: rect.left.max(0.0),
            y: (rect.top - LABEL_CHIP_HEIGHT).max(0.0),
            background_color: color,
        });
    }
    commands
}
