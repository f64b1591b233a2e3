//! 目标检测后端抽象
//!
//! Every backend satisfies the same contract: `initialize` may fail once,
//! `detect_objects` only errors on contract misuse (not initialized) and
//! turns backend hiccups into an empty result, `stop` is idempotent.

pub mod fixed_region;
#[cfg(test)]
pub(crate) mod mock;
pub mod tracking;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::CameraFrame;
use super::geometry::{RectF, Rotation};

pub use fixed_region::FixedRegionDetector;
#[cfg(test)]
pub(crate) use mock::MockDetector;
pub use tracking::{ContrastBlobModel, InferenceModel, RawDetection, TrackingDetector};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector initialization failed: {0}")]
    Initialization(String),
    #[error("detector not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionLabel {
    pub text: String,
    pub confidence: f32,
    pub category_index: u32,
}

/// One object reported by a backend.
///
/// `bounding_box` lives in analysis-frame space (upright, rotation-corrected).
/// At 180° the corrected dims equal the sensor dims and the box is reported
/// in sensor orientation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub bounding_box: RectF,
    pub tracking_id: Option<u32>,
    /// Ordered by descending confidence.
    pub labels: Vec<DetectionLabel>,
}

impl DetectedObject {
    pub fn new(bounding_box: RectF, tracking_id: Option<u32>, labels: Vec<DetectionLabel>) -> Self {
        Self {
            bounding_box,
            tracking_id,
            labels,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bounding_box.is_valid()
    }

    pub fn top_label(&self) -> Option<&DetectionLabel> {
        self.labels.first()
    }
}

pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Prepare backend resources. Safe to call again after `stop`.
    fn initialize(&mut self) -> Result<(), DetectorError>;

    /// Detect objects in `frame`.
    ///
    /// Backend failures complete with an empty list; only calling before
    /// `initialize` is an error.
    fn detect_objects(
        &mut self,
        frame: &CameraFrame,
        rotation: Rotation,
    ) -> Result<Vec<DetectedObject>, DetectorError>;

    /// Release backend resources. Idempotent.
    fn stop(&mut self);

    fn is_ready(&self) -> bool;
}

/// 检测后端选择（按构建/运行时配置）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorKind {
    Tracking {
        model_dir: PathBuf,
        #[serde(default = "default_max_objects")]
        max_objects: usize,
        #[serde(default = "default_min_confidence")]
        min_confidence: f32,
    },
    FixedRegion {
        #[serde(default = "default_region_fraction")]
        region_fraction: f32,
    },
}

fn default_max_objects() -> usize {
    5
}

fn default_min_confidence() -> f32 {
    0.3
}

fn default_region_fraction() -> f32 {
    0.5
}

impl Default for DetectorKind {
    fn default() -> Self {
        DetectorKind::FixedRegion {
            region_fraction: default_region_fraction(),
        }
    }
}

pub fn create_detector(kind: &DetectorKind) -> Box<dyn ObjectDetector> {
    match kind {
        DetectorKind::Tracking {
            model_dir,
            max_objects,
            min_confidence,
        } => Box::new(
            TrackingDetector::new(model_dir.clone())
                .with_max_objects(*max_objects)
                .with_min_confidence(*min_confidence),
        ),
        DetectorKind::FixedRegion { region_fraction } => {
            Box::new(FixedRegionDetector::with_region_fraction(*region_fraction))
        }
    }
}
