//! 抓拍候选目标选择
//!
//! score = area% - distance_from_center / 100, highest wins, ties go to
//! the earlier object.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::detector::DetectedObject;
use super::geometry::area_percentage;
use super::snapshot::DetectionSnapshot;
use super::state_machine::is_stale;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoCandidateReason {
    /// Nothing detected within the staleness window.
    Stale,
    /// Objects are on screen but none is large or centered enough.
    NotProminent,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("no capture candidate: {reason:?}")]
pub struct NoCandidateError {
    pub reason: NoCandidateReason,
}

impl NoCandidateError {
    pub fn user_message(&self) -> &'static str {
        match self.reason {
            NoCandidateReason::Stale => "No object detected in the last few seconds. Point the camera at an item.",
            NoCandidateReason::NotProminent => "Move closer so the item fills more of the frame and is centered.",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureCandidate {
    pub object: DetectedObject,
    pub area_percentage: f32,
    pub distance_from_center: f32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Minimum area share (percent) for an object to be drawn.
    pub display_threshold_pct: f32,
    /// Minimum area share (percent) for an object to be exported.
    pub capture_threshold_pct: f32,
    /// Inside a pipeline this follows `TrackerConfig::stale_after_ms`.
    pub stale_after_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            display_threshold_pct: 0.5,
            capture_threshold_pct: 1.0,
            stale_after_ms: 5000,
        }
    }
}

pub fn selection_score(area_percentage: f32, distance_from_center: f32) -> f32 {
    area_percentage - distance_from_center / 100.0
}

pub struct CandidateSelector {
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Valid objects at or above the display threshold, in input order.
    pub fn displayable<'a>(&self, snapshot: &'a DetectionSnapshot) -> Vec<&'a DetectedObject> {
        snapshot
            .objects
            .iter()
            .filter(|o| o.is_valid())
            .filter(|o| {
                area_percentage(&o.bounding_box, snapshot.frame_width, snapshot.frame_height)
                    >= self.config.display_threshold_pct
            })
            .collect()
    }

    pub fn evaluate(&self, object: &DetectedObject, frame_width: u32, frame_height: u32) -> CaptureCandidate {
        let area = area_percentage(&object.bounding_box, frame_width, frame_height);
        let (cx, cy) = object.bounding_box.center();
        let dx = cx - frame_width as f32 / 2.0;
        let dy = cy - frame_height as f32 / 2.0;
        let distance = (dx * dx + dy * dy).sqrt();
        CaptureCandidate {
            object: object.clone(),
            area_percentage: area,
            distance_from_center: distance,
            score: selection_score(area, distance),
        }
    }

    pub fn select(
        &self,
        snapshot: &DetectionSnapshot,
        last_detection_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<CaptureCandidate, NoCandidateError> {
        let mut best: Option<CaptureCandidate> = None;

        for object in snapshot.objects.iter().filter(|o| o.is_valid()) {
            let candidate = self.evaluate(object, snapshot.frame_width, snapshot.frame_height);
            if candidate.area_percentage < self.config.capture_threshold_pct {
                continue;
            }
            let better = best.as_ref().map_or(true, |b| candidate.score > b.score);
            if better {
                best = Some(candidate);
            }
        }

        best.ok_or_else(|| {
            let reason = if snapshot.is_empty()
                || is_stale(last_detection_ms, now_ms, self.config.stale_after_ms)
            {
                NoCandidateReason::Stale
            } else {
                NoCandidateReason::NotProminent
            };
            NoCandidateError { reason }
        })
    }
}

impl Default for CandidateSelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}
