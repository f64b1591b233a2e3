use std::sync::{Arc, RwLock};

use image::RgbaImage;

use super::detector::DetectedObject;
use super::geometry::Rotation;

/// 最新一帧的检测结果（不可变）
///
/// `frame_width`/`frame_height` are rotation-corrected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionSnapshot {
    pub objects: Vec<DetectedObject>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub rotation: Rotation,
    pub captured_at_ms: u64,
    pub frame_number: u64,
}

impl DetectionSnapshot {
    /// Snapshot with no objects that keeps the frame geometry.
    pub fn cleared(&self, now_ms: u64) -> Self {
        Self {
            objects: Vec::new(),
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            rotation: self.rotation,
            captured_at_ms: now_ms,
            frame_number: self.frame_number,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn has_frame_geometry(&self) -> bool {
        self.frame_width > 0 && self.frame_height > 0
    }
}

/// Everything consumers read about the pipeline, swapped as one value.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub snapshot: Arc<DetectionSnapshot>,
    /// Stable copy of the last analyzed frame, sensor orientation.
    pub capture_bitmap: Option<Arc<RgbaImage>>,
    pub last_detection_ms: Option<u64>,
}

impl PipelineState {
    pub fn without_bitmap(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            capture_bitmap: None,
            last_detection_ms: self.last_detection_ms,
        }
    }
}

/// Single shared slot holding the current [`PipelineState`].
///
/// Writers replace the whole `Arc`; readers clone it and never observe a
/// partially updated state. The lock is held only for the pointer swap.
#[derive(Debug, Default)]
pub struct StateCell {
    current: RwLock<Arc<PipelineState>>,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<PipelineState> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn store(&self, state: PipelineState) {
        let next = Arc::new(state);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Replace the state with `f(current)`.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&PipelineState) -> PipelineState,
    {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = f(&guard);
        *guard = Arc::new(next);
    }
}
