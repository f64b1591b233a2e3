use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{DetectedObject, DetectionLabel, DetectorError, ObjectDetector};
use crate::capture::frame::CameraFrame;
use crate::capture::geometry::{RectF, Rotation};

type Script = Box<dyn Fn(u64) -> Vec<DetectedObject> + Send + Sync>;

/// 可编排的检测器（测试用）
///
/// Objects are produced per frame number by a script closure.
pub struct MockDetector {
    script: Option<Script>,
    latency: Duration,
    fail_init: Option<String>,
    calls: Arc<AtomicUsize>,
    ready: bool,
}

impl MockDetector {
    pub fn new() -> Self {
        Self {
            script: None,
            latency: Duration::ZERO,
            fail_init: None,
            calls: Arc::new(AtomicUsize::new(0)),
            ready: false,
        }
    }

    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(u64) -> Vec<DetectedObject> + Send + Sync + 'static,
    {
        Self {
            script: Some(Box::new(script)),
            ..Self::new()
        }
    }

    /// Same object on every frame.
    pub fn with_fixed_object(bounding_box: RectF, label: &str) -> Self {
        let label = label.to_string();
        Self::with_script(move |_| {
            vec![DetectedObject::new(
                bounding_box,
                Some(1),
                vec![DetectionLabel {
                    text: label.clone(),
                    confidence: 0.85,
                    category_index: 0,
                }],
            )]
        })
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_init(mut self, reason: &str) -> Self {
        self.fail_init = Some(reason.to_string());
        self
    }

    /// Shared count of `detect_objects` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for MockDetector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn initialize(&mut self) -> Result<(), DetectorError> {
        if let Some(reason) = &self.fail_init {
            return Err(DetectorError::Initialization(reason.clone()));
        }
        self.ready = true;
        Ok(())
    }

    fn detect_objects(
        &mut self,
        frame: &CameraFrame,
        _rotation: Rotation,
    ) -> Result<Vec<DetectedObject>, DetectorError> {
        if !self.ready {
            return Err(DetectorError::NotInitialized);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let objects = self
            .script
            .as_ref()
            .map(|s| s(frame.frame_number))
            .unwrap_or_default();
        Ok(objects)
    }

    fn stop(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_frame(frame_number: u64) -> CameraFrame {
        CameraFrame::new(4, 4, Rotation::Deg0, vec![0u8; 64], 0, frame_number).unwrap()
    }

    #[test]
    fn test_mock_detector_with_script() {
        let mut detector = MockDetector::with_script(|n| {
            if n % 10 == 0 {
                vec![DetectedObject::new(RectF::new(0.0, 0.0, 2.0, 2.0), None, vec![])]
            } else {
                vec![]
            }
        });
        detector.initialize().unwrap();

        assert_eq!(detector.detect_objects(&create_test_frame(10), Rotation::Deg0).unwrap().len(), 1);
        assert!(detector.detect_objects(&create_test_frame(5), Rotation::Deg0).unwrap().is_empty());
        assert_eq!(detector.calls().load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mock_detector_init_failure() {
        let mut detector = MockDetector::new().failing_init("model missing");
        assert_eq!(
            detector.initialize(),
            Err(DetectorError::Initialization("model missing".to_string()))
        );
        assert!(!detector.is_ready());
    }
}
