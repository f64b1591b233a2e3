//! 垃圾识别实时检测 + 抓拍核心
//!
//! Camera frames flow through the [`analyzer`] into an immutable
//! [`snapshot`]; the UI reads the snapshot through the [`overlay`]
//! renderer, and a capture picks the best object with the [`selector`],
//! crops it with [`crop`] and writes it out through [`export`].

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod crop;
pub mod detector;
pub mod error;
pub mod export;
pub mod frame;
pub mod geometry;
pub mod overlay;
pub mod pipeline;
pub mod selector;
pub mod snapshot;
pub mod state_machine;

pub use analyzer::{AnalyzerStats, PipelineEvent};
pub use classifier::{Classification, ClassificationThrottle, Classifier, ClassifierError};
pub use config::{ConfigError, PipelineConfig};
pub use crop::{CropConfig, CropError, CropExtractor, CropResult};
pub use detector::{
    create_detector, DetectedObject, DetectionLabel, DetectorError, DetectorKind, ObjectDetector,
};
pub use error::CaptureError;
pub use export::ExportError;
pub use frame::{CameraFrame, FrameError, RawFrame};
pub use geometry::{transform_from_bitmap, transform_to_bitmap, PixelRect, RectF, Rotation};
pub use overlay::{render, AnalysisResult, DrawCommand, OverlayCalibration};
pub use pipeline::{CaptureOutcome, CapturePipeline};
pub use selector::{CandidateSelector, CaptureCandidate, NoCandidateError, NoCandidateReason};
pub use snapshot::{DetectionSnapshot, PipelineState};
pub use state_machine::{DetectionState, DetectionStateTracker, TrackerAction, TrackerConfig};
