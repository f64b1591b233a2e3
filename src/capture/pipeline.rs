//! 抓拍管线：生命周期 + 抓拍流程

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use image::RgbaImage;
use log::{error, info, warn};

use super::analyzer::{
    emit, lock, AnalysisContext, AnalyzerStats, DetectorLifecycle, FrameAnalyzer,
    LiveClassification, MonotonicClock, PipelineEvent, SharedDetector, StatsCounters,
};
use super::classifier::{ClassificationThrottle, Classifier};
use super::config::PipelineConfig;
use super::crop::CropExtractor;
use super::detector::{create_detector, DetectorError, ObjectDetector};
use super::error::CaptureError;
use super::export::save_capture;
use super::frame::{resize_to_fit, CameraFrame, FrameError, RawFrame};
use super::geometry::PixelRect;
use super::overlay::{render, AnalysisResult, DrawCommand};
use super::selector::{CandidateSelector, CaptureCandidate};
use super::snapshot::{DetectionSnapshot, PipelineState, StateCell};
use super::state_machine::DetectionStateTracker;

const FALLBACK_LABEL: &str = "object";

/// Result of a capture: only the file path travels onward.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub image_path: PathBuf,
    pub fallback_label: String,
    pub candidate: CaptureCandidate,
    /// Crop region in the (possibly downscaled) source; `None` for full-frame fallback.
    pub source_rect: Option<PixelRect>,
    pub used_full_frame: bool,
}

/// Crop `candidate` out of `source` and persist it; falls back to the
/// full frame when the crop cannot be produced.
pub(crate) fn export_candidate(
    source: &RgbaImage,
    snapshot: &DetectionSnapshot,
    candidate: CaptureCandidate,
    extractor: &CropExtractor,
    capture_dir: &Path,
    jpeg_quality: u8,
) -> Result<CaptureOutcome, CaptureError> {
    let fallback_label = candidate
        .object
        .top_label()
        .map(|l| l.text.clone())
        .unwrap_or_else(|| FALLBACK_LABEL.to_string());

    let crop = extractor.extract(
        source,
        &candidate.object.bounding_box,
        snapshot.frame_width,
        snapshot.frame_height,
        snapshot.rotation,
    );

    let (image, source_rect, used_full_frame) = match crop {
        Ok(result) => (result.image, Some(result.source_rect), false),
        Err(e) => {
            warn!("⚠️ crop failed ({}), exporting full frame", e);
            if source.width() == 0 || source.height() == 0 {
                return Err(CaptureError::NoImage(e.to_string()));
            }
            let full = resize_to_fit(source, extractor.config().max_source_dimension)
                .unwrap_or_else(|| source.clone());
            (full, None, true)
        }
    };

    let image_path = save_capture(&image, capture_dir, jpeg_quality)?;
    info!(
        "📸 captured '{}' ({}x{}, full frame: {}) -> {}",
        fallback_label,
        image.width(),
        image.height(),
        used_full_frame,
        image_path.display()
    );

    Ok(CaptureOutcome {
        image_path,
        fallback_label,
        candidate,
        source_rect,
        used_full_frame,
    })
}

pub(crate) fn classify_and_report(
    classifier: &dyn Classifier,
    outcome: &CaptureOutcome,
    events: &Sender<PipelineEvent>,
) {
    match classifier.classify(&outcome.image_path, &outcome.fallback_label) {
        Ok(classification) => {
            info!(
                "🏷️ classified as {} ({})",
                classification.item_name, classification.category
            );
            emit(
                events,
                PipelineEvent::Classified {
                    tracking_id: outcome.candidate.object.tracking_id,
                    classification,
                },
            );
        }
        Err(e) => {
            warn!("⚠️ classification failed: {}", e);
            emit(
                events,
                PipelineEvent::ClassificationFailed {
                    message: e.to_string(),
                },
            );
        }
    }
}

/// 抓拍管线
///
/// ```ignore
/// let pipeline = CapturePipeline::from_config(PipelineConfig::default());
/// pipeline.start()?;
/// pipeline.submit_frame(frame);
/// let commands = pipeline.overlay(1080.0, 1920.0);
/// let outcome = pipeline.capture(None)?;
/// ```
pub struct CapturePipeline {
    config: PipelineConfig,
    detector: SharedDetector,
    detector_name: &'static str,
    lifecycle: Arc<DetectorLifecycle>,
    state: Arc<StateCell>,
    tracker: Arc<Mutex<DetectionStateTracker>>,
    stats: Arc<StatsCounters>,
    selector: CandidateSelector,
    extractor: CropExtractor,
    clock: MonotonicClock,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    classifier: Option<Arc<dyn Classifier>>,
    throttle: Arc<ClassificationThrottle>,
    analyzer: Mutex<Option<FrameAnalyzer>>,
}

impl CapturePipeline {
    pub fn new(config: PipelineConfig, detector: Box<dyn ObjectDetector>) -> Self {
        let detector_name = detector.name();
        let (events_tx, events_rx) = bounded(config.event_capacity.max(1));
        Self {
            detector: Arc::new(Mutex::new(detector)),
            detector_name,
            lifecycle: Arc::new(DetectorLifecycle::default()),
            state: Arc::new(StateCell::new()),
            tracker: Arc::new(Mutex::new(DetectionStateTracker::with_config(
                config.tracker.clone(),
            ))),
            stats: Arc::new(StatsCounters::default()),
            selector: CandidateSelector::new(config.selector_config()),
            extractor: CropExtractor::new(config.crop.clone()),
            clock: MonotonicClock::new(),
            events_tx,
            events_rx,
            classifier: None,
            throttle: Arc::new(ClassificationThrottle::new(config.classify_interval())),
            analyzer: Mutex::new(None),
            config,
        }
    }

    /// Pipeline with the detector backend named by `config.detector`.
    pub fn from_config(config: PipelineConfig) -> Self {
        let detector = create_detector(&config.detector);
        Self::new(config, detector)
    }

    /// Classifier used for live classification while scanning.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector_name
    }

    /// Initialize the detector and start the analysis worker.
    ///
    /// A no-op while running. Calling again after [`stop`](Self::stop) resumes.
    pub fn start(&self) -> Result<(), DetectorError> {
        let mut analyzer = lock(&self.analyzer);
        if analyzer.is_some() {
            return Ok(());
        }

        self.lifecycle.begin_run();
        {
            let mut detector = lock(&self.detector);
            if !detector.is_ready() {
                if let Err(e) = detector.initialize() {
                    error!("❌ {} detector failed to initialize: {}", self.detector_name, e);
                    return Err(e);
                }
            }
        }

        let live = match (&self.classifier, self.config.live_classification) {
            (Some(classifier), true) => Some(LiveClassification {
                classifier: classifier.clone(),
                throttle: self.throttle.clone(),
                selector: CandidateSelector::new(self.config.selector_config()),
                crop: self.config.crop.clone(),
                capture_dir: self.config.capture_dir(),
                jpeg_quality: self.config.jpeg_quality,
            }),
            _ => None,
        };

        let context = AnalysisContext {
            state: self.state.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
            events: self.events_tx.clone(),
            clock: self.clock,
            bitmap_max_dimension: self.config.analysis_bitmap_max_dimension,
            detector_timeout: self.config.detector_timeout(),
            lifecycle: self.lifecycle.clone(),
            live,
        };

        let spawned = FrameAnalyzer::spawn(context, self.detector.clone()).map_err(|e| {
            error!("❌ failed to start analysis worker: {}", e);
            DetectorError::Initialization(e.to_string())
        })?;
        *analyzer = Some(spawned);
        self.lifecycle.set_ready(true);

        info!("🚀 capture pipeline started ({} detector)", self.detector_name);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.analyzer).is_some()
    }

    /// Running with a ready detector; capture is disabled otherwise.
    ///
    /// Never waits on the detector, even while a slow call is running.
    pub fn is_ready(&self) -> bool {
        self.lifecycle.is_ready()
    }

    /// Hand a camera frame to the analyzer. The frame is released either way.
    pub fn submit_frame(&self, frame: CameraFrame) -> bool {
        match lock(&self.analyzer).as_ref() {
            Some(analyzer) => analyzer.submit(frame),
            None => {
                self.stats.record_submitted();
                self.stats.record_dropped();
                false
            }
        }
    }

    pub fn submit_raw_frame(&self, raw: &RawFrame) -> Result<bool, FrameError> {
        let frame = raw.to_rgba()?;
        Ok(self.submit_frame(frame))
    }

    pub fn state(&self) -> Arc<PipelineState> {
        self.state.load()
    }

    pub fn snapshot(&self) -> Arc<DetectionSnapshot> {
        self.state.load().snapshot.clone()
    }

    pub fn analysis_results(&self) -> Vec<AnalysisResult> {
        AnalysisResult::from_snapshot(&self.snapshot(), &self.selector)
    }

    /// Draw commands for the latest snapshot in a `view_width` x `view_height` view.
    pub fn overlay(&self, view_width: f32, view_height: f32) -> Vec<DrawCommand> {
        let snapshot = self.snapshot();
        let results = AnalysisResult::from_snapshot(&snapshot, &self.selector);
        render(
            &results,
            snapshot.frame_width,
            snapshot.frame_height,
            view_width,
            view_height,
            &self.config.overlay,
        )
    }

    /// Export the most prominent object.
    ///
    /// `full_resolution` is a sensor-orientation bitmap of the current scene;
    /// without it the bitmap retained from the last analyzed frame is used.
    pub fn capture(&self, full_resolution: Option<RgbaImage>) -> Result<CaptureOutcome, CaptureError> {
        if !self.is_ready() {
            return Err(CaptureError::NotReady("detector not ready"));
        }

        let state = self.state.load();
        if !state.snapshot.has_frame_geometry() {
            return Err(CaptureError::NotReady("frame dimensions unknown"));
        }

        let now_ms = self.clock.now_ms();
        let candidate = self
            .selector
            .select(&state.snapshot, state.last_detection_ms, now_ms)
            .map_err(|e| {
                info!("🙈 capture refused: {:?}", e.reason);
                e
            })?;

        let source: Arc<RgbaImage> = match full_resolution {
            Some(image) => Arc::new(image),
            None => state
                .capture_bitmap
                .clone()
                .ok_or_else(|| CaptureError::NoImage("no retained frame".to_string()))?,
        };

        export_candidate(
            &source,
            &state.snapshot,
            candidate,
            &self.extractor,
            &self.config.capture_dir(),
            self.config.jpeg_quality,
        )
    }

    /// Classify a captured image in the background; the answer arrives as
    /// a [`PipelineEvent`].
    pub fn submit_for_classification(
        &self,
        outcome: &CaptureOutcome,
        classifier: Arc<dyn Classifier>,
    ) -> std::io::Result<()> {
        let outcome = outcome.clone();
        let events = self.events_tx.clone();
        thread::Builder::new()
            .name("waste-capture-classify".to_string())
            .spawn(move || classify_and_report(classifier.as_ref(), &outcome, &events))?;
        Ok(())
    }

    /// Receiver for pipeline events. Clones share one queue.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn stats(&self) -> AnalyzerStats {
        self.stats.snapshot()
    }

    /// 手动重置：无视阈值，清空检测状态和叠加层
    pub fn reset(&self) {
        lock(&self.tracker).reset();
        let now_ms = self.clock.now_ms();
        self.state.update(|current| PipelineState {
            snapshot: Arc::new(current.snapshot.cleared(now_ms)),
            capture_bitmap: None,
            last_detection_ms: None,
        });
        emit(&self.events_tx, PipelineEvent::OverlayCleared);
        info!("🔄 capture pipeline reset");
    }

    /// Stop the analyzer and the detector, and drop retained bitmaps. Idempotent.
    ///
    /// A detector call still running past its timeout is not waited for; the
    /// detector thread stops the backend once that call returns.
    pub fn stop(&self) {
        self.lifecycle.set_ready(false);
        let analyzer = lock(&self.analyzer).take();
        let was_running = analyzer.is_some();
        if let Some(mut analyzer) = analyzer {
            analyzer.shutdown();
        }

        match self.detector.try_lock() {
            Ok(mut detector) => detector.stop(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().stop(),
            Err(TryLockError::WouldBlock) => {
                info!("⏳ {} detector busy, it stops after the running call", self.detector_name)
            }
        }
        self.state.update(PipelineState::without_bitmap);

        if was_running {
            info!("⏹️ capture pipeline stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
