//! 帧分析 worker
//!
//! One dedicated thread analyzes frames one at a time. The submit side
//! keeps only the latest frame: a frame still waiting when a newer one
//! arrives is dropped (and so released) without reaching the detector.
//! Detector calls run on their own thread so a slow backend is bounded by
//! the configured timeout and reported as an empty result.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use image::RgbaImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::classifier::{Classification, ClassificationThrottle, Classifier};
use super::crop::{CropConfig, CropExtractor};
use super::detector::{DetectedObject, DetectorError, ObjectDetector};
use super::frame::CameraFrame;
use super::geometry::Rotation;
use super::pipeline::{classify_and_report, export_candidate};
use super::selector::CandidateSelector;
use super::snapshot::{DetectionSnapshot, PipelineState, StateCell};
use super::state_machine::{DetectionStateTracker, TrackerAction};

pub type SharedDetector = Arc<Mutex<Box<dyn ObjectDetector>>>;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Readiness of the detector, readable without its lock.
///
/// Each `start` opens a new run. A detector thread stops the backend on exit
/// only if its run is still the current one and the pipeline is stopped, so
/// a late exit never tears down a detector that was started again.
#[derive(Debug, Default)]
pub struct DetectorLifecycle {
    ready: AtomicBool,
    run: AtomicU64,
}

impl DetectorLifecycle {
    pub fn begin_run(&self) -> u64 {
        self.run.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_run(&self) -> u64 {
        self.run.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStats {
    pub frames_submitted: u64,
    pub frames_analyzed: u64,
    pub frames_dropped: u64,
    pub detector_timeouts: u64,
    pub auto_resets: u64,
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    submitted: AtomicU64,
    analyzed: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    auto_resets: AtomicU64,
}

impl StatsCounters {
    pub fn snapshot(&self) -> AnalyzerStats {
        AnalyzerStats {
            frames_submitted: self.submitted.load(Ordering::Relaxed),
            frames_analyzed: self.analyzed.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            detector_timeouts: self.timeouts.load(Ordering::Relaxed),
            auto_resets: self.auto_resets.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    SnapshotPublished {
        frame_number: u64,
        object_count: usize,
    },
    OverlayCleared,
    Classified {
        tracking_id: Option<u32>,
        classification: Classification,
    },
    ClassificationFailed {
        message: String,
    },
}

/// Non-blocking send; events are dropped when the consumer lags.
pub(crate) fn emit(events: &Sender<PipelineEvent>, event: PipelineEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        debug!("📭 event queue full, dropping {:?}", event);
    }
}

/// Milliseconds since the pipeline was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Background classification of the best candidate while scanning.
pub(crate) struct LiveClassification {
    pub classifier: Arc<dyn Classifier>,
    pub throttle: Arc<ClassificationThrottle>,
    pub selector: CandidateSelector,
    pub crop: CropConfig,
    pub capture_dir: PathBuf,
    pub jpeg_quality: u8,
}

/// Everything the analysis worker shares with the pipeline.
pub(crate) struct AnalysisContext {
    pub state: Arc<StateCell>,
    pub tracker: Arc<Mutex<DetectionStateTracker>>,
    pub stats: Arc<StatsCounters>,
    pub events: Sender<PipelineEvent>,
    pub clock: MonotonicClock,
    pub bitmap_max_dimension: u32,
    pub detector_timeout: Duration,
    pub lifecycle: Arc<DetectorLifecycle>,
    pub live: Option<LiveClassification>,
}

type DetectReply = Result<Vec<DetectedObject>, DetectorError>;

struct DetectJob {
    frame: Arc<CameraFrame>,
    rotation: Rotation,
    reply: Sender<DetectReply>,
}

pub struct FrameAnalyzer {
    frame_tx: Option<Sender<CameraFrame>>,
    pending: Receiver<CameraFrame>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<StatsCounters>,
}

impl FrameAnalyzer {
    pub(crate) fn spawn(context: AnalysisContext, detector: SharedDetector) -> io::Result<Self> {
        let (frame_tx, frame_rx) = bounded::<CameraFrame>(1);
        // rendezvous: the detector thread accepts a job only when idle
        let (job_tx, job_rx) = bounded::<DetectJob>(0);

        let lifecycle = context.lifecycle.clone();
        let run = lifecycle.current_run();
        thread::Builder::new()
            .name("waste-detector".to_string())
            .spawn(move || run_detector(detector, job_rx, lifecycle, run))?;

        let stats = context.stats.clone();
        let pending = frame_rx.clone();
        let worker = thread::Builder::new()
            .name("waste-analyzer".to_string())
            .spawn(move || {
                for frame in frame_rx.iter() {
                    context.analyze(frame, &job_tx);
                }
                debug!("🛑 analysis worker exiting");
            })?;

        info!("▶️ frame analyzer started");
        Ok(Self {
            frame_tx: Some(frame_tx),
            pending,
            worker: Some(worker),
            stats,
        })
    }

    /// Queue `frame`, replacing any frame still waiting. Returns `false`
    /// when the analyzer is shut down (the frame is released).
    pub fn submit(&self, frame: CameraFrame) -> bool {
        self.stats.record_submitted();

        let Some(tx) = &self.frame_tx else {
            self.stats.record_dropped();
            return false;
        };

        let mut frame = frame;
        loop {
            match tx.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(stale) = self.pending.try_recv() {
                        debug!("⏭️ dropping superseded frame #{}", stale.frame_number);
                        self.stats.record_dropped();
                        drop(stale);
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(rejected)) => {
                    self.stats.record_dropped();
                    drop(rejected);
                    return false;
                }
            }
        }
    }

    /// Stop accepting frames, discard the waiting one and join the worker.
    ///
    /// The detector thread is not joined; a backend call past its timeout
    /// may still be running. The thread stops the backend once it returns.
    pub fn shutdown(&mut self) {
        if self.frame_tx.take().is_none() {
            return;
        }
        while let Ok(frame) = self.pending.try_recv() {
            self.stats.record_dropped();
            drop(frame);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("⚠️ analysis worker panicked");
            }
        }
        info!("⏹️ frame analyzer stopped");
    }
}

impl Drop for FrameAnalyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_detector(
    detector: SharedDetector,
    jobs: Receiver<DetectJob>,
    lifecycle: Arc<DetectorLifecycle>,
    run: u64,
) {
    for job in jobs.iter() {
        let result = lock(&detector).detect_objects(&job.frame, job.rotation);
        drop(job.frame);
        // the analyzer may have given up waiting
        let _ = job.reply.send(result);
    }

    let mut detector = lock(&detector);
    if lifecycle.current_run() == run && !lifecycle.is_ready() {
        detector.stop();
    }
    debug!("🛑 detector thread exiting");
}

impl AnalysisContext {
    fn analyze(&self, frame: CameraFrame, jobs: &Sender<DetectJob>) {
        let (frame_width, frame_height) = frame.corrected_dims();
        let rotation = frame.rotation;
        let frame_number = frame.frame_number;

        let bitmap = frame
            .to_capture_bitmap(self.bitmap_max_dimension)
            .map(Arc::new);

        let frame = Arc::new(frame);
        let objects = self.detect(jobs, frame.clone(), rotation);
        let now_ms = self.clock.now_ms();

        let snapshot = DetectionSnapshot {
            objects,
            frame_width,
            frame_height,
            rotation,
            captured_at_ms: now_ms,
            frame_number,
        };

        let (action, last_detection_ms) = {
            let mut tracker = lock(&self.tracker);
            let action = tracker.observe(snapshot.objects.len(), now_ms);
            (action, tracker.last_detection_ms())
        };

        match action {
            TrackerAction::Refresh => {
                let snapshot = Arc::new(snapshot);
                debug!(
                    "📦 frame #{}: {} object(s) in {}x{}",
                    frame_number,
                    snapshot.objects.len(),
                    frame_width,
                    frame_height
                );
                self.state.store(PipelineState {
                    snapshot: snapshot.clone(),
                    capture_bitmap: bitmap.clone(),
                    last_detection_ms,
                });
                emit(
                    &self.events,
                    PipelineEvent::SnapshotPublished {
                        frame_number,
                        object_count: snapshot.objects.len(),
                    },
                );
                if let Some(bitmap) = bitmap {
                    self.classify_live(&snapshot, bitmap, now_ms);
                }
            }
            TrackerAction::Hold => {
                // keep the last objects and their bitmap on screen
            }
            TrackerAction::AutoReset => {
                self.stats.auto_resets.fetch_add(1, Ordering::Relaxed);
                info!("🧹 no detections for a while, clearing overlay");
                self.state.store(PipelineState {
                    snapshot: Arc::new(snapshot),
                    capture_bitmap: None,
                    last_detection_ms,
                });
                emit(&self.events, PipelineEvent::OverlayCleared);
            }
            TrackerAction::Idle => {
                self.state.store(PipelineState {
                    snapshot: Arc::new(snapshot),
                    capture_bitmap: None,
                    last_detection_ms,
                });
            }
        }

        self.stats.analyzed.fetch_add(1, Ordering::Relaxed);
        // last owner unless the detector thread still holds a timed-out frame
        drop(frame);
    }

    fn detect(
        &self,
        jobs: &Sender<DetectJob>,
        frame: Arc<CameraFrame>,
        rotation: Rotation,
    ) -> Vec<DetectedObject> {
        // one budget covers waiting for the detector thread and the call itself
        let deadline = Instant::now() + self.detector_timeout;
        let (reply_tx, reply_rx) = bounded::<DetectReply>(1);
        let job = DetectJob {
            frame,
            rotation,
            reply: reply_tx,
        };

        match jobs.send_deadline(job, deadline) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("⏱️ detector still busy, skipping frame");
                return Vec::new();
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                warn!("⚠️ detector thread is gone");
                return Vec::new();
            }
        }

        match reply_rx.recv_deadline(deadline) {
            Ok(Ok(objects)) => objects,
            Ok(Err(e)) => {
                warn!("⚠️ detection failed: {}", e);
                Vec::new()
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "⏱️ detector exceeded {}ms, treating as empty",
                    self.detector_timeout.as_millis()
                );
                Vec::new()
            }
            Err(RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    fn classify_live(&self, snapshot: &Arc<DetectionSnapshot>, bitmap: Arc<RgbaImage>, now_ms: u64) {
        let Some(live) = &self.live else {
            return;
        };
        if live.throttle.is_in_flight() {
            return;
        }
        let Ok(candidate) = live.selector.select(snapshot, Some(now_ms), now_ms) else {
            return;
        };

        let frame_number = snapshot.frame_number;
        let snapshot = snapshot.clone();
        let classifier = live.classifier.clone();
        let events = self.events.clone();
        let extractor = CropExtractor::new(live.crop.clone());
        let capture_dir = live.capture_dir.clone();
        let quality = live.jpeg_quality;

        let dispatched = live.throttle.try_dispatch(move || {
            match export_candidate(&bitmap, &snapshot, candidate, &extractor, &capture_dir, quality) {
                Ok(outcome) => classify_and_report(classifier.as_ref(), &outcome, &events),
                Err(e) => emit(
                    &events,
                    PipelineEvent::ClassificationFailed {
                        message: e.to_string(),
                    },
                ),
            }
        });
        if dispatched {
            debug!("🔎 live classification dispatched for frame #{}", frame_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::detector::MockDetector;
    use crate::capture::geometry::RectF;
    use std::sync::atomic::AtomicUsize;

    fn create_test_frame(frame_number: u64, released: &Arc<AtomicUsize>) -> CameraFrame {
        let counter = released.clone();
        CameraFrame::new(64, 48, Rotation::Deg90, vec![90u8; 64 * 48 * 4], 0, frame_number)
            .unwrap()
            .with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn context(timeout: Duration) -> (AnalysisContext, Receiver<PipelineEvent>) {
        let (events_tx, events_rx) = bounded(64);
        let context = AnalysisContext {
            state: Arc::new(StateCell::new()),
            tracker: Arc::new(Mutex::new(DetectionStateTracker::new())),
            stats: Arc::new(StatsCounters::default()),
            events: events_tx,
            clock: MonotonicClock::new(),
            bitmap_max_dimension: 1280,
            detector_timeout: timeout,
            lifecycle: Arc::new(DetectorLifecycle::default()),
            live: None,
        };
        (context, events_rx)
    }

    /// Counts frames that have been created but not yet released.
    #[derive(Default)]
    struct FrameLedger {
        live: AtomicUsize,
        max_live: AtomicUsize,
        released: AtomicUsize,
    }

    fn tracked_frame(frame_number: u64, ledger: &Arc<FrameLedger>) -> CameraFrame {
        let live = ledger.live.fetch_add(1, Ordering::SeqCst) + 1;
        ledger.max_live.fetch_max(live, Ordering::SeqCst);
        let ledger = ledger.clone();
        CameraFrame::new(64, 48, Rotation::Deg90, vec![90u8; 64 * 48 * 4], 0, frame_number)
            .unwrap()
            .with_release(move || {
                ledger.live.fetch_sub(1, Ordering::SeqCst);
                ledger.released.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn shared(mut detector: MockDetector) -> SharedDetector {
        detector.initialize().unwrap();
        let boxed: Box<dyn ObjectDetector> = Box::new(detector);
        Arc::new(Mutex::new(boxed))
    }

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_keep_only_latest_backpressure() {
        let detector = MockDetector::with_fixed_object(RectF::new(5.0, 5.0, 30.0, 30.0), "bottle")
            .with_latency(Duration::from_millis(30));
        let calls = detector.calls();
        let (context, _events) = context(Duration::from_secs(2));
        let stats = context.stats.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(detector)).unwrap();

        let ledger = Arc::new(FrameLedger::default());
        for n in 0..20 {
            assert!(analyzer.submit(tracked_frame(n, &ledger)));
        }
        assert!(wait_until(|| {
            let s = stats.snapshot();
            s.frames_analyzed + s.frames_dropped == 20
        }));

        let s = stats.snapshot();
        assert_eq!(s.frames_submitted, 20);
        assert!(s.frames_dropped > 0);
        // dropped frames never reach the detector
        assert_eq!(calls.load(Ordering::SeqCst) as u64, s.frames_analyzed);
        // at most one frame under analysis and one waiting, plus the one being created
        assert!(ledger.max_live.load(Ordering::SeqCst) <= 3);

        analyzer.shutdown();
        assert!(wait_until(|| ledger.released.load(Ordering::SeqCst) == 20));
        assert_eq!(ledger.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slow_detector_bounded_by_one_timeout() {
        let detector = MockDetector::with_fixed_object(RectF::new(5.0, 5.0, 30.0, 30.0), "can")
            .with_latency(Duration::from_millis(500));
        let (context, _events) = context(Duration::from_millis(300));
        let stats = context.stats.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(detector)).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        analyzer.submit(create_test_frame(1, &released));
        assert!(wait_until(|| stats.snapshot().frames_analyzed == 1));

        // the first call is still running: waiting for it and the next call share one budget
        let started = Instant::now();
        analyzer.submit(create_test_frame(2, &released));
        assert!(wait_until(|| stats.snapshot().frames_analyzed == 2));
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);
        assert_eq!(stats.snapshot().detector_timeouts, 2);

        analyzer.shutdown();
        assert!(wait_until(|| released.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_detector_stopped_after_shutdown() {
        let detector = shared(MockDetector::with_fixed_object(
            RectF::new(5.0, 5.0, 30.0, 30.0),
            "can",
        ));
        let (context, _events) = context(Duration::from_secs(1));
        let mut analyzer = FrameAnalyzer::spawn(context, detector.clone()).unwrap();
        assert!(lock(&detector).is_ready());

        analyzer.shutdown();
        assert!(wait_until(|| !lock(&detector).is_ready()));
    }

    #[test]
    fn test_restarted_run_keeps_detector() {
        let detector = shared(MockDetector::new());
        let (context, _events) = context(Duration::from_secs(1));
        let lifecycle = context.lifecycle.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, detector.clone()).unwrap();

        // a newer run started before the old detector thread exits
        lifecycle.begin_run();
        lifecycle.set_ready(true);
        analyzer.shutdown();

        thread::sleep(Duration::from_millis(100));
        assert!(lock(&detector).is_ready());
    }

    #[test]
    fn test_snapshot_published_in_corrected_dims() {
        let detector = MockDetector::with_fixed_object(RectF::new(5.0, 5.0, 30.0, 30.0), "can");
        let (context, events) = context(Duration::from_secs(2));
        let state = context.state.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(detector)).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        analyzer.submit(create_test_frame(7, &released));

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            PipelineEvent::SnapshotPublished {
                frame_number: 7,
                object_count: 1
            }
        );
        let current = state.load();
        assert_eq!((current.snapshot.frame_width, current.snapshot.frame_height), (48, 64));
        // retained bitmap stays in sensor orientation
        assert_eq!(
            current.capture_bitmap.as_ref().map(|b| b.dimensions()),
            Some((64, 48))
        );
        assert!(current.last_detection_ms.is_some());

        analyzer.shutdown();
        assert!(wait_until(|| released.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_detector_timeout_is_empty_result() {
        let detector = MockDetector::with_fixed_object(RectF::new(5.0, 5.0, 30.0, 30.0), "can")
            .with_latency(Duration::from_millis(300));
        let (context, _events) = context(Duration::from_millis(30));
        let stats = context.stats.clone();
        let state = context.state.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(detector)).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        analyzer.submit(create_test_frame(1, &released));
        assert!(wait_until(|| stats.snapshot().frames_analyzed == 1));

        assert_eq!(stats.snapshot().detector_timeouts, 1);
        assert!(state.load().snapshot.is_empty());

        analyzer.shutdown();
        // the detector thread drops its copy once the slow call returns
        assert!(wait_until(|| released.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_auto_reset_clears_snapshot() {
        let detector = MockDetector::with_script(|n| {
            if n == 0 {
                vec![DetectedObject::new(RectF::new(0.0, 0.0, 20.0, 20.0), Some(1), vec![])]
            } else {
                vec![]
            }
        })
        .with_latency(Duration::from_millis(5));
        let (mut context, events) = context(Duration::from_secs(2));
        context.tracker = Arc::new(Mutex::new(DetectionStateTracker::with_config(
            crate::capture::state_machine::TrackerConfig {
                stale_after_ms: 0,
                min_empty_frames: 2,
            },
        )));
        let stats = context.stats.clone();
        let state = context.state.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(detector)).unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        for n in 0..4u64 {
            analyzer.submit(create_test_frame(n, &released));
            assert!(wait_until(|| stats.snapshot().frames_analyzed == n + 1));
        }

        assert_eq!(stats.snapshot().auto_resets, 1);
        let current = state.load();
        assert!(current.snapshot.is_empty());
        assert!(current.capture_bitmap.is_none());
        assert!(events.try_iter().any(|e| e == PipelineEvent::OverlayCleared));

        analyzer.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_releases_frame() {
        let (context, _events) = context(Duration::from_secs(1));
        let stats = context.stats.clone();
        let mut analyzer = FrameAnalyzer::spawn(context, shared(MockDetector::new())).unwrap();
        analyzer.shutdown();

        let released = Arc::new(AtomicUsize::new(0));
        assert!(!analyzer.submit(create_test_frame(0, &released)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }
}
