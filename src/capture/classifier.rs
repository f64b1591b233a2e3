//! 下游分类器接口 + 节流

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classification failed: {0}")]
    Failed(String),
}

/// Structured answer from the external classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub item_name: String,
    pub category: String,
    pub confidence: f32,
}

/// External collaborator that turns a cropped image into a classification.
///
/// Implementations may take arbitrarily long or fail; callers never run
/// them on the analysis worker.
pub trait Classifier: Send + Sync {
    fn classify(&self, image_path: &Path, fallback_label: &str)
        -> Result<Classification, ClassifierError>;
}

/// Classifier that echoes the detector label; used when no remote service is wired.
pub struct LabelEchoClassifier;

impl Classifier for LabelEchoClassifier {
    fn classify(
        &self,
        image_path: &Path,
        fallback_label: &str,
    ) -> Result<Classification, ClassifierError> {
        if !image_path.exists() {
            return Err(ClassifierError::Failed(format!(
                "image not found: {}",
                image_path.display()
            )));
        }
        Ok(Classification {
            item_name: fallback_label.to_string(),
            category: "unknown".to_string(),
            confidence: 0.0,
        })
    }
}

/// 实时分类节流：最小间隔 + 同时最多一个请求
pub struct ClassificationThrottle {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
    in_flight: Arc<AtomicBool>,
}

impl ClassificationThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `job` on a background thread if the throttle allows it.
    ///
    /// Returns `false` without blocking when a call is still running or the
    /// interval since the previous dispatch has not elapsed.
    pub fn try_dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut last = match self.last_dispatch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(at) = *last {
            if at.elapsed() < self.min_interval {
                return false;
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("⏳ classification still in flight, skipping");
            return false;
        }

        *last = Some(Instant::now());
        drop(last);

        let in_flight = self.in_flight.clone();
        let spawned = thread::Builder::new()
            .name("waste-classify".to_string())
            .spawn(move || {
                let _guard = InFlightGuard(in_flight);
                job();
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                warn!("⚠️ failed to spawn classification thread: {}", e);
                self.in_flight.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

/// Clears the in-flight flag even if the job panics.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_idle(throttle: &ClassificationThrottle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while throttle.is_in_flight() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_interval_enforced() {
        let throttle = ClassificationThrottle::new(Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        assert!(throttle.try_dispatch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        wait_idle(&throttle);

        let counter = runs.clone();
        assert!(!throttle.try_dispatch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_flight_blocks_next_dispatch() {
        let throttle = ClassificationThrottle::new(Duration::ZERO);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        assert!(throttle.try_dispatch(move || {
            let _ = release_rx.recv();
        }));
        assert!(throttle.is_in_flight());
        assert!(!throttle.try_dispatch(|| {}));

        release_tx.send(()).unwrap();
        wait_idle(&throttle);
        assert!(throttle.try_dispatch(|| {}));
    }

    #[test]
    fn test_echo_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crop.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let result = LabelEchoClassifier.classify(&path, "bottle").unwrap();
        assert_eq!(result.item_name, "bottle");
        assert!(LabelEchoClassifier
            .classify(&dir.path().join("missing.jpg"), "bottle")
            .is_err());
    }
}
