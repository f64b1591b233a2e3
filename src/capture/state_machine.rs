use serde::{Deserialize, Serialize};

/// 检测新鲜度状态
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionState {
    /// Nothing on screen.
    Empty,
    /// The latest analyzed frame had objects.
    Fresh { last_detection_ms: u64 },
    /// Objects vanished recently; the last result is kept to avoid flicker.
    Holding {
        last_detection_ms: u64,
        empty_frames: u32,
    },
}

impl DetectionState {
    pub fn new() -> Self {
        DetectionState::Empty
    }

    pub fn transition(
        &self,
        object_count: usize,
        now_ms: u64,
        config: &TrackerConfig,
    ) -> (DetectionState, TrackerAction) {
        if object_count > 0 {
            return (
                DetectionState::Fresh {
                    last_detection_ms: now_ms,
                },
                TrackerAction::Refresh,
            );
        }

        match self {
            DetectionState::Empty => (DetectionState::Empty, TrackerAction::Idle),

            DetectionState::Fresh { last_detection_ms } => {
                Self::hold_or_reset(*last_detection_ms, 1, now_ms, config)
            }

            DetectionState::Holding {
                last_detection_ms,
                empty_frames,
            } => Self::hold_or_reset(
                *last_detection_ms,
                empty_frames.saturating_add(1),
                now_ms,
                config,
            ),
        }
    }

    fn hold_or_reset(
        last_detection_ms: u64,
        empty_frames: u32,
        now_ms: u64,
        config: &TrackerConfig,
    ) -> (DetectionState, TrackerAction) {
        let elapsed = now_ms.saturating_sub(last_detection_ms);
        if elapsed > config.stale_after_ms && empty_frames > config.min_empty_frames {
            (DetectionState::Empty, TrackerAction::AutoReset)
        } else {
            (
                DetectionState::Holding {
                    last_detection_ms,
                    empty_frames,
                },
                TrackerAction::Hold,
            )
        }
    }
}

impl Default for DetectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerAction {
    /// New objects: publish them.
    Refresh,
    /// Empty frame tolerated: keep what is shown.
    Hold,
    /// Stale for long enough: clear the snapshot and the overlay.
    AutoReset,
    /// Nothing shown and nothing detected.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub stale_after_ms: u64,
    pub min_empty_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 5000,
            min_empty_frames: 50,
        }
    }
}

/// Detection State Tracker
pub struct DetectionStateTracker {
    state: DetectionState,
    config: TrackerConfig,
    last_detection_ms: Option<u64>,
    frame_counter: u64,
}

impl DetectionStateTracker {
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            state: DetectionState::new(),
            config,
            last_detection_ms: None,
            frame_counter: 0,
        }
    }

    pub fn observe(&mut self, object_count: usize, now_ms: u64) -> TrackerAction {
        self.frame_counter += 1;

        let (new_state, action) = self.state.transition(object_count, now_ms, &self.config);
        if action == TrackerAction::Refresh {
            self.last_detection_ms = Some(now_ms);
        }
        self.state = new_state;

        action
    }

    pub fn current_state(&self) -> &DetectionState {
        &self.state
    }

    pub fn last_detection_ms(&self) -> Option<u64> {
        self.last_detection_ms
    }

    pub fn frames_since_last_detection(&self) -> u32 {
        match self.state {
            DetectionState::Holding { empty_frames, .. } => empty_frames,
            _ => 0,
        }
    }

    /// True when nothing was detected within `stale_after_ms` of `now_ms`.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        is_stale(self.last_detection_ms, now_ms, self.config.stale_after_ms)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    /// Manual reset, regardless of thresholds.
    pub fn reset(&mut self) {
        self.state = DetectionState::new();
        self.last_detection_ms = None;
        self.frame_counter = 0;
    }
}

impl Default for DetectionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_stale(last_detection_ms: Option<u64>, now_ms: u64, stale_after_ms: u64) -> bool {
    match last_detection_ms {
        Some(last) => now_ms.saturating_sub(last) > stale_after_ms,
        None => true,
    }
}
