use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crop::CropConfig;
use super::detector::DetectorKind;
use super::overlay::OverlayCalibration;
use super::selector::SelectorConfig;
use super::state_machine::TrackerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 抓拍管线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorKind,
    pub tracker: TrackerConfig,
    pub selector: SelectorConfig,
    pub crop: CropConfig,
    pub overlay: OverlayCalibration,
    /// Largest side of the bitmap retained per analyzed frame.
    pub analysis_bitmap_max_dimension: u32,
    pub detector_timeout_ms: u64,
    pub classify_interval_ms: u64,
    /// Turn on background classification of the best candidate while scanning.
    pub live_classification: bool,
    pub jpeg_quality: u8,
    /// `None` uses the OS temp dir.
    pub capture_dir: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::default(),
            tracker: TrackerConfig::default(),
            selector: SelectorConfig::default(),
            crop: CropConfig::default(),
            overlay: OverlayCalibration::default(),
            analysis_bitmap_max_dimension: 1280,
            detector_timeout_ms: 1500,
            classify_interval_ms: 2000,
            live_classification: false,
            jpeg_quality: 85,
            capture_dir: None,
            event_capacity: 32,
        }
    }
}

impl PipelineConfig {
    /// 低内存设备
    pub fn for_low_memory() -> Self {
        Self {
            crop: CropConfig {
                max_source_dimension: 1280,
                ..CropConfig::default()
            },
            analysis_bitmap_max_dimension: 720,
            jpeg_quality: 75,
            event_capacity: 8,
            ..Self::default()
        }
    }

    /// 高端设备
    pub fn for_high_end() -> Self {
        Self {
            crop: CropConfig {
                max_source_dimension: 4096,
                ..CropConfig::default()
            },
            analysis_bitmap_max_dimension: 1920,
            detector_timeout_ms: 1000,
            classify_interval_ms: 1500,
            jpeg_quality: 92,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.selector;
        if !(s.display_threshold_pct >= 0.0 && s.display_threshold_pct <= s.capture_threshold_pct) {
            return Err(ConfigError::Invalid(format!(
                "display threshold {} must be within [0, capture threshold {}]",
                s.display_threshold_pct, s.capture_threshold_pct
            )));
        }
        if !(0.0..=1.0).contains(&self.crop.padding_fraction) {
            return Err(ConfigError::Invalid(format!(
                "padding fraction {} must be within [0, 1]",
                self.crop.padding_fraction
            )));
        }
        if self.analysis_bitmap_max_dimension == 0 || self.crop.max_source_dimension == 0 {
            return Err(ConfigError::Invalid("bitmap ceilings must be non-zero".to_string()));
        }
        if self.detector_timeout_ms == 0 {
            return Err(ConfigError::Invalid("detector timeout must be non-zero".to_string()));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg quality {} must be within [1, 100]",
                self.jpeg_quality
            )));
        }
        if self.overlay.vertical_expansion <= 0.0 {
            return Err(ConfigError::Invalid("vertical expansion must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Selector settings with staleness taken from the tracker, so the
    /// "nothing detected lately" refusal and auto-reset share one window.
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            stale_after_ms: self.tracker.stale_after_ms,
            ..self.selector.clone()
        }
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn classify_interval(&self) -> Duration {
        Duration::from_millis(self.classify_interval_ms)
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.capture_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
