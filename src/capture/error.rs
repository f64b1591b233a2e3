use thiserror::Error;

use super::detector::DetectorError;
use super::export::ExportError;
use super::selector::NoCandidateError;

/// 抓拍操作的用户可见错误
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pipeline not ready: {0}")]
    NotReady(&'static str),
    #[error(transparent)]
    NoCandidate(#[from] NoCandidateError),
    #[error("no exportable image: {0}")]
    NoImage(String),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl CaptureError {
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::NotReady(_) => "Camera is still starting up. Please try again in a moment.".to_string(),
            CaptureError::NoCandidate(e) => e.user_message().to_string(),
            CaptureError::NoImage(_) | CaptureError::Export(_) => {
                "Could not save the photo. Please try again.".to_string()
            }
            CaptureError::Detector(_) => "Object detection is unavailable on this device.".to_string(),
        }
    }

    /// Stable identifier for the FRB boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::NotReady(_) => "NotReady",
            CaptureError::NoCandidate(_) => "NoCandidate",
            CaptureError::NoImage(_) => "NoImage",
            CaptureError::Export(_) => "Export",
            CaptureError::Detector(_) => "Detector",
        }
    }
}
