use std::time::Duration;
use thiserror::Error;

use crate::AlertLevel;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Job store error: {0}")]
    Storage(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    /// Severity used when the error is forwarded to operators.
    pub fn alert_level(&self) -> AlertLevel {
        match self {
            CaptureError::InvalidUrl(_) => AlertLevel::Info,
            CaptureError::Storage(_) | CaptureError::Configuration(_) => AlertLevel::Critical,
            _ => AlertLevel::Error,
        }
    }
}

impl From<sqlx::Error> for CaptureError {
    fn from(err: sqlx::Error) -> Self {
        CaptureError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::Delivery(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::Browser(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Render(err.to_string())
    }
}
