//! Capture sources
//!
//! A capture source turns an operator request into a `ScanEvent`. The variant
//! is picked once at startup from the configured platform and what the host
//! can do; the pipeline only sees `Arc<dyn CaptureSource>`.

use crate::domain::error::CaptureError;
use crate::domain::types::{CaptureOrigin, ScanEvent, Symbology};
use crate::infra::config::{Config, Platform};
use crate::io::scanner::{ProcessScanner, ScanCapability, ScanResults};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRequest {
    /// Optical scan with the camera
    Scan,
    /// Operator-typed text, untrimmed
    Manual(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    Captured(ScanEvent),
    /// Operator backed out; not a failure
    Cancelled,
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn request_code(&self, request: CaptureRequest) -> Result<Capture, CaptureError>;

    /// Whether `CaptureRequest::Scan` can succeed here
    fn supports_optical(&self) -> bool;
}

/// Validate manual entry: trimmed, non-empty
pub fn manual_code(text: &str) -> Result<ScanEvent, CaptureError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::InvalidInput);
    }
    Ok(ScanEvent::new(trimmed, CaptureOrigin::Manual))
}

/// Text entry only
#[derive(Debug, Default)]
pub struct ManualCapture;

#[async_trait]
impl CaptureSource for ManualCapture {
    async fn request_code(&self, request: CaptureRequest) -> Result<Capture, CaptureError> {
        match request {
            CaptureRequest::Manual(text) => manual_code(&text).map(Capture::Captured),
            CaptureRequest::Scan => Err(CaptureError::Unavailable),
        }
    }

    fn supports_optical(&self) -> bool {
        false
    }
}

/// Camera scanning through a `ScanCapability`, with manual entry alongside
pub struct OpticalCapture<S: ScanCapability> {
    capability: S,
    formats: Vec<Symbology>,
    permission_granted: AtomicBool,
}

impl<S: ScanCapability> OpticalCapture<S> {
    pub fn new(capability: S, formats: &[Symbology]) -> Self {
        let formats = if formats.is_empty() { Symbology::DEFAULT_SET.to_vec() } else { formats.to_vec() };
        Self { capability, formats, permission_granted: AtomicBool::new(false) }
    }

    pub fn formats(&self) -> &[Symbology] {
        &self.formats
    }

    /// Ask once per session; a denial is asked again on the next scan
    async fn ensure_permission(&self) -> bool {
        if self.permission_granted.load(Ordering::Acquire) {
            return true;
        }
        let granted = self.capability.request_permissions().await;
        if granted {
            self.permission_granted.store(true, Ordering::Release);
        }
        granted
    }

    async fn scan(&self) -> Result<Capture, CaptureError> {
        if !self.ensure_permission().await {
            return Err(CaptureError::PermissionDenied);
        }

        let results = self.capability.scan(&self.formats).await.map_err(|e| {
            warn!(error = %e, "optical_scan_failed");
            CaptureError::ScanFailure(e.0)
        })?;

        match results {
            ScanResults::Cancelled => Ok(Capture::Cancelled),
            ScanResults::Decoded(codes) => {
                let total = codes.len();
                let first = codes.into_iter().find(|c| !c.raw_value.trim().is_empty());
                match first {
                    Some(code) => {
                        if total > 1 {
                            debug!(count = total, "optical_scan_multiple_codes");
                        }
                        Ok(Capture::Captured(ScanEvent::new(
                            code.raw_value,
                            CaptureOrigin::Optical(code.format),
                        )))
                    }
                    None => Err(CaptureError::NoCodeFound),
                }
            }
        }
    }
}

#[async_trait]
impl<S: ScanCapability> CaptureSource for OpticalCapture<S> {
    async fn request_code(&self, request: CaptureRequest) -> Result<Capture, CaptureError> {
        match request {
            CaptureRequest::Scan => self.scan().await,
            CaptureRequest::Manual(text) => manual_code(&text).map(Capture::Captured),
        }
    }

    fn supports_optical(&self) -> bool {
        true
    }
}

/// Platform of the running host, for `platform = "auto"`
pub fn detect_platform() -> Platform {
    match std::env::consts::OS {
        "android" => Platform::Android,
        "ios" => Platform::Ios,
        _ => Platform::Desktop,
    }
}

/// Pick the capture source once at startup
pub fn resolve_capture_source(config: &Config) -> Arc<dyn CaptureSource> {
    let platform = match config.capture_platform() {
        Platform::Auto => detect_platform(),
        other => other,
    };

    if platform == Platform::Web {
        info!(platform = platform.as_str(), "capture_source_manual");
        return Arc::new(ManualCapture);
    }

    match ProcessScanner::from_config(config) {
        Some(scanner) => {
            info!(
                platform = platform.as_str(),
                command = config.scanner_command().unwrap_or_default(),
                "capture_source_optical"
            );
            Arc::new(OpticalCapture::new(scanner, config.capture_formats()))
        }
        None => {
            info!(platform = platform.as_str(), reason = "no scanner command", "capture_source_manual");
            Arc::new(ManualCapture)
        }
    }
}
