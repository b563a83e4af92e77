//! Error taxonomy for the scan pipeline
//!
//! `Display` output of capture and lookup errors is what the operator sees.

use thiserror::Error;

/// Capture failed before a code was produced. Terminal for the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("permission denied")]
    PermissionDenied,
    /// The capability ran but returned zero codes
    #[error("no barcode found")]
    NoCodeFound,
    /// Manual entry was empty after trimming
    #[error("invalid code")]
    InvalidInput,
    /// The capability raised; the detail is logged, not shown
    #[error("scan error")]
    ScanFailure(String),
    /// Optical scan requested on an environment without the capability
    #[error("optical scan unavailable")]
    Unavailable,
}

impl CaptureError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => "permission_denied",
            CaptureError::NoCodeFound => "no_code_found",
            CaptureError::InvalidInput => "invalid_input",
            CaptureError::ScanFailure(_) => "scan_failure",
            CaptureError::Unavailable => "unavailable",
        }
    }
}

/// Raised by an optical capability (process failure, timeout, decoder crash)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CapabilityError(pub String);

/// Session store write, delete or cleanup registration failed. Never blocks a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("session publish failed: {0}")]
    Store(String),
    #[error("session publish failed: disconnect cleanup not acknowledged within {0} ms")]
    ArmTimeout(u64),
}

/// Catalog query raised. A query with zero matches is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("catalog lookup failed: {0}")]
    Query(String),
    #[error("catalog lookup failed: malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

/// Request rejected by the orchestrator without starting anything
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("a scan is already in progress")]
    Busy,
}
