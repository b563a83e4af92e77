//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `capture` - Capture sources (optical scan, manual entry) and their selection
//! - `session_publisher` - Live-session slot as a scoped resource
//! - `catalog_resolver` - Exact-code product lookup
//! - `pipeline` - Orchestrator tying capture, publish and lookup together

pub mod capture;
pub mod catalog_resolver;
pub mod pipeline;
pub mod session_publisher;

pub use capture::{resolve_capture_source, Capture, CaptureRequest, CaptureSource};
pub use catalog_resolver::CatalogResolver;
pub use pipeline::{Pipeline, RunOutcome};
pub use session_publisher::SessionPublisher;
