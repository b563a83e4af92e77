//! Domain models - core types and error taxonomy
//!
//! This module contains the canonical data types used throughout the system:
//! - `ScanEvent` - a captured identifier with its capture time
//! - `SessionSlot` - the shared live-session record
//! - `CatalogRecord` - a product as stored in the catalog
//! - `PipelineState` - the observable state of the orchestrator
//! - `error` - capture, publish and lookup failures

pub mod error;
pub mod types;

pub use error::{CaptureError, LookupError, PipelineError, PublishError};
pub use types::{
    CaptureOrigin, CatalogRecord, LookupOutcome, PipelinePhase, PipelineState, ScanEvent,
    SessionSlot, Settlement, Symbology,
};
