//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `scanner` - Optical scan capability backed by an external decoder process
//! - `session_store` - Shared live-session slot (MQTT retained message or in-memory)
//! - `catalog` - Read-only product catalog (HTTP, JSON file or in-memory)
//! - `notify` - Best-effort side-channel notifications

pub mod catalog;
pub mod notify;
pub mod scanner;
pub mod session_store;

pub use catalog::{CatalogStore, FileCatalog, HttpCatalog, MemoryCatalog};
pub use notify::{Notification, NotificationSink, Notifier};
pub use scanner::{DecodedBarcode, ProcessScanner, ScanCapability, ScanResults};
pub use session_store::{MemorySessionStore, MqttSessionStore, SessionStore};
