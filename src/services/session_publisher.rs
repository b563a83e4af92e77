//! Session publisher - the live-session slot as a scoped resource
//!
//! `acquire` arms the clear-on-disconnect rule before anything else can be
//! written, `release` clears and disconnects. An abnormal exit between the two
//! is covered by the armed rule on the store side.

use crate::domain::error::PublishError;
use crate::domain::types::{ScanEvent, SessionSlot};
use crate::infra::metrics::Metrics;
use crate::io::session_store::SessionStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct SessionPublisher {
    store: Arc<dyn SessionStore>,
    metrics: Arc<Metrics>,
}

impl SessionPublisher {
    /// Arm disconnect cleanup and hand out the publisher. A failed arm means
    /// there is no publisher.
    pub async fn acquire(store: Arc<dyn SessionStore>, metrics: Arc<Metrics>) -> Result<Self, PublishError> {
        store.arm_disconnect_cleanup().await?;
        info!("session_cleanup_armed");
        Ok(Self { store, metrics })
    }

    /// Overwrite the slot with the captured value and its timestamp
    pub async fn publish(&self, event: &ScanEvent) -> Result<(), PublishError> {
        let slot = SessionSlot::from(event);
        let result = self.store.write(&slot).await;
        self.metrics.record_publish(result.is_ok());
        match &result {
            Ok(()) => debug!(value = %slot.value, timestamp = %slot.timestamp, "session_published"),
            Err(e) => warn!(value = %slot.value, error = %e, "session_publish_failed"),
        }
        result
    }

    /// Empty the slot. Succeeds on an already empty slot.
    pub async fn clear(&self) -> Result<(), PublishError> {
        let result = self.store.clear().await;
        self.metrics.record_clear(result.is_ok());
        if result.is_ok() {
            debug!("session_cleared");
        }
        result
    }

    /// End the session: clear the slot, then disconnect cleanly
    pub async fn release(self) -> Result<(), PublishError> {
        if let Err(e) = self.clear().await {
            error!(error = %e, "session_release_clear_failed");
        }
        self.store.disconnect().await?;
        info!("session_released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CaptureOrigin;
    use crate::io::session_store::MemorySessionStore;
    use async_trait::async_trait;

    struct UnarmableStore;

    #[async_trait]
    impl SessionStore for UnarmableStore {
        async fn arm_disconnect_cleanup(&self) -> Result<(), PublishError> {
            Err(PublishError::ArmTimeout(50))
        }
        async fn write(&self, _slot: &SessionSlot) -> Result<(), PublishError> {
            Ok(())
        }
        async fn clear(&self) -> Result<(), PublishError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), PublishError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acquire_arms_cleanup() {
        let store = Arc::new(MemorySessionStore::new());
        assert!(!store.cleanup_armed());
        let _publisher = SessionPublisher::acquire(store.clone(), Arc::new(Metrics::new())).await.unwrap();
        assert!(store.cleanup_armed());
    }

    #[tokio::test]
    async fn test_failed_arm_yields_no_publisher() {
        let result = SessionPublisher::acquire(Arc::new(UnarmableStore), Arc::new(Metrics::new())).await;
        assert!(matches!(result, Err(PublishError::ArmTimeout(50))));
    }

    #[tokio::test]
    async fn test_publish_writes_value_and_timestamp() {
        let store = Arc::new(MemorySessionStore::new());
        let metrics = Arc::new(Metrics::new());
        let publisher = SessionPublisher::acquire(store.clone(), metrics.clone()).await.unwrap();

        let event = ScanEvent::new("123", CaptureOrigin::Manual);
        publisher.publish(&event).await.unwrap();

        let slot = store.slot().unwrap();
        assert_eq!(slot.value, "123");
        assert_eq!(slot.timestamp, event.timestamp());
        assert_eq!(metrics.publishes_total(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted() {
        let store = Arc::new(MemorySessionStore::new());
        let metrics = Arc::new(Metrics::new());
        let publisher = SessionPublisher::acquire(store.clone(), metrics.clone()).await.unwrap();

        store.set_failure(Some("broker down"));
        let err = publisher.publish(&ScanEvent::new("1", CaptureOrigin::Manual)).await.unwrap_err();
        assert_eq!(err.to_string(), "session publish failed: broker down");
        assert_eq!(metrics.publish_failures(), 1);
    }

    #[tokio::test]
    async fn test_clear_on_empty_slot_succeeds() {
        let store = Arc::new(MemorySessionStore::new());
        let publisher = SessionPublisher::acquire(store.clone(), Arc::new(Metrics::new())).await.unwrap();
        assert!(publisher.clear().await.is_ok());
        assert!(store.slot().is_none());
    }

    #[tokio::test]
    async fn test_release_clears_and_disconnects() {
        let store = Arc::new(MemorySessionStore::new());
        let publisher = SessionPublisher::acquire(store.clone(), Arc::new(Metrics::new())).await.unwrap();
        publisher.publish(&ScanEvent::new("123", CaptureOrigin::Manual)).await.unwrap();

        publisher.release().await.unwrap();
        assert!(store.slot().is_none());
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn test_abnormal_exit_is_cleaned_by_store() {
        let store = Arc::new(MemorySessionStore::new());
        let publisher = SessionPublisher::acquire(store.clone(), Arc::new(Metrics::new())).await.unwrap();
        publisher.publish(&ScanEvent::new("123", CaptureOrigin::Manual)).await.unwrap();

        drop(publisher);
        store.simulate_disconnect();
        assert!(store.slot().is_none());
    }
}
