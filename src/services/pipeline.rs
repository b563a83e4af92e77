//! Pipeline orchestrator
//!
//! One run: capture a code, then publish it to the live session and look it up
//! in the catalog concurrently. Each branch writes its own fields of
//! `PipelineState` when it completes, so completion order never matters.
//!
//! State machine:
//! Idle -> Capturing -> Resolving -> Settled(Success | NotFound | Error)
//! A capture failure settles straight to Error; a cancelled capture returns to
//! Idle. "Done" clears the session slot and resets to Idle.
//!
//! Only one run (or Done) is in flight at a time; anything else is rejected
//! with `PipelineError::Busy`.

use crate::domain::error::{CaptureError, PipelineError, PublishError};
use crate::domain::types::{LookupOutcome, PipelinePhase, PipelineState, ScanEvent, Settlement};
use crate::infra::metrics::Metrics;
use crate::io::notify::Notifier;
use crate::services::capture::{Capture, CaptureRequest, CaptureSource};
use crate::services::catalog_resolver::CatalogResolver;
use crate::services::session_publisher::SessionPublisher;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a submitted request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Settled(Settlement),
    /// Operator cancelled the capture; state is empty
    Cancelled,
}

/// Clears the in-flight flag on every exit path
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Pipeline {
    capture: Arc<dyn CaptureSource>,
    publisher: SessionPublisher,
    resolver: CatalogResolver,
    notifier: Option<Notifier>,
    metrics: Arc<Metrics>,
    state: watch::Sender<PipelineState>,
    phase: Mutex<PipelinePhase>,
    in_flight: AtomicBool,
}

impl Pipeline {
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        publisher: SessionPublisher,
        resolver: CatalogResolver,
        notifier: Option<Notifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            capture,
            publisher,
            resolver,
            notifier,
            metrics,
            state,
            phase: Mutex::new(PipelinePhase::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Snapshot of the observable state
    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn phase(&self) -> PipelinePhase {
        *self.phase.lock()
    }

    pub fn supports_optical(&self) -> bool {
        self.capture.supports_optical()
    }

    /// Give back the session publisher for release at shutdown
    pub fn into_publisher(self) -> SessionPublisher {
        self.publisher
    }

    fn begin(&self, what: &'static str) -> Result<InFlight<'_>, PipelineError> {
        match self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(InFlight(&self.in_flight)),
            Err(_) => {
                self.metrics.record_busy_rejection();
                warn!(request = what, "pipeline_busy");
                Err(PipelineError::Busy)
            }
        }
    }

    fn set_phase(&self, phase: PipelinePhase) {
        *self.phase.lock() = phase;
    }

    /// Run one capture request to settlement
    pub async fn submit(&self, request: CaptureRequest) -> Result<RunOutcome, PipelineError> {
        let _in_flight = self.begin("capture")?;
        let run_id = Uuid::now_v7();
        let kind = match &request {
            CaptureRequest::Scan => "scan",
            CaptureRequest::Manual(_) => "manual",
        };
        info!(run_id = %run_id, request = kind, "pipeline_run_started");

        self.set_phase(PipelinePhase::Capturing);
        let event = match self.capture.request_code(request).await {
            Ok(Capture::Captured(event)) => event,
            Ok(Capture::Cancelled) => {
                self.metrics.record_capture_cancelled();
                self.state.send_replace(PipelineState::default());
                self.set_phase(PipelinePhase::Idle);
                info!(run_id = %run_id, "pipeline_run_cancelled");
                return Ok(RunOutcome::Cancelled);
            }
            Err(e) => {
                self.settle_capture_failure(&run_id, e);
                return Ok(RunOutcome::Settled(Settlement::Error));
            }
        };

        self.metrics.record_capture();
        info!(
            run_id = %run_id,
            value = %event.value(),
            origin = event.origin().as_str(),
            "code_captured"
        );

        // Whatever the previous run left behind is replaced in one step
        self.state.send_replace(PipelineState {
            scanned: Some(event.value().to_string()),
            loading: true,
            ..PipelineState::default()
        });
        self.set_phase(PipelinePhase::Resolving);

        let ((), settlement) = tokio::join!(self.publish(&run_id, &event), self.resolve(&run_id, &event));

        self.set_phase(PipelinePhase::Settled(settlement));
        info!(run_id = %run_id, value = %event.value(), outcome = settlement.as_str(), "pipeline_run_settled");
        self.notify_settled(event.value(), settlement);
        Ok(RunOutcome::Settled(settlement))
    }

    /// Publish branch: only ever touches `publish_error`
    async fn publish(&self, run_id: &Uuid, event: &ScanEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            self.record_publish_failure(run_id, &e);
        }
    }

    #[cold]
    fn record_publish_failure(&self, run_id: &Uuid, e: &PublishError) {
        warn!(run_id = %run_id, error = %e, "pipeline_publish_failed");
        let message = e.to_string();
        self.state.send_modify(|state| state.publish_error = Some(message));
    }

    /// Lookup branch: touches everything except `publish_error`
    async fn resolve(&self, run_id: &Uuid, event: &ScanEvent) -> Settlement {
        let outcome = self.resolver.lookup(event.value()).await;
        let settlement = match &outcome {
            Ok(LookupOutcome::Found(_)) => Settlement::Success,
            Ok(LookupOutcome::NotFound) => Settlement::NotFound,
            Err(e) => {
                error!(run_id = %run_id, value = %event.value(), error = %e, "catalog_lookup_failed");
                Settlement::Error
            }
        };

        self.state.send_modify(|state| {
            state.loading = false;
            match outcome {
                Ok(LookupOutcome::Found(record)) => {
                    state.product = Some(record);
                    state.not_found = false;
                    state.error = None;
                }
                Ok(LookupOutcome::NotFound) => {
                    state.product = None;
                    state.not_found = true;
                    state.error = None;
                }
                Err(e) => {
                    state.product = None;
                    state.not_found = false;
                    state.error = Some(e.to_string());
                }
            }
        });
        settlement
    }

    #[cold]
    fn settle_capture_failure(&self, run_id: &Uuid, e: CaptureError) {
        self.metrics.record_capture_failed(&e);
        match &e {
            CaptureError::ScanFailure(detail) => {
                warn!(run_id = %run_id, kind = e.kind(), detail = %detail, "capture_failed")
            }
            _ => warn!(run_id = %run_id, kind = e.kind(), "capture_failed"),
        }

        let message = e.to_string();
        self.state.send_replace(PipelineState { error: Some(message.clone()), ..PipelineState::default() });
        self.set_phase(PipelinePhase::Settled(Settlement::Error));
        if let Some(notifier) = &self.notifier {
            notifier.send(format!("capture failed: {message}"));
        }
    }

    fn notify_settled(&self, value: &str, settlement: Settlement) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        match settlement {
            Settlement::Error => {
                let error = self.state.borrow().error.clone().unwrap_or_default();
                notifier.send(format!("lookup for code {value} failed: {error}"));
            }
            Settlement::NotFound if notifier.on_not_found() => {
                notifier.send(format!("code {value} is not in the catalog"));
            }
            _ => {}
        }
    }

    /// Operator "Done": clear the session slot, then reset to empty.
    ///
    /// A failed clear is logged and does not block the reset.
    pub async fn done(&self) -> Result<(), PipelineError> {
        let _in_flight = self.begin("done")?;

        if let Err(e) = self.publisher.clear().await {
            error!(error = %e, "session_clear_failed");
        }
        self.state.send_replace(PipelineState::default());
        self.set_phase(PipelinePhase::Idle);
        debug!("pipeline_reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{LookupError, PublishError};
    use crate::domain::types::SessionSlot;
    use crate::io::catalog::{CatalogStore, MemoryCatalog};
    use crate::io::session_store::{MemorySessionStore, SessionStore};
    use crate::services::capture::ManualCapture;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Each gated call consumes one permit
    async fn pass(gate: &Semaphore) {
        gate.acquire().await.unwrap().forget();
    }

    /// Session store whose writes wait for `gate`
    struct GatedStore {
        inner: MemorySessionStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl SessionStore for GatedStore {
        async fn arm_disconnect_cleanup(&self) -> Result<(), PublishError> {
            self.inner.arm_disconnect_cleanup().await
        }
        async fn write(&self, slot: &SessionSlot) -> Result<(), PublishError> {
            pass(&self.gate).await;
            self.inner.write(slot).await
        }
        async fn clear(&self) -> Result<(), PublishError> {
            self.inner.clear().await
        }
        async fn disconnect(&self) -> Result<(), PublishError> {
            self.inner.disconnect().await
        }
    }

    /// Catalog whose queries wait for `gate` and are counted
    struct GatedCatalog {
        inner: MemoryCatalog,
        gate: Semaphore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogStore for GatedCatalog {
        async fn query_by_code(&self, code: &str) -> Result<Vec<Value>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            pass(&self.gate).await;
            self.inner.query_by_code(code).await
        }
    }

    struct DeniedCapture;

    #[async_trait]
    impl CaptureSource for DeniedCapture {
        async fn request_code(&self, _request: CaptureRequest) -> Result<Capture, CaptureError> {
            Err(CaptureError::PermissionDenied)
        }
        fn supports_optical(&self) -> bool {
            true
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        store: Arc<GatedStore>,
        catalog: Arc<GatedCatalog>,
    }

    impl Harness {
        /// Let every pending and future gated call through
        fn open_gates(&self) {
            self.store.gate.add_permits(64);
            self.catalog.gate.add_permits(64);
        }
    }

    fn widget() -> Value {
        json!({"codigo": "123", "nombre": "Widget", "categoria": "Tools", "precio": 9.99, "cantidad": 5})
    }

    async fn harness(capture: Arc<dyn CaptureSource>, documents: Vec<Value>) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(GatedStore { inner: MemorySessionStore::new(), gate: Semaphore::new(0) });
        let catalog = Arc::new(GatedCatalog {
            inner: MemoryCatalog::new(documents),
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        });
        let publisher = SessionPublisher::acquire(store.clone(), metrics.clone()).await.unwrap();
        let resolver = CatalogResolver::new(catalog.clone(), metrics.clone());
        let pipeline = Arc::new(Pipeline::new(capture, publisher, resolver, None, metrics));
        Harness { pipeline, store, catalog }
    }

    fn manual(text: &str) -> CaptureRequest {
        CaptureRequest::Manual(text.to_string())
    }

    fn found_state() -> PipelineState {
        PipelineState {
            scanned: Some("123".to_string()),
            product: serde_json::from_value(widget()).ok(),
            ..PipelineState::default()
        }
    }

    #[tokio::test]
    async fn test_manual_code_found() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();

        let outcome = h.pipeline.submit(manual("  123  ")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Settled(Settlement::Success));
        assert_eq!(h.pipeline.state(), found_state());
        assert_eq!(h.pipeline.phase(), PipelinePhase::Settled(Settlement::Success));
        assert_eq!(h.store.inner.slot().unwrap().value, "123");
    }

    #[tokio::test]
    async fn test_completion_order_does_not_matter() {
        for lookup_first in [true, false] {
            let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
            let mut rx = h.pipeline.subscribe();
            let pipeline = h.pipeline.clone();
            let run = tokio::spawn(async move { pipeline.submit(manual("123")).await });

            rx.wait_for(|s| s.loading).await.unwrap();
            if lookup_first {
                h.catalog.gate.add_permits(1);
                rx.wait_for(|s| !s.loading).await.unwrap();
                h.store.gate.add_permits(1);
            } else {
                h.store.gate.add_permits(1);
                // Wait for the write to land before letting the lookup finish
                while h.store.inner.write_count() == 0 {
                    tokio::task::yield_now().await;
                }
                h.catalog.gate.add_permits(1);
            }

            assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Settled(Settlement::Success));
            assert_eq!(h.pipeline.state(), found_state());
            assert_eq!(h.store.inner.write_count(), 1);
            assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_busy_while_in_flight() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        let mut rx = h.pipeline.subscribe();
        let pipeline = h.pipeline.clone();
        let run = tokio::spawn(async move { pipeline.submit(manual("123")).await });

        rx.wait_for(|s| s.loading).await.unwrap();
        assert_eq!(h.pipeline.phase(), PipelinePhase::Resolving);
        assert_eq!(h.pipeline.submit(manual("456")).await, Err(PipelineError::Busy));
        assert_eq!(h.pipeline.done().await, Err(PipelineError::Busy));

        h.open_gates();
        run.await.unwrap().unwrap();
        assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 1);

        // Settled runs accept the next request
        assert!(h.pipeline.submit(manual("123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_found_scenario() {
        let h = harness(Arc::new(ManualCapture), Vec::new()).await;
        h.open_gates();

        let outcome = h.pipeline.submit(manual("123")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Settled(Settlement::NotFound));
        assert_eq!(
            h.pipeline.state(),
            PipelineState {
                scanned: Some("123".to_string()),
                product: None,
                loading: false,
                error: None,
                not_found: true,
                publish_error: None,
            }
        );
    }

    #[tokio::test]
    async fn test_permission_denied_issues_no_calls() {
        let h = harness(Arc::new(DeniedCapture), vec![widget()]).await;
        h.open_gates();

        let outcome = h.pipeline.submit(CaptureRequest::Scan).await.unwrap();
        assert_eq!(outcome, RunOutcome::Settled(Settlement::Error));
        assert_eq!(
            h.pipeline.state(),
            PipelineState { error: Some("permission denied".to_string()), ..PipelineState::default() }
        );
        assert_eq!(h.store.inner.write_count(), 0);
        assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_manual_input_is_rejected() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();

        h.pipeline.submit(manual("   ")).await.unwrap();
        assert_eq!(h.pipeline.state().error.as_deref(), Some("invalid code"));
        assert_eq!(h.pipeline.state().scanned, None);
        assert_eq!(h.store.inner.write_count(), 0);
        assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_lookup() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();
        h.store.inner.set_failure(Some("broker down"));

        let outcome = h.pipeline.submit(manual("123")).await.unwrap();
        assert_eq!(outcome, RunOutcome::Settled(Settlement::Success));
        let state = h.pipeline.state();
        assert_eq!(state.product, found_state().product);
        assert_eq!(state.error, None);
        assert_eq!(state.publish_error.as_deref(), Some("session publish failed: broker down"));
    }

    #[tokio::test]
    async fn test_done_resets_to_empty() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();
        h.pipeline.submit(manual("123")).await.unwrap();

        h.pipeline.done().await.unwrap();
        assert!(h.pipeline.state().is_empty());
        assert_eq!(h.pipeline.phase(), PipelinePhase::Idle);
        assert!(h.store.inner.slot().is_none());
    }

    #[tokio::test]
    async fn test_done_resets_even_when_clear_fails() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();
        h.pipeline.submit(manual("123")).await.unwrap();

        h.store.inner.set_failure(Some("broker down"));
        h.pipeline.done().await.unwrap();
        assert!(h.pipeline.state().is_empty());
    }

    #[tokio::test]
    async fn test_new_run_replaces_previous_state() {
        let h = harness(Arc::new(ManualCapture), vec![widget()]).await;
        h.open_gates();
        h.pipeline.submit(manual("123")).await.unwrap();
        h.pipeline.submit(manual("999")).await.unwrap();

        let state = h.pipeline.state();
        assert_eq!(state.scanned.as_deref(), Some("999"));
        assert_eq!(state.product, None);
        assert!(state.not_found);
    }
}
