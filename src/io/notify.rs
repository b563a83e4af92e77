//! Side-channel notifications
//!
//! Best effort only: dispatch runs detached from the pipeline, failures are
//! logged and counted, nothing is retried or shown to the operator.

use crate::domain::error::NotifyError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub destination: String,
    pub message: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// POSTs notifications as JSON to a relay (mail gateway, chat hook)
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self { client, url: url.to_string() })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError(format!("webhook returned HTTP {}", response.status().as_u16())));
        }
        Ok(())
    }
}

/// Writes notifications to the log only
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            destination = %notification.destination,
            message = %notification.message,
            "notification"
        );
        Ok(())
    }
}

/// Fire-and-forget front of a sink, used by the pipeline
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    destination: String,
    on_not_found: bool,
    metrics: Arc<Metrics>,
}

impl Notifier {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        destination: impl Into<String>,
        on_not_found: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { sink, destination: destination.into(), on_not_found, metrics }
    }

    /// Build from config; `None` when notifications are disabled
    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Option<Self> {
        if !config.notify_enabled() {
            return None;
        }

        let sink: Arc<dyn NotificationSink> = match config.notify_url() {
            Some(url) => match WebhookNotifier::new(url) {
                Ok(webhook) => Arc::new(webhook),
                Err(e) => {
                    warn!(error = %e, "notify_webhook_unavailable");
                    Arc::new(LogNotifier)
                }
            },
            None => Arc::new(LogNotifier),
        };

        Some(Self::new(sink, config.notify_destination(), config.notify_on_not_found(), metrics))
    }

    /// Whether NotFound outcomes are reported too
    pub fn on_not_found(&self) -> bool {
        self.on_not_found
    }

    /// Dispatch in the background. Must run inside a Tokio runtime.
    pub fn send(&self, message: String) {
        let notification = Notification { destination: self.destination.clone(), message };
        let sink = self.sink.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            match sink.dispatch(&notification).await {
                Ok(()) => {
                    metrics.record_notification(true);
                    debug!(destination = %notification.destination, "notification_sent");
                }
                Err(e) => {
                    metrics.record_notification(false);
                    warn!(destination = %notification.destination, error = %e, "notification_failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    struct RecordingSink {
        sent: Mutex<Vec<Notification>>,
        fail: bool,
        done: Notify,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn dispatch(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().push(notification.clone());
            self.done.notify_one();
            if self.fail {
                Err(NotifyError("relay down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_send_dispatches_in_background() {
        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()), fail: false, done: Notify::new() });
        let metrics = Arc::new(Metrics::new());
        let notifier = Notifier::new(sink.clone(), "ops@example.com", false, metrics.clone());

        notifier.send("scan error".to_string());
        sink.done.notified().await;

        let sent = sink.sent.lock().clone();
        assert_eq!(
            sent,
            vec![Notification {
                destination: "ops@example.com".to_string(),
                message: "scan error".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_failure_is_counted_not_raised() {
        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()), fail: true, done: Notify::new() });
        let metrics = Arc::new(Metrics::new());
        let notifier = Notifier::new(sink.clone(), "ops", false, metrics.clone());

        notifier.send("lookup failed".to_string());
        sink.done.notified().await;

        // Counter is bumped after dispatch returns
        for _ in 0..100 {
            if metrics.notification_failures() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.notification_failures(), 1);
        assert_eq!(metrics.notifications_sent(), 0);
    }

    #[test]
    fn test_disabled_in_default_config() {
        let metrics = Arc::new(Metrics::new());
        assert!(Notifier::from_config(&Config::default(), metrics).is_none());
    }
}
