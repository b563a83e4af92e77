//! Live session store backends
//!
//! The store holds one shared slot under a fixed key. Two backends:
//! - `MqttSessionStore` - retained message on a fixed topic; the disconnect
//!   rule is an MQTT last will that retains an empty payload on the same topic
//! - `MemorySessionStore` - in-process slot for tests and offline runs

use crate::domain::error::PublishError;
use crate::domain::types::SessionSlot;
use crate::infra::config::Config;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_QUEUE_CAPACITY: usize = 16;

/// Shared key-value slot with a clear-on-disconnect rule
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register the rule that empties the slot if this client drops without clearing
    async fn arm_disconnect_cleanup(&self) -> Result<(), PublishError>;

    /// Overwrite the slot
    async fn write(&self, slot: &SessionSlot) -> Result<(), PublishError>;

    /// Empty the slot. Succeeds when it is already empty.
    async fn clear(&self) -> Result<(), PublishError>;

    /// Close the connection cleanly; the disconnect rule does not fire
    async fn disconnect(&self) -> Result<(), PublishError>;
}

/// Slot held as a retained MQTT message.
///
/// Publishing a zero-length retained message deletes the retained slot on the
/// broker, which is both `clear` and the last will payload.
///
/// Writes never wait on the network: they fail with `PublishError::Store` while
/// the connection is down or the request queue is full. Dropping the store
/// without `disconnect` closes the socket uncleanly, so the will fires.
pub struct MqttSessionStore {
    client: AsyncClient,
    topic: String,
    connected: watch::Receiver<bool>,
    arm_timeout: Duration,
    eventloop_task: JoinHandle<()>,
}

impl MqttSessionStore {
    /// Create the client and start its event loop. Must run inside a Tokio runtime.
    pub fn new(config: &Config) -> Self {
        let client_id = format!("scan-relay-{}-{}", config.site_id(), std::process::id());
        let topic = config.session_key().to_string();

        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(
            topic.clone(),
            Vec::<u8>::new(),
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, REQUEST_QUEUE_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let eventloop_task = tokio::spawn(drive_eventloop(eventloop, connected_tx));

        info!(
            host = %config.mqtt_host(),
            port = %config.mqtt_port(),
            topic = %topic,
            "session_store_connecting"
        );

        Self {
            client,
            topic,
            connected: connected_rx,
            arm_timeout: Duration::from_millis(config.session_arm_timeout_ms()),
            eventloop_task,
        }
    }

    /// Whether the broker has acknowledged the current connection
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn publish_retained(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Store("not connected to broker".to_string()));
        }
        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| PublishError::Store(format!("publish not queued: {e}")))
    }
}

impl Drop for MqttSessionStore {
    fn drop(&mut self) {
        self.eventloop_task.abort();
    }
}

/// Poll the MQTT event loop until a clean disconnect is sent.
///
/// rumqttc reconnects on the next poll after an error; the will registered at
/// CONNECT is re-sent with every reconnect.
async fn drive_eventloop(mut eventloop: EventLoop, connected: watch::Sender<bool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("session_store_connected");
                connected.send_replace(true);
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                debug!("session_store_puback");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("session_store_disconnected");
                connected.send_replace(false);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.send_replace(false) {
                    warn!(error = %e, "session_store_connection_lost");
                } else {
                    debug!(error = %e, "session_store_connect_failed");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl SessionStore for MqttSessionStore {
    async fn arm_disconnect_cleanup(&self) -> Result<(), PublishError> {
        // The will is part of CONNECT; the broker has it once the connection is acknowledged
        let mut connected = self.connected.clone();
        let acked = tokio::time::timeout(self.arm_timeout, connected.wait_for(|c| *c))
            .await
            .map(|result| result.is_ok());
        match acked {
            Ok(true) => Ok(()),
            Ok(false) => Err(PublishError::Store("session connection task stopped".to_string())),
            Err(_) => Err(PublishError::ArmTimeout(self.arm_timeout.as_millis() as u64)),
        }
    }

    async fn write(&self, slot: &SessionSlot) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(slot).map_err(|e| PublishError::Store(e.to_string()))?;
        self.publish_retained(payload)
    }

    async fn clear(&self) -> Result<(), PublishError> {
        self.publish_retained(Vec::new())
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.client
            .try_disconnect()
            .map_err(|e| PublishError::Store(format!("disconnect not queued: {e}")))?;

        // Queued publishes go out ahead of DISCONNECT
        let mut connected = self.connected.clone();
        if tokio::time::timeout(self.arm_timeout, connected.wait_for(|c| !*c)).await.is_err() {
            warn!("session_store_disconnect_timeout");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemorySlot {
    slot: Option<SessionSlot>,
    cleanup_armed: bool,
    connected: bool,
    writes: u64,
    failure: Option<String>,
}

/// In-process session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemorySlot>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current slot content
    pub fn slot(&self) -> Option<SessionSlot> {
        self.inner.lock().slot.clone()
    }

    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    pub fn cleanup_armed(&self) -> bool {
        self.inner.lock().cleanup_armed
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Make every following write/clear fail with `reason` (None restores)
    pub fn set_failure(&self, reason: Option<&str>) {
        self.inner.lock().failure = reason.map(str::to_string);
    }

    /// Drop the connection without a clean disconnect; applies the armed rule
    pub fn simulate_disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.connected && inner.cleanup_armed {
            inner.slot = None;
        }
        inner.connected = false;
    }

    fn check_failure(inner: &MemorySlot) -> Result<(), PublishError> {
        match &inner.failure {
            Some(reason) => Err(PublishError::Store(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn arm_disconnect_cleanup(&self) -> Result<(), PublishError> {
        let mut inner = self.inner.lock();
        inner.cleanup_armed = true;
        inner.connected = true;
        Ok(())
    }

    async fn write(&self, slot: &SessionSlot) -> Result<(), PublishError> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner)?;
        inner.slot = Some(slot.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<(), PublishError> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner)?;
        inner.slot = None;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        self.inner.lock().connected = false;
        Ok(())
    }
}
