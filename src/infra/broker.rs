//! Embedded MQTT broker (rumqttd) for single-box and development setups
//!
//! The secondary display subscribes to the session key on this broker; the
//! broker holds the retained slot and fires the publisher's last will.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

fn broker_config(listen: SocketAddr) -> Config {
    // One publisher plus a handful of displays
    let router_config = RouterConfig {
        max_segment_size: 1048576,
        max_segment_count: 4,
        max_connections: 64,
        max_outgoing_packet_count: 64,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 16384,
                max_inflight_count: 32,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router: router_config,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker if enabled. Returns false when it was not started.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen_addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return false;
        }
    };

    spawn_broker(listen_addr);
    true
}

/// Run a broker on `listen` in a background thread for the life of the process
pub fn spawn_broker(listen: SocketAddr) {
    let config = broker_config(listen);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the life of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give broker time to bind before the session store connects
    thread::sleep(std::time::Duration::from_millis(100));
    info!(addr = %listen, "broker_started");
}
