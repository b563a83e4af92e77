//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::Symbology;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Runtime environment used to pick the capture capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Detect from the host OS at startup
    Auto,
    Android,
    Ios,
    Desktop,
    /// No camera access; manual entry only
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Auto => "auto",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Desktop => "desktop",
            Platform::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Mqtt,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    Http,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Deployment identifier, used in client ids and logs
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "scanner".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_backend")]
    pub backend: SessionBackend,
    /// Fixed key of the shared slot (MQTT topic)
    #[serde(default = "default_session_key")]
    pub key: String,
    /// How long to wait for the store to confirm the disconnect rule
    #[serde(default = "default_arm_timeout_ms")]
    pub arm_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            key: default_session_key(),
            arm_timeout_ms: default_arm_timeout_ms(),
        }
    }
}

fn default_session_backend() -> SessionBackend {
    SessionBackend::Mqtt
}

fn default_session_key() -> String {
    "scanner/codigo".to_string()
}

fn default_arm_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_backend")]
    pub backend: CatalogBackend,
    #[serde(default = "default_catalog_url")]
    pub url: String,
    #[serde(default = "default_catalog_collection")]
    pub collection: String,
    /// JSON array of catalog documents (file backend)
    #[serde(default = "default_catalog_file")]
    pub file: String,
    #[serde(default = "default_catalog_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: default_catalog_backend(),
            url: default_catalog_url(),
            collection: default_catalog_collection(),
            file: default_catalog_file(),
            timeout_ms: default_catalog_timeout_ms(),
        }
    }
}

fn default_catalog_backend() -> CatalogBackend {
    CatalogBackend::Http
}

fn default_catalog_url() -> String {
    "http://localhost:8088".to_string()
}

fn default_catalog_collection() -> String {
    "inventario".to_string()
}

fn default_catalog_file() -> String {
    "config/catalog.json".to_string()
}

fn default_catalog_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_platform")]
    pub platform: Platform,
    /// External decoder; optical capture is disabled when unset
    #[serde(default)]
    pub scanner_command: Option<String>,
    #[serde(default)]
    pub scanner_args: Vec<String>,
    #[serde(default = "default_camera_device")]
    pub camera_device: String,
    /// Exit code the decoder uses when the operator backs out
    #[serde(default)]
    pub cancel_exit_code: Option<i32>,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_formats")]
    pub formats: Vec<Symbology>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            scanner_command: None,
            scanner_args: Vec::new(),
            camera_device: default_camera_device(),
            cancel_exit_code: None,
            scan_timeout_ms: default_scan_timeout_ms(),
            formats: default_formats(),
        }
    }
}

fn default_platform() -> Platform {
    Platform::Auto
}

fn default_camera_device() -> String {
    "/dev/video0".to_string()
}

fn default_scan_timeout_ms() -> u64 {
    30_000
}

fn default_formats() -> Vec<Symbology> {
    Symbology::DEFAULT_SET.to_vec()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Webhook receiving `{destination, message}`; log-only when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub on_not_found: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

fn default_broker_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Summary log interval (0 to disable)
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: default_log_format() }
    }
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_keep_alive_secs: u64,
    session_backend: SessionBackend,
    session_key: String,
    session_arm_timeout_ms: u64,
    catalog_backend: CatalogBackend,
    catalog_url: String,
    catalog_collection: String,
    catalog_file: String,
    catalog_timeout_ms: u64,
    capture_platform: Platform,
    scanner_command: Option<String>,
    scanner_args: Vec<String>,
    camera_device: String,
    scanner_cancel_exit_code: Option<i32>,
    scan_timeout_ms: u64,
    capture_formats: Vec<Symbology>,
    notify_enabled: bool,
    notify_url: Option<String>,
    notify_destination: String,
    notify_on_not_found: bool,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    log_format: LogFormat,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        // Then $CONFIG_FILE
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        // Then the shipped dev config
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let TomlConfig { site, mqtt, session, catalog, capture, notify, broker, metrics, logging } =
            toml_config;

        // An empty list would leave the decoder with nothing to look for
        let capture_formats =
            if capture.formats.is_empty() { default_formats() } else { capture.formats };

        Self {
            site_id: site.id,
            mqtt_host: mqtt.host,
            mqtt_port: mqtt.port,
            mqtt_username: mqtt.username,
            mqtt_password: mqtt.password,
            mqtt_keep_alive_secs: mqtt.keep_alive_secs,
            session_backend: session.backend,
            session_key: session.key,
            session_arm_timeout_ms: session.arm_timeout_ms,
            catalog_backend: catalog.backend,
            catalog_url: catalog.url,
            catalog_collection: catalog.collection,
            catalog_file: catalog.file,
            catalog_timeout_ms: catalog.timeout_ms,
            capture_platform: capture.platform,
            scanner_command: capture.scanner_command.filter(|c| !c.trim().is_empty()),
            scanner_args: capture.scanner_args,
            camera_device: capture.camera_device,
            scanner_cancel_exit_code: capture.cancel_exit_code,
            scan_timeout_ms: capture.scan_timeout_ms,
            capture_formats,
            notify_enabled: notify.enabled,
            notify_url: notify.url,
            notify_destination: notify.destination,
            notify_on_not_found: notify.on_not_found,
            broker_enabled: broker.enabled,
            broker_bind_address: broker.bind_address,
            broker_port: broker.port,
            metrics_interval_secs: metrics.interval_secs,
            log_format: logging.format,
            config_file: config_file.to_string(),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_keep_alive_secs(&self) -> u64 {
        self.mqtt_keep_alive_secs
    }

    pub fn session_backend(&self) -> SessionBackend {
        self.session_backend
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn session_arm_timeout_ms(&self) -> u64 {
        self.session_arm_timeout_ms
    }

    pub fn catalog_backend(&self) -> CatalogBackend {
        self.catalog_backend
    }

    pub fn catalog_url(&self) -> &str {
        &self.catalog_url
    }

    pub fn catalog_collection(&self) -> &str {
        &self.catalog_collection
    }

    pub fn catalog_file(&self) -> &str {
        &self.catalog_file
    }

    pub fn catalog_timeout_ms(&self) -> u64 {
        self.catalog_timeout_ms
    }

    pub fn capture_platform(&self) -> Platform {
        self.capture_platform
    }

    pub fn scanner_command(&self) -> Option<&str> {
        self.scanner_command.as_deref()
    }

    pub fn scanner_args(&self) -> &[String] {
        &self.scanner_args
    }

    pub fn camera_device(&self) -> &str {
        &self.camera_device
    }

    pub fn scanner_cancel_exit_code(&self) -> Option<i32> {
        self.scanner_cancel_exit_code
    }

    pub fn scan_timeout_ms(&self) -> u64 {
        self.scan_timeout_ms
    }

    pub fn capture_formats(&self) -> &[Symbology] {
        &self.capture_formats
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn notify_url(&self) -> Option<&str> {
        self.notify_url.as_deref()
    }

    pub fn notify_destination(&self) -> &str {
        &self.notify_destination
    }

    pub fn notify_on_not_found(&self) -> bool {
        self.notify_on_not_found
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to choose the capture platform
    #[cfg(test)]
    pub fn with_capture_platform(mut self, platform: Platform) -> Self {
        self.capture_platform = platform;
        self
    }

    /// Builder method for tests to set the decoder command
    #[cfg(test)]
    pub fn with_scanner_command(mut self, command: &str) -> Self {
        self.scanner_command = Some(command.to_string());
        self
    }
}
