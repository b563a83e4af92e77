//! scan-relay - barcode capture relay
//!
//! Captures a product code (camera scan or typed entry), mirrors it to a
//! shared live-session slot for a secondary display, and resolves it against
//! the product catalog.
//!
//! Module structure:
//! - `domain/` - Core types (ScanEvent, CatalogRecord, PipelineState, errors)
//! - `io/` - External interfaces (scanner process, session store, catalog, notifications)
//! - `services/` - Business logic (capture sources, publisher, resolver, pipeline)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use scan_relay::domain::PipelineState;
use scan_relay::infra::{CatalogBackend, Config, LogFormat, Metrics, SessionBackend};
use scan_relay::io::{
    CatalogStore, FileCatalog, HttpCatalog, MemorySessionStore, MqttSessionStore, Notifier,
    SessionStore,
};
use scan_relay::services::{
    resolve_capture_source, CaptureRequest, CatalogResolver, Pipeline, SessionPublisher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Operator console for the scan relay
#[derive(Parser, Debug)]
#[command(name = "scan-relay", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// One line of operator input
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Capture(CaptureRequest),
    Done,
    State,
    Help,
    Quit,
    Empty,
}

fn parse_command(line: &str) -> ConsoleCommand {
    let trimmed = line.trim();
    let (word, rest) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
    match word {
        "" => ConsoleCommand::Empty,
        "scan" => ConsoleCommand::Capture(CaptureRequest::Scan),
        "code" => ConsoleCommand::Capture(CaptureRequest::Manual(rest.to_string())),
        "done" => ConsoleCommand::Done,
        "state" => ConsoleCommand::State,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        // Anything else is a typed code
        _ => ConsoleCommand::Capture(CaptureRequest::Manual(line.to_string())),
    }
}

fn render(state: &PipelineState) {
    if state.is_empty() {
        println!("-- ready: scan or type a code");
        return;
    }

    let scanned = state.scanned.as_deref().unwrap_or("-");
    if state.loading {
        println!("[{scanned}] looking up...");
    } else if let Some(product) = &state.product {
        println!(
            "[{scanned}] {} | {} | {:.2} | qty {}",
            product.name, product.category, product.price, product.quantity
        );
    } else if state.not_found {
        println!("[{scanned}] no details for this code");
    }

    if let Some(error) = &state.error {
        println!("error: {error}");
    }
    if let Some(publish_error) = &state.publish_error {
        println!("warning: {publish_error}");
    }
}

fn print_help(optical: bool) {
    if optical {
        println!("commands: scan | code <text> | <text> | done | state | quit");
    } else {
        println!("commands: code <text> | <text> | done | state | quit  (camera scan unavailable)");
    }
}

/// Logs go to stderr; stdout is the operator display
fn init_tracing(format: LogFormat) {
    // RUST_LOG overrides; per-run detail is at debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    init_tracing(config.log_format());
    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "scan-relay starting");
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        session_key = %config.session_key(),
        catalog_url = %config.catalog_url(),
        catalog_collection = %config.catalog_collection(),
        platform = config.capture_platform().as_str(),
        "config_loaded"
    );

    if scan_relay::infra::broker::start_embedded_broker(&config) {
        info!(port = %config.broker_port(), "embedded_broker_enabled");
    }

    let metrics = Arc::new(Metrics::new());
    let capture = resolve_capture_source(&config);

    let store: Arc<dyn SessionStore> = match config.session_backend() {
        SessionBackend::Mqtt => Arc::new(MqttSessionStore::new(&config)),
        SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
    };
    let publisher = SessionPublisher::acquire(store, metrics.clone())
        .await
        .context("failed to open the live session")?;

    let catalog: Arc<dyn CatalogStore> = match config.catalog_backend() {
        CatalogBackend::Http => {
            Arc::new(HttpCatalog::from_config(&config).context("failed to create catalog client")?)
        }
        CatalogBackend::File => Arc::new(FileCatalog::from_config(&config)),
    };
    let resolver = CatalogResolver::new(catalog, metrics.clone());
    let notifier = Notifier::from_config(&config, metrics.clone());

    let pipeline = Arc::new(Pipeline::new(capture, publisher, resolver, notifier, metrics.clone()));

    // Render every state change
    let mut state_rx = pipeline.subscribe();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            render(&state);
        }
    });

    // Periodic metrics summary (0 disables)
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let reporter = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            // First tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                reporter.report().log();
            }
        });
    }

    print_help(pipeline.supports_optical());
    render(&pipeline.state());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut runs: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "stdin_read_failed");
                        break;
                    }
                };

                // Runs and resets go to tasks so stdin and ctrl-c stay responsive
                match parse_command(&line) {
                    ConsoleCommand::Capture(request) => {
                        runs.retain(|run| !run.is_finished());
                        let pipeline = pipeline.clone();
                        runs.push(tokio::spawn(async move {
                            if let Err(e) = pipeline.submit(request).await {
                                println!("{e}");
                            }
                        }));
                    }
                    ConsoleCommand::Done => {
                        runs.retain(|run| !run.is_finished());
                        let pipeline = pipeline.clone();
                        runs.push(tokio::spawn(async move {
                            if let Err(e) = pipeline.done().await {
                                println!("{e}");
                            }
                        }));
                    }
                    ConsoleCommand::State => render(&pipeline.state()),
                    ConsoleCommand::Help => print_help(pipeline.supports_optical()),
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Empty => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    // Let in-flight runs settle before releasing the session
    for run in runs {
        if let Err(e) = run.await {
            warn!(error = %e, "pipeline_run_task_failed");
        }
    }

    metrics.report().log();
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline
            .into_publisher()
            .release()
            .await
            .context("failed to release the live session")?,
        Err(_) => warn!("session_release_skipped"),
    }

    info!("scan-relay shutdown complete");
    Ok(())
}
