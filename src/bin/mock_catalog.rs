//! Mock catalog HTTP server
//!
//! Serves the catalog query endpoint from a JSON file for local runs.
//!
//! Endpoints:
//! - `GET /{collection}?codigo=<code>` - JSON array of matching documents
//! - `GET /health` - liveness
//!
//! The file is re-read per request, so edits show up on the next lookup.
//!
//! Usage:
//!   cargo run --bin mock_catalog -- --port 8088 --file config/catalog.json

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use scan_relay::domain::error::LookupError;
use scan_relay::io::catalog::{CatalogStore, FileCatalog, CODE_FIELD};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use url::form_urlencoded;

#[derive(Parser, Debug)]
#[command(name = "mock_catalog")]
#[command(about = "Mock product catalog for local runs")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8088")]
    port: u16,

    /// JSON file holding an array of catalog documents
    #[arg(short, long, default_value = "config/catalog.json")]
    file: String,

    /// Collection name served at /{collection}
    #[arg(short, long, default_value = "inventario")]
    collection: String,
}

struct Catalog {
    store: FileCatalog,
    path: String,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    respond(status, "application/json", body)
}

/// Value of `key` in a query string
fn query_param(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    catalog: Arc<Catalog>,
    collection_path: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    if *req.method() == Method::GET && path == "/health" {
        return Ok(respond(StatusCode::OK, "text/plain", "ok"));
    }
    if *req.method() != Method::GET || path != collection_path.as_str() {
        return Ok(json_error(StatusCode::NOT_FOUND, "not found"));
    }

    let Some(code) = req.uri().query().and_then(|q| query_param(q, CODE_FIELD)) else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "missing codigo parameter"));
    };

    match catalog.store.query_by_code(&code).await {
        Ok(documents) => {
            info!(code = %code, matches = documents.len(), "catalog_query");
            let body = serde_json::Value::Array(documents).to_string();
            Ok(respond(StatusCode::OK, "application/json", body))
        }
        Err(LookupError::Malformed(e)) => {
            warn!(file = %catalog.path, error = %e, "catalog_file_malformed");
            Ok(json_error(StatusCode::INTERNAL_SERVER_ERROR, "catalog file is malformed"))
        }
        Err(e) => {
            error!(file = %catalog.path, error = %e, "catalog_file_unreadable");
            Ok(json_error(StatusCode::SERVICE_UNAVAILABLE, "catalog unavailable"))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let catalog = Arc::new(Catalog { store: FileCatalog::new(&args.file), path: args.file.clone() });
    let collection_path = Arc::new(format!("/{}", args.collection.trim_matches('/')));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %args.port, file = %args.file, path = %collection_path, "mock_catalog_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let catalog = catalog.clone();
                        let collection_path = collection_path.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, catalog.clone(), collection_path.clone())
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "mock_catalog_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "mock_catalog_accept_error");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("mock_catalog_shutdown");
                return Ok(());
            }
        }
    }
}
