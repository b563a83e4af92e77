//! Read-only product catalog backends
//!
//! Backends return raw documents so shape validation happens in one place
//! (the resolver). All of them query by exact `codigo` and never cache.

use crate::domain::error::LookupError;
use crate::infra::config::Config;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Catalog field holding the product identifier
pub const CODE_FIELD: &str = "codigo";

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Documents whose `codigo` equals `code`, in store order
    async fn query_by_code(&self, code: &str) -> Result<Vec<Value>, LookupError>;
}

/// True when the document's code field is exactly `code`
pub fn has_code(document: &Value, code: &str) -> bool {
    document.get(CODE_FIELD).and_then(Value::as_str) == Some(code)
}

/// Accept either a bare JSON array or `{"documents": [...]}`
fn documents_from_body(body: Value) -> Result<Vec<Value>, LookupError> {
    match body {
        Value::Array(documents) => Ok(documents),
        Value::Object(mut map) => match map.remove("documents") {
            Some(Value::Array(documents)) => Ok(documents),
            _ => Err(LookupError::Malformed("expected a JSON array of documents".to_string())),
        },
        _ => Err(LookupError::Malformed("expected a JSON array of documents".to_string())),
    }
}

/// Catalog behind an HTTP query endpoint: `GET {base}/{collection}?codigo=...`
pub struct HttpCatalog {
    client: reqwest::Client,
    collection_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str, collection: &str, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Query(format!("failed to build HTTP client: {e}")))?;
        let collection_url = format!("{}/{}", base_url.trim_end_matches('/'), collection);
        Ok(Self { client, collection_url })
    }

    pub fn from_config(config: &Config) -> Result<Self, LookupError> {
        Self::new(
            config.catalog_url(),
            config.catalog_collection(),
            Duration::from_millis(config.catalog_timeout_ms()),
        )
    }

    pub fn collection_url(&self) -> &str {
        &self.collection_url
    }
}

#[async_trait]
impl CatalogStore for HttpCatalog {
    async fn query_by_code(&self, code: &str) -> Result<Vec<Value>, LookupError> {
        let response = self
            .client
            .get(&self.collection_url)
            .query(&[(CODE_FIELD, code)])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| LookupError::Query(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Query(format!("catalog returned HTTP {}", status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LookupError::Malformed(format!("invalid response body: {e}")))?;
        let documents = documents_from_body(body)?;
        debug!(url = %self.collection_url, code = %code, count = documents.len(), "catalog_http_query");
        Ok(documents)
    }
}

/// Catalog kept in a JSON file, re-read on every query
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.catalog_file())
    }
}

#[async_trait]
impl CatalogStore for FileCatalog {
    async fn query_by_code(&self, code: &str) -> Result<Vec<Value>, LookupError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LookupError::Query(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let body: Value = serde_json::from_str(&content)
            .map_err(|e| LookupError::Malformed(format!("{}: {e}", self.path.display())))?;
        Ok(documents_from_body(body)?.into_iter().filter(|d| has_code(d, code)).collect())
    }
}

/// Fixed in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    documents: Vec<Value>,
}

impl MemoryCatalog {
    pub fn new(documents: Vec<Value>) -> Self {
        Self { documents }
    }

    pub fn documents(&self) -> &[Value] {
        &self.documents
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn query_by_code(&self, code: &str) -> Result<Vec<Value>, LookupError> {
        Ok(self.documents.iter().filter(|d| has_code(d, code)).cloned().collect())
    }
}
