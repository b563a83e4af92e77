//! Catalog resolver - exact-code product lookup
//!
//! Converts raw catalog documents into `CatalogRecord` at the boundary. More
//! than one match resolves to the first in store order.

use crate::domain::error::LookupError;
use crate::domain::types::{CatalogRecord, LookupOutcome};
use crate::infra::metrics::Metrics;
use crate::io::catalog::{has_code, CatalogStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct CatalogResolver {
    store: Arc<dyn CatalogStore>,
    metrics: Arc<Metrics>,
}

impl CatalogResolver {
    pub fn new(store: Arc<dyn CatalogStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn lookup(&self, code: &str) -> Result<LookupOutcome, LookupError> {
        let started = Instant::now();
        let result = self.query(code).await;
        self.metrics.record_lookup_latency(started.elapsed().as_millis() as u64);

        match &result {
            Ok(LookupOutcome::Found(_)) => self.metrics.record_lookup_found(),
            Ok(LookupOutcome::NotFound) => self.metrics.record_lookup_not_found(),
            Err(_) => self.metrics.record_lookup_failed(),
        }
        result
    }

    async fn query(&self, code: &str) -> Result<LookupOutcome, LookupError> {
        let documents = self.store.query_by_code(code).await?;

        // Backends are not trusted to filter exactly
        let mut matches = documents.into_iter().filter(|d| has_code(d, code));
        let Some(first) = matches.next() else {
            debug!(code = %code, "catalog_not_found");
            return Ok(LookupOutcome::NotFound);
        };

        let extra = matches.count();
        if extra > 0 {
            warn!(code = %code, matches = extra + 1, "catalog_duplicate_code");
        }

        let record: CatalogRecord =
            serde_json::from_value(first).map_err(|e| LookupError::Malformed(e.to_string()))?;
        debug!(code = %code, name = %record.name, "catalog_found");
        Ok(LookupOutcome::Found(record))
    }
}
