use crate::backoff::Backoff;
use crate::error::EtlError;
use crate::models::MovieDocument;
use crate::search::bulk::{LoadSummary, inspect_response, upsert_body};
use crate::search::schema::create_index_body;
use crate::search::service::ElasticsearchService;
use dashmap::DashSet;
use log::{debug, info};
use std::future::Future;
use std::sync::Arc;

/// Destination for extracted documents.
pub trait DocumentSink {
    /// Create `index` with the movie schema unless it already exists.
    fn ensure_index(&self, index: &str) -> impl Future<Output = Result<(), EtlError>> + Send;

    /// Upsert `documents` into `index` as one bulk request.
    fn load(
        &self,
        documents: &[MovieDocument],
        index: &str,
    ) -> impl Future<Output = Result<LoadSummary, EtlError>> + Send;
}

/// Loads documents into Elasticsearch with retries on every call.
#[derive(Clone)]
pub struct IndexLoader {
    service: ElasticsearchService,
    backoff: Backoff,
    ensured: Arc<DashSet<String>>,
}

impl IndexLoader {
    pub fn new(service: ElasticsearchService, backoff: Backoff) -> Self {
        Self {
            service,
            backoff,
            ensured: Arc::new(DashSet::new()),
        }
    }

    pub fn service(&self) -> &ElasticsearchService {
        &self.service
    }

    async fn bulk_once(
        &self,
        index: &str,
        body: &[u8],
        expected: usize,
    ) -> Result<LoadSummary, EtlError> {
        let raw = self.service.bulk(index, body.to_vec()).await?;
        inspect_response(&raw, expected)
    }
}

impl DocumentSink for IndexLoader {
    async fn ensure_index(&self, index: &str) -> Result<(), EtlError> {
        if self.ensured.contains(index) {
            return Ok(());
        }

        let service = &self.service;
        let exists = self
            .backoff
            .retry("index_exists", || service.index_exists(index))
            .await?;

        if exists {
            debug!("index '{index}' already present");
        } else {
            info!("index '{index}' does not exist, creating it");
            let body = create_index_body();
            let created = self
                .backoff
                .retry("create_index", || service.create_index(index, &body))
                .await?;
            if !created {
                info!("index '{index}' was created concurrently by another run");
            }
        }

        self.ensured.insert(index.to_string());
        Ok(())
    }

    async fn load(
        &self,
        documents: &[MovieDocument],
        index: &str,
    ) -> Result<LoadSummary, EtlError> {
        if documents.is_empty() {
            return Ok(LoadSummary::default());
        }

        let body = upsert_body(documents)?;
        let expected = documents.len();
        let summary = self
            .backoff
            .retry("bulk_upsert", || self.bulk_once(index, &body, expected))
            .await?;

        debug!(
            "bulk upsert into '{index}': {} created, {} updated, {} unchanged",
            summary.created, summary.updated, summary.unchanged
        );
        Ok(summary)
    }
}
