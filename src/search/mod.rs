//! Elasticsearch side of the pipeline: index schema, bulk encoding and loading.

pub mod bulk;
pub mod indexer;
pub mod schema;
pub mod service;

pub use bulk::LoadSummary;
pub use indexer::{DocumentSink, IndexLoader};
pub use service::ElasticsearchService;
