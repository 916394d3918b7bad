//! NDJSON encoding of upserts and inspection of `_bulk` responses.

use crate::error::{EtlError, status_is_transient};
use crate::models::MovieDocument;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize)]
struct UpdateAction<'a> {
    update: ActionMeta<'a>,
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    doc: &'a MovieDocument,
    doc_as_upsert: bool,
}

/// One `update` action per document, keyed by the document's own ID, inserting
/// it when absent.
pub fn upsert_body(documents: &[MovieDocument]) -> Result<Vec<u8>, EtlError> {
    let mut body = Vec::with_capacity(documents.len() * 512);
    for document in documents {
        let id = document.document_id();
        serde_json::to_writer(&mut body, &UpdateAction {
            update: ActionMeta { id: &id },
        })?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, &UpsertBody {
            doc: document,
            doc_as_upsert: true,
        })?;
        body.push(b'\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Per-result tallies for one bulk request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl LoadSummary {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

/// Fail the batch if any item was rejected.
///
/// The failure is retryable only when every rejected item was throttled or hit
/// an unavailable shard; any other rejection would repeat on retry.
pub fn inspect_response(raw: &[u8], expected: usize) -> Result<LoadSummary, EtlError> {
    let response: BulkResponse = serde_json::from_slice(raw)?;
    let mut summary = LoadSummary::default();
    let mut failures: Vec<(u16, String)> = Vec::new();

    for item in response.items.iter().flat_map(|entry| entry.values()) {
        if let Some(error) = &item.error {
            let reason = format!(
                "{} for {}: {}",
                error.kind.as_deref().unwrap_or("error"),
                item.id.as_deref().unwrap_or("<unknown>"),
                error.reason.as_deref().unwrap_or("no reason given")
            );
            failures.push((item.status, reason));
            continue;
        }

        match item.result.as_deref() {
            Some("created") => summary.created += 1,
            Some("noop") => summary.unchanged += 1,
            _ => summary.updated += 1,
        }
    }

    if failures.is_empty() && response.errors {
        failures.push((500, "bulk response flagged errors without item details".to_string()));
    }

    if failures.is_empty() {
        return Ok(summary);
    }

    let retryable = failures.iter().all(|(status, _)| {
        StatusCode::from_u16(*status)
            .map(status_is_transient)
            .unwrap_or(false)
    });
    let (_, first_reason) = &failures[0];

    Err(EtlError::BulkRejected {
        failed: failures.len(),
        total: expected,
        reason: first_reason.clone(),
        retryable,
    })
}
