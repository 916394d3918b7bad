use crate::config::ElasticsearchConfig;
use crate::error::EtlError;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Thin HTTP client for the Elasticsearch REST API.
#[derive(Clone)]
pub struct ElasticsearchService {
    http: Client,
    base_url: String,
}

impl ElasticsearchService {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self, EtlError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("movies-etl/0.1")
            .build()
            .map_err(EtlError::SearchHttp)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url_for(path))
    }

    async fn error_body(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "failed to read error body".to_string())
    }

    pub async fn index_exists(&self, index: &str) -> Result<bool, EtlError> {
        let response = self
            .request(Method::HEAD, &format!("/{index}"))
            .send()
            .await
            .map_err(EtlError::SearchHttp)?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => {
                let body = Self::error_body(response).await;
                Err(EtlError::search_status(other, body))
            }
        }
    }

    /// Create `index` with `body`. Returns `false` when another caller created it first.
    pub async fn create_index<T: Serialize + ?Sized>(
        &self,
        index: &str,
        body: &T,
    ) -> Result<bool, EtlError> {
        let response = self
            .request(Method::PUT, &format!("/{index}"))
            .json(body)
            .send()
            .await
            .map_err(EtlError::SearchHttp)?;

        let status = response.status();
        if status.is_success() {
            info!("elasticsearch: created index '{index}'");
            return Ok(true);
        }

        let body = Self::error_body(response).await;
        if index_already_exists(status, &body) {
            debug!("elasticsearch: index '{index}' already exists");
            return Ok(false);
        }

        Err(EtlError::search_status(status, body))
    }

    /// Submit an NDJSON bulk body, waiting until the changes are visible to search.
    pub async fn bulk(&self, index: &str, ndjson: Vec<u8>) -> Result<Vec<u8>, EtlError> {
        let response = self
            .request(Method::POST, &format!("/{index}/_bulk"))
            .query(&[("refresh", "wait_for")])
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .map_err(EtlError::SearchHttp)?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(EtlError::search_status(status, body));
        }

        let bytes = response.bytes().await.map_err(EtlError::SearchHttp)?;
        Ok(bytes.to_vec())
    }

    /// Number of documents currently searchable in `index`.
    pub async fn count(&self, index: &str) -> Result<u64, EtlError> {
        #[derive(serde::Deserialize)]
        struct CountResponse {
            count: u64,
        }

        let response = self
            .request(Method::GET, &format!("/{index}/_count"))
            .send()
            .await
            .map_err(EtlError::SearchHttp)?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            return Err(EtlError::search_status(status, body));
        }

        let parsed: CountResponse = response.json().await.map_err(EtlError::SearchHttp)?;
        Ok(parsed.count)
    }

    /// Fetch the stored source of one document, if present.
    pub async fn get_source(
        &self,
        index: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>, EtlError> {
        let response = self
            .request(Method::GET, &format!("/{index}/_source/{id}"))
            .send()
            .await
            .map_err(EtlError::SearchHttp)?;

        match response.status() {
            status if status.is_success() => {
                let value = response.json().await.map_err(EtlError::SearchHttp)?;
                Ok(Some(value))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => {
                let body = Self::error_body(response).await;
                Err(EtlError::search_status(other, body))
            }
        }
    }
}

/// Whether a failed index creation means another caller created the index first.
pub(crate) fn index_already_exists(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALREADY_EXISTS_BODY: &str = r#"{"error":{"root_cause":[{"type":"resource_already_exists_exception","reason":"index [movies/Xk3v9QJxR6eN0a1b2c3d4e] already exists","index_uuid":"Xk3v9QJxR6eN0a1b2c3d4e","index":"movies"}],"type":"resource_already_exists_exception","reason":"index [movies/Xk3v9QJxR6eN0a1b2c3d4e] already exists","index_uuid":"Xk3v9QJxR6eN0a1b2c3d4e","index":"movies"},"status":400}"#;

    #[test]
    fn duplicate_creation_is_recognised() {
        assert!(index_already_exists(StatusCode::BAD_REQUEST, ALREADY_EXISTS_BODY));
    }

    #[test]
    fn other_creation_failures_are_not_swallowed() {
        let mapping_error = r#"{"error":{"type":"mapper_parsing_exception","reason":"Failed to parse mapping"},"status":400}"#;
        assert!(!index_already_exists(StatusCode::BAD_REQUEST, mapping_error));
        assert!(!index_already_exists(StatusCode::SERVICE_UNAVAILABLE, ALREADY_EXISTS_BODY));
    }
}
