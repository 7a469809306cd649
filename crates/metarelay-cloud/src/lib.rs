//! Cloud client for the remote event store: paginated REST catch-up plus
//! the realtime websocket subscription.
//!
//! Transient failures (timeouts, 429, 5xx) are retried a bounded number of
//! times with exponential backoff before surfacing as
//! [`CloudError::Transient`]; auth rejections and other non-retryable 4xx
//! responses surface as [`CloudError::Fatal`] and shut the daemon down.

use std::time::Duration;

use async_trait::async_trait;

use metarelay_core::{CloudError, CloudEvents, Event, EventSubscription};

mod realtime;
mod retry;

use retry::{
    is_retryable_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: usize = 4;
const RETRY_BASE_DELAY_MS: u64 = 250;

#[derive(Clone)]
pub struct SupabaseCloudClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseCloudClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, CloudError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("metarelay"),
        );
        let api_key_value = reqwest::header::HeaderValue::from_str(api_key.trim())
            .map_err(|_| CloudError::Fatal("cloud key contains invalid header bytes".into()))?;
        headers.insert("apikey", api_key_value);
        let bearer = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| CloudError::Fatal("cloud key contains invalid header bytes".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| CloudError::Fatal(format!("failed to build http client: {error}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.base_url)
    }
}

#[async_trait]
impl CloudEvents for SupabaseCloudClient {
    async fn fetch_since(
        &self,
        repo: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, CloudError> {
        let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit };
        let query = [
            ("repo", format!("eq.{repo}")),
            ("id", format!("gt.{after_id}")),
            ("order", "id.asc".to_string()),
            ("limit", limit.to_string()),
        ];

        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = self.http.get(self.events_url()).query(&query).send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let events = response.json::<Vec<Event>>().await.map_err(|error| {
                            CloudError::Transient(format!("failed to decode events page: {error}"))
                        })?;
                        return Ok(events);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if is_retryable_status(status.as_u16()) {
                        if attempt < RETRY_MAX_ATTEMPTS {
                            tokio::time::sleep(retry_delay(
                                RETRY_BASE_DELAY_MS,
                                attempt,
                                retry_after,
                            ))
                            .await;
                            continue;
                        }
                        return Err(CloudError::Transient(format!(
                            "events fetch failed with status {}: {}",
                            status.as_u16(),
                            truncate_for_error(&body, 400)
                        )));
                    }
                    return Err(CloudError::Fatal(format!(
                        "events fetch rejected with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 400)
                    )));
                }
                Err(error) => {
                    if attempt < RETRY_MAX_ATTEMPTS && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(RETRY_BASE_DELAY_MS, attempt, None)).await;
                        continue;
                    }
                    return Err(CloudError::Transient(format!(
                        "events fetch request failed: {error}"
                    )));
                }
            }
        }
    }

    async fn subscribe(&self, repo: &str) -> Result<EventSubscription, CloudError> {
        realtime::open_subscription(&self.base_url, &self.api_key, repo).await
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn event_rows() -> serde_json::Value {
        json!([
            {"id": 6, "repo": "o/r", "event_type": "check_run", "action": "completed",
             "delivery_id": "d6", "created_at": "2026-05-01T10:00:00Z"},
            {"id": 7, "repo": "o/r", "event_type": "check_run", "action": "completed",
             "delivery_id": "d7", "created_at": "2026-05-01T10:00:05Z"}
        ])
    }

    #[tokio::test]
    async fn fetch_since_queries_the_catch_up_shape() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/events")
                    .query_param("repo", "eq.o/r")
                    .query_param("id", "gt.5")
                    .query_param("order", "id.asc")
                    .query_param("limit", "100")
                    .header("apikey", "test-key")
                    .header("authorization", "Bearer test-key");
                then.status(200).json_body(event_rows());
            })
            .await;

        let client = SupabaseCloudClient::new(&server.base_url(), "test-key").expect("client");
        let events = client.fetch_since("o/r", 5, 100).await.expect("fetch");

        mock.assert_async().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 6);
        assert_eq!(events[1].id, 7);
    }

    #[tokio::test]
    async fn fetch_since_retries_server_errors() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/events");
                then.status(500).body("boom");
            })
            .await;

        let client = SupabaseCloudClient::new(&server.base_url(), "test-key").expect("client");
        let result = client.fetch_since("o/r", 0, 10).await;

        assert!(matches!(result, Err(CloudError::Transient(_))));
        assert_eq!(failing.hits_async().await, RETRY_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn fetch_since_treats_auth_rejection_as_fatal() {
        let server = MockServer::start_async().await;
        let rejecting = server
            .mock_async(|when, then| {
                when.method(GET).path("/events");
                then.status(401).body("bad key");
            })
            .await;

        let client = SupabaseCloudClient::new(&server.base_url(), "wrong-key").expect("client");
        let result = client.fetch_since("o/r", 0, 10).await;

        assert!(matches!(result, Err(CloudError::Fatal(_))));
        assert_eq!(rejecting.hits_async().await, 1);
    }

    #[tokio::test]
    async fn fetch_since_empty_page() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/events");
                then.status(200).json_body(json!([]));
            })
            .await;

        let client = SupabaseCloudClient::new(&server.base_url(), "test-key").expect("client");
        let events = client.fetch_since("o/r", 99, 100).await.expect("fetch");
        assert!(events.is_empty());
    }
}
