// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Instant;
use tracing::{debug, error};

use crate::endpoint::TopicEndpoint;
use crate::errors::{ConfigError, DeliveryError};
use crate::event::Event;
use crate::http_utils::build_client;

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Destination for batches of events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Ships one batch in a single attempt. The batch is never retried by the caller.
    async fn deliver(&self, batch: &[Event]) -> Result<(), DeliveryError>;
}

pub struct FlusherConfig {
    pub endpoint: TopicEndpoint,
    pub headers: HeaderMap,
    pub https_proxy: Option<String>,
    pub timeout: std::time::Duration,
}

/// Posts batches as a JSON array to an Event Grid topic endpoint.
pub struct Flusher {
    endpoint: TopicEndpoint,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl Flusher {
    pub fn new(config: FlusherConfig) -> Result<Self, ConfigError> {
        let client = build_client(config.https_proxy.as_deref(), config.timeout)
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let mut headers = config.headers;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));

        Ok(Flusher {
            endpoint: config.endpoint,
            headers,
            client,
        })
    }

    pub fn endpoint(&self) -> &TopicEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for Flusher {
    async fn deliver(&self, batch: &[Event]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(batch).map_err(DeliveryError::Serialize)?;
        debug!("Flushing {} events ({} bytes)", batch.len(), body.len());

        let start = Instant::now();
        let resp = self
            .client
            .post(self.endpoint.url().clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .inspect_err(|e| error!("Error sending batch: {e:?}"))?;

        let status = resp.status();
        let elapsed = start.elapsed();
        if status.is_success() {
            debug!(
                "Successfully flushed {} events in {} ms",
                batch.len(),
                elapsed.as_millis()
            );
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        error!("{status}: Failed to push {} events: {body:?}", batch.len());
        Err(DeliveryError::Status { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::DEFAULT_SCHEME;
    use mockito::{Matcher, Server};
    use crate::event::RawJson;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn flusher(url: &str, headers: HeaderMap) -> Flusher {
        Flusher::new(FlusherConfig {
            endpoint: TopicEndpoint::new(url, DEFAULT_SCHEME).expect("invalid endpoint"),
            headers,
            https_proxy: None,
            timeout: Duration::from_secs(5),
        })
        .expect("failed to create flusher")
    }

    fn event() -> Event {
        Event {
            id: "id-1".to_string(),
            topic: String::new(),
            subject: "s".to_string(),
            data: RawJson::new(r#"{"k": "v"}"#).expect("invalid json"),
            event_type: "t".to_string(),
            event_time: "2020-12-18T16:43:55Z".to_string(),
            data_version: String::new(),
        }
    }

    #[tokio::test]
    async fn test_deliver_posts_json_array() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Regex(r"^/api/events".to_string()))
            .match_header("content-type", CONTENT_TYPE_JSON)
            .match_header("x-custom", "1")
            .match_body(r#"[{"id":"id-1","subject":"s","data":{"k": "v"},"eventType":"t","eventTime":"2020-12-18T16:43:55Z"}]"#)
            .with_status(200)
            .create_async()
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("1"));
        // a user supplied content type is always replaced
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        flusher(&server.url(), headers)
            .deliver(&[event()])
            .await
            .expect("delivery failed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deliver_accepts_any_success_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .with_status(202)
            .create_async()
            .await;

        assert!(flusher(&server.url(), HeaderMap::new())
            .deliver(&[event()])
            .await
            .is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_deliver_rejected() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let err = flusher(&server.url(), HeaderMap::new())
            .deliver(&[event()])
            .await
            .expect_err("delivery should fail");
        assert!(matches!(
            err,
            DeliveryError::Status { status, ref body } if status == 400 && body == "bad request"
        ));
        assert!(logs_contain("Failed to push 1 events"));
        mock.assert_async().await;
    }
}
