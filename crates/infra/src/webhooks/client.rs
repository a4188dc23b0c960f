//! Outbound HTTP for webhook deliveries.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use shelfsync_events::CatalogEvent;

use super::signing::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};

pub const USER_AGENT: &str = concat!("shelfsync-webhooks/", env!("CARGO_PKG_VERSION"));

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::RetryableFailure => "retryable_failure",
            DeliveryOutcome::PermanentFailure => "permanent_failure",
        }
    }
}

/// 2xx succeeds; 5xx, 408 and 429 may succeed later; everything else won't.
pub fn classify(status_code: u16) -> DeliveryOutcome {
    match status_code {
        200..=299 => DeliveryOutcome::Success,
        408 | 429 | 500..=599 => DeliveryOutcome::RetryableFailure,
        _ => DeliveryOutcome::PermanentFailure,
    }
}

/// A fully prepared POST. `body` is exactly what was signed.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub event: CatalogEvent,
    pub delivery_id: Uuid,
    pub body: Vec<u8>,
    pub signature: Option<String>,
}

/// Any HTTP response, whatever its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub latency_ms: u64,
}

impl DeliveryResponse {
    pub fn outcome(&self) -> DeliveryOutcome {
        classify(self.status_code)
    }
}

/// No HTTP response was obtained.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out after {latency_ms}ms")]
    Timeout { latency_ms: u64 },

    #[error("network error: {message}")]
    Network { message: String, latency_ms: u64 },

    /// The request could not be built (bad URL and the like).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http client setup failed: {0}")]
    Client(String),
}

impl DeliveryError {
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            DeliveryError::Timeout { .. } | DeliveryError::Network { .. } => DeliveryOutcome::RetryableFailure,
            DeliveryError::InvalidRequest(_) | DeliveryError::Client(_) => DeliveryOutcome::PermanentFailure,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        match self {
            DeliveryError::Timeout { latency_ms } | DeliveryError::Network { latency_ms, .. } => *latency_ms,
            DeliveryError::InvalidRequest(_) | DeliveryError::Client(_) => 0,
        }
    }
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<DeliveryResponse, DeliveryError>;
}

/// reqwest-backed sender with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, request: &OutboundRequest) -> Result<DeliveryResponse, DeliveryError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, request.event.as_str())
            .header(DELIVERY_HEADER, request.delivery_id.to_string())
            .body(request.body.clone());
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let started = Instant::now();
        match builder.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let latency_ms = elapsed_ms(started);
                debug!(
                    url = %request.url,
                    delivery_id = %request.delivery_id,
                    status_code,
                    latency_ms,
                    "webhook response"
                );
                Ok(DeliveryResponse { status_code, latency_ms })
            }
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout {
                latency_ms: elapsed_ms(started),
            }),
            Err(e) if e.is_builder() => Err(DeliveryError::InvalidRequest(e.to_string())),
            Err(e) => Err(DeliveryError::Network {
                message: e.to_string(),
                latency_ms: elapsed_ms(started),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::signing::{sign_payload, verify_signature};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classification_table() {
        assert_eq!(classify(200), DeliveryOutcome::Success);
        assert_eq!(classify(204), DeliveryOutcome::Success);
        assert_eq!(classify(500), DeliveryOutcome::RetryableFailure);
        assert_eq!(classify(503), DeliveryOutcome::RetryableFailure);
        assert_eq!(classify(408), DeliveryOutcome::RetryableFailure);
        assert_eq!(classify(429), DeliveryOutcome::RetryableFailure);
        assert_eq!(classify(400), DeliveryOutcome::PermanentFailure);
        assert_eq!(classify(404), DeliveryOutcome::PermanentFailure);
        assert_eq!(classify(302), DeliveryOutcome::PermanentFailure);
    }

    fn request(url: String, signature: Option<String>) -> OutboundRequest {
        OutboundRequest {
            url,
            event: CatalogEvent::ProductCreated,
            delivery_id: Uuid::now_v7(),
            body: br#"{"event":"product.created"}"#.to_vec(),
            signature,
        }
    }

    #[tokio::test]
    async fn sends_signed_body_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header(EVENT_HEADER, "product.created"))
            .and(header_exists(DELIVERY_HEADER))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let body = br#"{"event":"product.created"}"#;
        let sender = HttpWebhookSender::new(Duration::from_secs(5)).unwrap();
        let response = sender
            .send(&request(format!("{}/hook", server.uri()), Some(sign_payload("k", body))))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.outcome(), DeliveryOutcome::Success);

        let received = server.received_requests().await.unwrap();
        let sig = received[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(verify_signature("k", &received[0].body, sig));
        assert_eq!(received[0].body, body);
    }

    #[tokio::test]
    async fn unsigned_request_has_no_signature_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let sender = HttpWebhookSender::new(Duration::from_secs(5)).unwrap();
        let response = sender.send(&request(server.uri(), None)).await.unwrap();
        assert_eq!(response.outcome(), DeliveryOutcome::PermanentFailure);

        let received = server.received_requests().await.unwrap();
        assert!(received[0].headers.get(SIGNATURE_HEADER).is_none());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let sender = HttpWebhookSender::new(Duration::from_millis(50)).unwrap();
        let err = sender.send(&request(server.uri(), None)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { .. }));
        assert_eq!(err.outcome(), DeliveryOutcome::RetryableFailure);
    }
}
