//! Webhook dispatch engine.
//!
//! ## Delivery contract
//!
//! - At-least-once. Consumers dedupe on the `X-Webhook-Delivery` header, which
//!   stays the same across retries of one delivery
//! - Bodies are signed with HMAC-SHA256 when the subscription has a secret
//! - 2xx succeeds, 5xx/408/429 and transport failures retry with backoff,
//!   anything else is permanent
//! - The subscription keeps the last status code and latency of each finished
//!   delivery (success, permanent failure or exhausted retries)

pub mod client;
pub mod dispatcher;
pub mod postgres;
pub mod retry;
pub mod signing;
pub mod subscription;

pub use client::{
    DeliveryError, DeliveryOutcome, DeliveryResponse, HttpWebhookSender, OutboundRequest, USER_AGENT,
    WebhookSender, classify,
};
pub use dispatcher::{DeliveryReport, DeliveryTask, DispatchError, EmitSummary, WebhookDispatcher};
pub use postgres::PostgresSubscriptionStore;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use signing::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, sign_payload, verify_signature};
pub use subscription::{
    InMemorySubscriptionStore, LastDelivery, SubscriptionStore, SubscriptionStoreError, WebhookSubscription,
};
