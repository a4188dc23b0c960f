//! Read side of webhook subscriptions plus last-delivery bookkeeping.
//!
//! Subscription CRUD belongs elsewhere; the dispatcher only lists, fetches and
//! stamps delivery results.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelfsync_core::SubscriptionId;
use shelfsync_events::CatalogEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub url: String,
    pub event: CatalogEvent,
    pub enabled: bool,
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    pub last_status_code: Option<u16>,
    pub last_latency_ms: Option<u64>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    pub fn new(url: impl Into<String>, event: CatalogEvent) -> Self {
        Self {
            id: SubscriptionId::new(),
            url: url.into(),
            event,
            enabled: true,
            secret: None,
            last_status_code: None,
            last_latency_ms: None,
            last_delivered_at: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Result of one delivery, stamped onto the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastDelivery {
    /// `None` when no HTTP response was obtained.
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionStoreError {
    #[error("subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("subscription store unavailable: {0}")]
    Unavailable(String),

    #[error("subscription storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Enabled subscriptions listening for `event`.
    async fn list_enabled(&self, event: CatalogEvent) -> Result<Vec<WebhookSubscription>, SubscriptionStoreError>;

    async fn get(&self, id: SubscriptionId) -> Result<Option<WebhookSubscription>, SubscriptionStoreError>;

    async fn record_last_delivery(
        &self,
        id: SubscriptionId,
        delivery: LastDelivery,
    ) -> Result<(), SubscriptionStoreError>;
}

/// In-memory subscriptions for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subs: RwLock<HashMap<SubscriptionId, WebhookSubscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sub: WebhookSubscription) -> SubscriptionId {
        let id = sub.id;
        if let Ok(mut subs) = self.subs.write() {
            subs.insert(id, sub);
        }
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<WebhookSubscription> {
        self.subs.write().ok().and_then(|mut subs| subs.remove(&id))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SubscriptionStoreError {
    SubscriptionStoreError::Storage("subscription lock poisoned".to_string())
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn list_enabled(&self, event: CatalogEvent) -> Result<Vec<WebhookSubscription>, SubscriptionStoreError> {
        let subs = self.subs.read().map_err(poisoned)?;
        let mut matching: Vec<_> = subs
            .values()
            .filter(|s| s.enabled && s.event == event)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.id);
        Ok(matching)
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<WebhookSubscription>, SubscriptionStoreError> {
        Ok(self.subs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn record_last_delivery(
        &self,
        id: SubscriptionId,
        delivery: LastDelivery,
    ) -> Result<(), SubscriptionStoreError> {
        let mut subs = self.subs.write().map_err(poisoned)?;
        let sub = subs.get_mut(&id).ok_or(SubscriptionStoreError::NotFound(id))?;
        sub.last_status_code = delivery.status_code;
        sub.last_latency_ms = Some(delivery.latency_ms);
        sub.last_delivered_at = Some(delivery.at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_enabled_matches_event_and_flag() {
        let store = InMemorySubscriptionStore::new();
        let created = store.insert(WebhookSubscription::new("http://a", CatalogEvent::ProductCreated));
        store.insert(WebhookSubscription::new("http://b", CatalogEvent::ProductUpdated));
        store.insert(WebhookSubscription::new("http://c", CatalogEvent::ProductCreated).with_enabled(false));

        let subs = store.list_enabled(CatalogEvent::ProductCreated).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, created);
    }

    #[tokio::test]
    async fn record_last_delivery_stamps_fields() {
        let store = InMemorySubscriptionStore::new();
        let id = store.insert(WebhookSubscription::new("http://a", CatalogEvent::ProductCreated));
        let at = Utc::now();

        store
            .record_last_delivery(
                id,
                LastDelivery {
                    status_code: Some(503),
                    latency_ms: 12,
                    at,
                },
            )
            .await
            .unwrap();

        let sub = store.get(id).await.unwrap().unwrap();
        assert_eq!(sub.last_status_code, Some(503));
        assert_eq!(sub.last_latency_ms, Some(12));
        assert_eq!(sub.last_delivered_at, Some(at));
    }

    #[tokio::test]
    async fn recording_on_unknown_subscription_is_not_found() {
        let store = InMemorySubscriptionStore::new();
        let err = store
            .record_last_delivery(
                SubscriptionId::new(),
                LastDelivery {
                    status_code: None,
                    latency_ms: 0,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionStoreError::NotFound(_)));
    }

    #[test]
    fn secret_is_never_serialised() {
        let sub = WebhookSubscription::new("http://a", CatalogEvent::ProductCreated).with_secret("k");
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["event"], "product.created");
    }
}
