//! Outbound webhook payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelfsync_catalog::ProductRecord;
use shelfsync_core::{ProductId, SubscriptionId};

use crate::event::CatalogEvent;

pub const TEST_MESSAGE: &str = "This is a test webhook payload";

/// Body POSTed to a subscriber endpoint: `{event, data, timestamp}`.
///
/// Test deliveries additionally carry `"test": true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub event: CatalogEvent,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub test: bool,
}

/// Product fields exposed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductData {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ProductRecord> for ProductData {
    fn from(record: &ProductRecord) -> Self {
        Self {
            id: record.id,
            sku: record.sku.as_str().to_string(),
            name: record.name.clone(),
            description: record.description.clone(),
            active: record.active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl DeliveryPayload {
    pub fn product(
        event: CatalogEvent,
        record: &ProductRecord,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event,
            data: serde_json::to_value(ProductData::from(record))?,
            timestamp,
            test: false,
        })
    }

    /// Synthetic payload for the diagnostic test path.
    pub fn test(event: CatalogEvent, subscription_id: SubscriptionId, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            data: serde_json::json!({
                "message": TEST_MESSAGE,
                "subscription_id": subscription_id,
            }),
            timestamp,
            test: true,
        }
    }

    /// Serialised body. Signatures are computed over exactly these bytes.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
