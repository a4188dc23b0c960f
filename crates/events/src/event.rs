use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shelfsync_catalog::UpsertOutcome;

/// Catalog change events a webhook subscription can listen for.
///
/// Closed set; the wire names are the stable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogEvent {
    #[serde(rename = "product.created")]
    ProductCreated,
    #[serde(rename = "product.updated")]
    ProductUpdated,
    #[serde(rename = "product.deleted")]
    ProductDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event {0:?} (expected one of: product.created, product.updated, product.deleted)")]
pub struct UnknownEvent(pub String);

impl CatalogEvent {
    pub const ALL: [CatalogEvent; 3] = [
        CatalogEvent::ProductCreated,
        CatalogEvent::ProductUpdated,
        CatalogEvent::ProductDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogEvent::ProductCreated => "product.created",
            CatalogEvent::ProductUpdated => "product.updated",
            CatalogEvent::ProductDeleted => "product.deleted",
        }
    }
}

impl core::fmt::Display for CatalogEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

impl From<UpsertOutcome> for CatalogEvent {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => CatalogEvent::ProductCreated,
            UpsertOutcome::Updated => CatalogEvent::ProductUpdated,
        }
    }
}
