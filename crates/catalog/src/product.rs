use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelfsync_core::{DomainError, DomainResult, ProductId};

/// Stock keeping unit: the natural key of a product.
///
/// Stored as the trimmed input; equality for upsert purposes is
/// case-insensitive and goes through [`Sku::key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(String);

impl Sku {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Uniqueness key (`lower(sku)`).
    pub fn key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl core::fmt::Display for Sku {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable fields carried by an import row.
///
/// `active: None` means the row did not say, so an existing record keeps its
/// flag and a new record starts active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    pub description: Option<String>,
    pub active: Option<bool>,
}

impl ProductFields {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            active: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }
}

/// Whether an upsert created a new record or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// A catalog product as the import path sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub sku: Sku,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductRecord {
    /// Build a new record from an import row. Defaults to active.
    pub fn create(sku: Sku, fields: ProductFields, now: DateTime<Utc>) -> Self {
        Self {
            id: ProductId::new(),
            sku,
            name: fields.name,
            description: fields.description,
            active: fields.active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite name and description; `active` only when the row carries it.
    ///
    /// The stored SKU spelling follows the latest row.
    pub fn apply(&mut self, sku: Sku, fields: ProductFields, now: DateTime<Utc>) {
        self.sku = sku;
        self.name = fields.name;
        self.description = fields.description;
        if let Some(active) = fields.active {
            self.active = active;
        }
        self.updated_at = now;
    }
}
