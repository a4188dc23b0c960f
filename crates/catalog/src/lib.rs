//! Catalog domain module.
//!
//! Product records keyed by SKU, the upsert rules the importer applies to
//! them, and CSV header/row normalisation. Deterministic logic only (no IO,
//! no HTTP, no storage).

pub mod product;
pub mod row;

pub use product::{ProductFields, ProductRecord, Sku, UpsertOutcome};
pub use row::{HeaderError, HeaderMap, ProductRow, RowError, parse_active};
