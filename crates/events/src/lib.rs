//! Integration events: the catalog change events subscribers can listen for
//! and the JSON payloads delivered to their endpoints.

pub mod event;
pub mod payload;

pub use event::{CatalogEvent, UnknownEvent};
pub use payload::{DeliveryPayload, ProductData, TEST_MESSAGE};
