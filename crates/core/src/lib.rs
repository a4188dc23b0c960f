//! `shelfsync-core`: identifiers and the domain error model shared by every
//! other crate in the workspace.
//!
//! Pure types only; nothing here performs I/O.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, ProductId, SubscriptionId};
