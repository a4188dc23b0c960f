//! HTTP surface over the import and webhook pipeline.

pub mod app;
