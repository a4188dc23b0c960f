//! Infrastructure layer: stores, queue lanes, the import worker and the
//! webhook dispatch engine.

pub mod catalog;
pub mod config;
pub mod db;
pub mod import;
pub mod intake;
pub mod jobs;
pub mod queue;
pub mod staging;
pub mod webhooks;
pub mod workers;
