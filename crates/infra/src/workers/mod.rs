//! Background workers draining the task queue lanes.

pub mod pool;

pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
