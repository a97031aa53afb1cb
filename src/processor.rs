//! Processor orchestration covering the pass scheduler, lifecycle management,
//! retry backoff, and worker pool coordination.

pub mod backoff;
pub(crate) mod lifecycle;
pub mod scheduler;
pub mod worker_pool;
