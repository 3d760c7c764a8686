//! Crawl orchestration for sitecrawl.
//!
//! This crate ties page acquisition, content reduction and persistence
//! together:
//! - [`job`]: the per-crawl breadth-first state machine
//! - [`coordinator`]: the worker pool and its control loop
//! - [`store`]: persistence seams implemented by the libSQL storage

pub mod coordinator;
pub mod job;
pub mod store;

pub use coordinator::{Coordinator, JobTicket, PoolStats};
pub use job::{JobHandle, JobProgress, JobSpec};
pub use store::{PageStore, RunLogger};
