//! A caching and scheduling layer for concordance searches.
//!
//! Requests are turned into jobs by the [`SearchService`]. Requests that share the relevant
//! part of their parameters share one job through the [`SearchCache`], which also bounds the
//! resources spent on cached results and keeps runaway jobs in check.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod cache;
mod computations;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod logging;
pub mod results;
pub mod service;
pub mod utils;

#[cfg(test)]
mod testutils;

pub use backend::{ExecutionControl, MemoryBackend, SearchBackend};
pub use cache::{CacheStatus, SearchCache};
pub use error::JobError;
pub use fingerprint::{Fingerprint, JobKind, SearchParameters};
pub use job::{JobHandle, JobInfo, JobStatus};
pub use service::SearchService;
