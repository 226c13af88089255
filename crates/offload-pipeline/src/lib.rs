//! Asynchronous request-processing pipeline.
//!
//! Async submissions pass admission checks, are persisted as `pending`, and
//! wait in a bounded FIFO queue. A fixed pool of workers runs the CPU-bound
//! work off the request path, records the result, and hands each finished
//! task to the callback delivery engine. Sync submissions skip all of that
//! and compute inline.
//!
//! ```text
//!  submit_async ──▶ validate ──▶ UrlGuard ──▶ TaskQueue ──▶ workers ──▶ CallbackDelivery
//!                                    │            │ full
//!                                    ▼            ▼
//!                              SsrfRejected   Backpressure
//! ```
//!
//! The per-client [`SlidingWindowLimiter`] sits in front of both paths in
//! the routing layer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
mod worker;
mod worker_pool;

pub use error::{PipelineError, Result};
pub use pipeline::{
    Accepted, Health, Pipeline, PipelineBuilder, PipelineConfig, ShutdownReport, SyncResult,
    ABANDONED_BEFORE_EXECUTION, INTERRUPTED_BEFORE_COMPLETION,
};
pub use queue::TaskQueue;
pub use rate_limit::{Admission, RateLimitConfig, SlidingWindowLimiter};
