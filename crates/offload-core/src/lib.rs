//! Core domain models, persistence contract, and work function.
//!
//! Provides strongly-typed task primitives, the `TaskStore` persistence
//! interface with SQLite and in-memory implementations, the clock
//! abstraction, and the CPU-bound workload executed by workers. All other
//! offload crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;
pub mod work;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, CallbackStatus, DeliveryAttempt, Page, StatusUpdate, Task, TaskFilter, TaskId,
    TaskMode, TaskStatus,
};
pub use storage::{
    memory::MemoryTaskStore, sqlite::SqliteTaskStore, with_write_retries, TaskStore, WRITE_ATTEMPTS,
};
pub use time::{Clock, RealClock, TestClock};
pub use work::{Sha256Workload, WorkError, WorkOutput, Workload};
