//! SSRF-safe callback delivery with retry and a persisted attempt trace.
//!
//! When an async task finishes, its result is posted to the caller's URL.
//! The URL is untrusted input, so every attempt starts by re-validating it
//! (see [`url_guard`]) and the HTTP client only ever connects to addresses
//! that passed that check.
//!
//! # Delivery lifecycle
//!
//! 1. **Re-validate** - resolve the host again and check every address
//! 2. **Send** - POST the JSON payload, redirects disabled, bounded timeout
//! 3. **Record** - append the attempt to the task's trace
//! 4. **Back off** - wait with exponential backoff and jitter, then repeat
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use offload_core::{RealClock, SqliteTaskStore};
//! use offload_delivery::{
//!     CallbackDelivery, ClientConfig, DeliveryClient, GuardConfig, RetryPolicy, UrlGuard,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteTaskStore::connect("sqlite://offload.db", 4).await?);
//! let engine = CallbackDelivery::new(
//!     store,
//!     UrlGuard::new(GuardConfig::default()),
//!     DeliveryClient::new(ClientConfig::default())?,
//!     RetryPolicy::default(),
//!     Arc::new(RealClock::new()),
//! );
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod retry;
pub mod url_guard;

pub use client::{CallbackPayload, ClientConfig, DeliveryClient, DeliveryResponse};
pub use engine::{CallbackDelivery, DeliveryJob, DeliveryOutcome, DeliveryStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use url_guard::{
    GuardConfig, Resolver, StaticResolver, SystemResolver, UnsafeReason, UrlGuard, VettedUrl,
};

/// Default per-attempt timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
