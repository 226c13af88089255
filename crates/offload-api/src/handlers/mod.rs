//! HTTP request handlers.
//!
//! Handlers are thin: they decode the request, call the pipeline, and turn
//! the outcome into JSON. Failures render through [`ApiError`] so every
//! error body has the same `{"error": {"code", "message"}}` shape.
//!
//! - `submit` - `POST /sync` and `POST /async`
//! - `requests` - `GET /requests` and `GET /requests/{id}`
//! - `health` - `GET /healthz`
//!
//! [`ApiError`]: crate::error::ApiError

pub mod health;
pub mod requests;
pub mod submit;

pub use health::health_check;
pub use requests::{get_request, list_requests};
pub use submit::{submit_async, submit_sync};
