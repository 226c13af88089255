//! Offload HTTP API.
//!
//! Routes requests into the [`offload_pipeline::Pipeline`] and loads the
//! service [`Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ErrorDetail, ErrorResponse};
pub use server::{create_router, shutdown_signal, start_server, AppState, REQUEST_ID_HEADER};
