//! Request middleware.

pub mod rate_limit;
