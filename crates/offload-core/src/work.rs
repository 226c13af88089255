//! CPU-bound work function executed for every task.
//!
//! The default workload is iterated SHA-256: hash the input bytes, then hash
//! each digest again until the iteration count is reached. Cost grows
//! linearly with iterations and the output is deterministic, which makes it a
//! stand-in for any fixed-cost computation.

use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Output of a completed computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutput {
    /// Lowercase hex result.
    pub result: String,
    /// Rounds actually performed.
    pub iterations: u32,
    /// Wall time of the computation.
    pub duration_ms: u64,
}

/// Failure raised by a workload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkError {
    /// Parameters outside what the workload accepts.
    #[error("invalid work parameters: {0}")]
    InvalidParameters(String),

    /// The computation itself failed.
    #[error("computation failed: {0}")]
    Failed(String),
}

/// A deterministic, blocking computation.
///
/// Implementations run on a blocking thread, never on the async executor.
pub trait Workload: Send + Sync + std::fmt::Debug + 'static {
    /// Runs the computation to completion.
    ///
    /// # Errors
    ///
    /// Returns `WorkError` when the computation cannot produce a result.
    fn run(&self, input: &str, iterations: u32) -> Result<WorkOutput, WorkError>;
}

/// Iterated SHA-256 over the UTF-8 bytes of the input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Workload;

impl Workload for Sha256Workload {
    fn run(&self, input: &str, iterations: u32) -> Result<WorkOutput, WorkError> {
        if iterations == 0 {
            return Err(WorkError::InvalidParameters("iterations must be at least 1".into()));
        }

        let started = Instant::now();
        let mut digest = Sha256::digest(input.as_bytes());
        for _ in 1..iterations {
            digest = Sha256::digest(digest);
        }

        Ok(WorkOutput {
            result: hex::encode(digest),
            iterations,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_round_is_plain_sha256() {
        let output = Sha256Workload.run("hello", 1).unwrap();
        assert_eq!(
            output.result,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(output.iterations, 1);
    }

    #[test]
    fn rounds_chain_digests() {
        let twice = Sha256Workload.run("hello", 2).unwrap();
        let manual = hex::encode(Sha256::digest(Sha256::digest(b"hello")));
        assert_eq!(twice.result, manual);
    }

    #[test]
    fn output_is_deterministic() {
        let a = Sha256Workload.run("payload", 1000).unwrap();
        let b = Sha256Workload.run("payload", 1000).unwrap();
        assert_eq!(a.result, b.result);
        assert_eq!(a.result.len(), 64);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let err = Sha256Workload.run("hello", 0).unwrap_err();
        assert!(matches!(err, WorkError::InvalidParameters(_)));
    }
}
