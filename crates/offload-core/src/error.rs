//! Error types and result handling for core operations.
//!
//! Covers persistence failures and lifecycle violations. Higher layers wrap
//! `CoreError` in their own taxonomies rather than exposing it to callers.

use thiserror::Error;

use crate::models::{TaskId, TaskStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change would move a task backwards or sideways.
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose update was refused
        id: TaskId,
        /// Status currently recorded
        from: TaskStatus,
        /// Status that was requested
        to: TaskStatus,
    },

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Short stable label used in logs and persisted error fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::InvalidInput(_) => "invalid_input",
        }
    }

    /// Whether repeating the same operation could succeed.
    ///
    /// Only backend failures qualify; lifecycle and constraint errors would
    /// fail again on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn only_backend_failures_are_transient() {
        assert!(CoreError::Database("database is locked".into()).is_transient());
        assert!(!CoreError::NotFound("task".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("dup".into()).is_transient());
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = CoreError::InvalidTransition {
            id: TaskId::new(),
            from: TaskStatus::Succeeded,
            to: TaskStatus::Running,
        };
        let message = err.to_string();
        assert!(message.contains("succeeded -> running"));
    }
}
