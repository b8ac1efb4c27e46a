//! Custom error types for the daemon.
//!
//! This module defines the primary error type, `HealthdError`, used by the configuration
//! layer, the monitor tasks and the daemon supervisor. Collaborator traits in
//! [`crate::hardware::capabilities`] keep returning `anyhow::Result`; a failure only becomes a
//! `HealthdError` when it has to terminate a task or abort startup.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches in
//!   the configuration document.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration (negative
//!   hysteresis, zero window size, ...). Caught during the validation step.
//! - **`Io`**: Wraps `std::io::Error` from the file-backed collaborators.
//! - **`AcquisitionExhausted`**: A monitor gave up after its bounded retry count. Fatal to
//!   that monitor only.
//! - **`Hook`** / **`Store`**: A side-effecting hook or the persisted key-value store failed.
//!   These are logged by the caller and never cross a task boundary.

use thiserror::Error;

/// Convenience alias for results using the daemon error type.
pub type HealthdResult<T> = std::result::Result<T, HealthdError>;

/// Errors surfaced by the health daemon.
#[derive(Error, Debug)]
pub enum HealthdError {
    /// The configuration document could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A monitor exceeded its acquisition retry budget.
    #[error("{monitor}: metric acquisition failed {attempts} times in a row")]
    AcquisitionExhausted {
        /// Monitor that stopped
        monitor: String,
        /// Consecutive failed attempts
        attempts: u32,
    },

    /// A reaction or recovery hook failed.
    #[error("{action} failed: {message}")]
    Hook {
        /// Hook name
        action: &'static str,
        /// Underlying failure
        message: String,
    },

    /// The persisted key-value store failed.
    #[error("kv store error on '{key}': {message}")]
    Store {
        /// Key being accessed
        key: String,
        /// Underlying failure
        message: String,
    },

    /// A monitor task panicked or was aborted.
    #[error("monitor task failed: {0}")]
    TaskJoin(String),
}

impl From<figment::Error> for HealthdError {
    fn from(value: figment::Error) -> Self {
        HealthdError::Config(Box::new(value))
    }
}

impl From<tokio::task::JoinError> for HealthdError {
    fn from(value: tokio::task::JoinError) -> Self {
        HealthdError::TaskJoin(value.to_string())
    }
}

impl HealthdError {
    /// Wrap the failure of recovery hook `action`.
    pub fn hook(action: &'static str, source: &anyhow::Error) -> Self {
        HealthdError::Hook {
            action,
            message: format!("{source:#}"),
        }
    }

    /// Whether this error must stop the process.
    ///
    /// Only a configuration that loaded but failed validation is fatal. A document that cannot
    /// be read or parsed falls back to the defaults; every other error is fatal to at most one
    /// monitor task.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, HealthdError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_exhausted_names_the_monitor() {
        let err = HealthdError::AcquisitionExhausted {
            monitor: "BMC CPU utilization".into(),
            attempts: 11,
        };
        let msg = err.to_string();
        assert!(msg.contains("BMC CPU utilization"));
        assert!(msg.contains("11"));
        assert!(!err.is_fatal_to_process());
    }

    #[test]
    fn validation_errors_abort_startup() {
        let err = HealthdError::Configuration("window_size must be at least 1".into());
        assert!(err.is_fatal_to_process());
        assert!(err.to_string().starts_with("Configuration validation error"));
    }

    #[test]
    fn hook_errors_name_the_hook() {
        let err = HealthdError::hook("hardware_reset", &anyhow::anyhow!("bic-util exited with 1"));
        assert_eq!(err.to_string(), "hardware_reset failed: bic-util exited with 1");
        assert!(!err.is_fatal_to_process());
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read() -> HealthdResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(())
        }
        assert!(matches!(read(), Err(HealthdError::Io(_))));
    }
}
