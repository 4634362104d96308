// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error taxonomy shared by injectors and host collaborators.

use thiserror::Error;

/// Errors surfaced by the injector lifecycle.
///
/// `Validation` guarantees the host was not touched. `Injection` means a
/// mutation was attempted and a self-undo has already been tried.
/// `Recovery` means the host may still be degraded.
#[derive(Debug, Error)]
pub enum FaultError {
    #[error("\"{arg}\" {reason}")]
    Validation { arg: &'static str, reason: String },
    #[error("inject error: {0}")]
    Injection(String),
    #[error("recover error: {0}")]
    Recovery(String),
    #[error("invalid fault args: {0}")]
    Args(String),
}

impl FaultError {
    pub fn validation(arg: &'static str, reason: impl Into<String>) -> Self {
        FaultError::Validation {
            arg,
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, FaultError::Validation { .. })
    }
}

pub type FaultResult<T> = Result<T, FaultError>;

/// Errors from the OS-facing collaborators (processes, traffic control).
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command `{program}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
}

pub type HostResult<T> = Result<T, HostError>;
