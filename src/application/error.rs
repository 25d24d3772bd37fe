use std::time::Duration;

use thiserror::Error;

use crate::{
    application::{
        ports::EngineError,
        repos::{CoordinationError, RepoError},
    },
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Errors surfaced by the library's public operations.
///
/// Capacity variants always carry a retry delay; every variant maps to a
/// stable code so callers can tell "try again" from "try again in N seconds".
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Input(#[from] DomainError),
    #[error("geometry computation failed")]
    ComputationFailed(#[source] EngineError),
    #[error("book storage failed")]
    Persistence(#[from] RepoError),
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("daily generation budget exhausted; retry after {retry_after:?}")]
    BudgetExceeded { retry_after: Duration },
    #[error("generation already in progress; retry after {retry_after:?}")]
    LockUnavailable { retry_after: Duration },
    #[error("coordination store unavailable")]
    CoordinationUnavailable {
        #[source]
        source: CoordinationError,
        retry_after: Duration,
    },
}

impl LibraryError {
    pub fn code(&self) -> &'static str {
        match self {
            LibraryError::Input(err) => err.code(),
            LibraryError::ComputationFailed(_) => "computation_failed",
            LibraryError::Persistence(_) => "persistence_error",
            LibraryError::RateLimited { .. } => "rate_limited",
            LibraryError::BudgetExceeded { .. } => "budget_exceeded",
            LibraryError::LockUnavailable { .. } => "lock_unavailable",
            LibraryError::CoordinationUnavailable { .. } => "coordination_unavailable",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LibraryError::RateLimited { retry_after }
            | LibraryError::BudgetExceeded { retry_after }
            | LibraryError::LockUnavailable { retry_after }
            | LibraryError::CoordinationUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whole seconds a caller should wait, never zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(whole_seconds)
    }

    pub fn is_caller_error(&self) -> bool {
        matches!(self, LibraryError::Input(_))
    }
}

pub(crate) fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Process-level failures reported by the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
