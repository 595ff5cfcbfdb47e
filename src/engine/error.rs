use thiserror::Error;
use ulid::Ulid;

use crate::directory::DirectoryError;
use crate::model::Status;

/// Stable error categories. Clients branch on these: retry on `Conflict`,
/// show the message on `BadRequest`, treat `NotFound` as a missing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input, business-rule violation, unauthorized actor.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Lost a race against a concurrent decision or approval; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::BadRequest,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The bare message, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            EngineError::Validation(m)
            | EngineError::NotFound(m)
            | EngineError::Conflict(m)
            | EngineError::Internal(m) => m,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn user_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("user {id}"))
    }

    pub(crate) fn item_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("item {id}"))
    }

    pub(crate) fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("reservation {id}"))
    }
}

/// Failures reported by a `ReservationStore`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("reservation {0} not found")]
    NotFound(Ulid),
    #[error("reservation {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: Ulid,
        expected: Status,
        actual: Status,
    },
    #[error("window overlaps approved reservation {0}")]
    Overlap(Ulid),
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("journal error: {0}")]
    Journal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::reservation_not_found(id),
            StoreError::StatusMismatch { actual, .. } => {
                EngineError::Conflict(format!("reservation already decided: {actual}"))
            }
            StoreError::Overlap(id) => {
                EngineError::Conflict(format!("window overlaps approved reservation {id}"))
            }
            e @ StoreError::IllegalTransition { .. } => EngineError::Internal(e.to_string()),
            StoreError::Journal(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<DirectoryError> for EngineError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Invalid(msg) => EngineError::Validation(msg),
            DirectoryError::NotFound(msg) => EngineError::NotFound(msg),
            DirectoryError::Duplicate(msg) => EngineError::Conflict(msg),
            DirectoryError::Journal(msg) | DirectoryError::Unavailable(msg) => {
                EngineError::Internal(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_per_variant() {
        assert_eq!(EngineError::validation("x").kind(), ErrorKind::BadRequest);
        assert_eq!(EngineError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(EngineError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn status_mismatch_maps_to_conflict() {
        let id = Ulid::new();
        let err: EngineError = StoreError::StatusMismatch {
            id,
            expected: Status::Waiting,
            actual: Status::Approved,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.message(), "reservation already decided: APPROVED");
    }

    #[test]
    fn journal_failure_is_internal() {
        let err: EngineError = StoreError::Journal("disk full".into()).into();
        assert_eq!(err, EngineError::Internal("disk full".into()));
    }
}
