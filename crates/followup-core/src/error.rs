//! Error types shared across the Followup crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FollowupError>;

#[derive(Debug, Error)]
pub enum FollowupError {
    /// The callable cannot be reduced to a persisted descriptor (closures, blank names).
    #[error("Callback not encodable: {0}")]
    NotEncodable(String),

    /// A stored descriptor names a function or class that is no longer registered.
    #[error("Unresolvable callback symbol: {0}")]
    UnresolvableSymbol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Row was modified by another writer since it was loaded.
    #[error("Concurrent write on {entity} {id} (expected version {expected}, found {actual})")]
    ConcurrentWrite {
        entity: &'static str,
        id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FollowupError {
    /// Whether the failure came from another writer winning a race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FollowupError::ConcurrentWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = FollowupError::ConcurrentWrite {
            entity: "email_queue",
            id: 7,
            expected: 2,
            actual: 3,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "Concurrent write on email_queue 7 (expected version 2, found 3)"
        );
        assert!(!FollowupError::NotFound("x".into()).is_conflict());
    }
}
