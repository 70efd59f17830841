//! Error types shared across the knowledge, memory and routing layers

use std::time::Duration;
use thiserror::Error;

/// Input rejected at a component boundary. The target store is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f32),
    #[error("question text is empty")]
    EmptyQuestion,
    #[error("answer text is empty")]
    EmptyAnswer,
    #[error("message content is empty")]
    EmptyContent,
    #[error("metadata has {count} keys, at most {max} are allowed")]
    MetadataTooLarge { count: usize, max: usize },
    #[error("user id is empty")]
    EmptyUserId,
}

/// Failure reading from or writing to durable storage.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        Self(format!("connection pool: {}", e))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("serialization: {}", e))
    }
}

/// A persisted record that exists but cannot be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("corrupted record for {owner}: {detail}")]
pub struct DataIntegrityError {
    pub owner: String,
    pub detail: String,
}

/// Error returned by a repository load: either the medium failed or the data is bad.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Integrity(#[from] DataIntegrityError),
}

/// Failure modes of the external answer service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("answer service rejected credentials: {0}")]
    Auth(String),
    #[error("answer service quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("answer service timed out after {0:?}")]
    Timeout(Duration),
    #[error("answer service unreachable: {0}")]
    Network(String),
    #[error("answer service returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Short machine-friendly label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Auth(_) => "auth",
            ServiceError::QuotaExceeded(_) => "quota",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Network(_) => "network",
            ServiceError::InvalidResponse(_) => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KnowledgeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("knowledge store could not be persisted after {attempts} attempts: {source}")]
    Storage {
        attempts: u32,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown or closed session: {0}")]
    UnknownSession(String),
    #[error("conversation memory for {user_id} not written after {attempts} attempts: {source}")]
    Write {
        user_id: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no answer available for '{query}': {cause}")]
    NotAvailable {
        query: String,
        #[source]
        cause: ServiceError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_kinds_are_distinct() {
        let kinds = [
            ServiceError::Auth("x".into()).kind(),
            ServiceError::QuotaExceeded("x".into()).kind(),
            ServiceError::Timeout(Duration::from_secs(1)).kind(),
            ServiceError::Network("x".into()).kind(),
            ServiceError::InvalidResponse("x".into()).kind(),
        ];
        let mut unique = kinds.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn test_load_error_wraps_integrity() {
        let err: LoadError = DataIntegrityError {
            owner: "alice".into(),
            detail: "bad json".into(),
        }
        .into();
        assert!(matches!(err, LoadError::Integrity(_)));
        assert!(err.to_string().contains("alice"));
    }
}
