//! Error taxonomy for storage operations

use hyper::StatusCode;
use std::fmt;
use thiserror::Error;

/// Structured error synthesized from a response with status >= 300.
///
/// When the service answers with an XML body the fields come from it;
/// otherwise `code` is the canonical reason of the status line and the
/// request id is taken from the vendor request id header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub resource: String,
    pub request_id: String,
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND.as_u16()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({})",
            self.status, self.code, self.message, self.request_id
        )
    }
}

impl std::error::Error for ServiceError {}

/// Storage client errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("missing credentials: both access key id and secret access key are required")]
    MissingCredentials,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("XML decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the listing is not truncated")]
    NotTruncated,

    #[error("truncated listing did not advance past marker {0:?}")]
    StalledListing(String),

    #[error("ETag mismatch for part {part_number}: computed {expected}, server returned {actual}")]
    EtagMismatch {
        part_number: u32,
        expected: String,
        actual: String,
    },

    #[error("upload of {bucket}/{key} failed ({failed_parts} part(s) failed): {source}")]
    TransferFailed {
        bucket: String,
        key: String,
        failed_parts: usize,
        #[source]
        source: Box<StorageError>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// True for a 404 answer from the service.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Service(e) if e.is_not_found())
    }

    /// Status code of a protocol error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Service(e) => Some(e.status),
            _ => None,
        }
    }
}

impl From<quick_xml::DeError> for StorageError {
    fn from(err: quick_xml::DeError) -> Self {
        StorageError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        let err = ServiceError {
            status: 403,
            code: "AccessDenied".to_string(),
            message: "Access Denied".to_string(),
            resource: "/mybucket".to_string(),
            request_id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "403 AccessDenied Access Denied (abc123)");
    }

    #[test]
    fn test_not_found_classification() {
        let err = StorageError::from(ServiceError {
            status: 404,
            code: "NoSuchKey".to_string(),
            ..Default::default()
        });
        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(404));

        let err = StorageError::Transport("connection reset".to_string());
        assert!(!err.is_not_found());
        assert_eq!(err.status(), None);
    }
}
