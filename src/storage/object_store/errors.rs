use thiserror::Error;

use crate::errors::ErrorKind;
use crate::storage::object_store::kv::KvError;

#[derive(Clone, Error, Debug, PartialEq)]
pub enum ObjectStoreError {
    #[error("Bad request: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error("Not found: {raw_error_message:?}")]
    NotFound { raw_error_message: String },

    #[error("Conflict: {raw_error_message:?}")]
    Conflict { raw_error_message: String },

    #[error("Precondition failed: {raw_error_message:?}")]
    PreconditionFailed { raw_error_message: String },

    #[error("Not modified")]
    NotModified,

    #[error("Not supported by this provider: {raw_error_message:?}")]
    Unsupported { raw_error_message: String },

    #[error("Operation timed out: {raw_error_message:?}")]
    Timeout { raw_error_message: String },

    #[error("Provider error: {raw_error_message:?}")]
    Internal { raw_error_message: String },
}

impl ObjectStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ObjectStoreError::BadRequest { .. } => ErrorKind::BadRequest,
            ObjectStoreError::NotFound { .. } => ErrorKind::NotFound,
            ObjectStoreError::Conflict { .. } => ErrorKind::Conflict,
            ObjectStoreError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            ObjectStoreError::NotModified => ErrorKind::NotModified,
            ObjectStoreError::Unsupported { .. } => ErrorKind::Unsupported,
            ObjectStoreError::Timeout { .. } => ErrorKind::Timeout,
            ObjectStoreError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ObjectStoreError::BadRequest {
            raw_error_message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ObjectStoreError::NotFound {
            raw_error_message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ObjectStoreError::Conflict {
            raw_error_message: message.into(),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        ObjectStoreError::PreconditionFailed {
            raw_error_message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ObjectStoreError::Internal {
            raw_error_message: message.into(),
        }
    }
}

impl From<KvError> for ObjectStoreError {
    fn from(e: KvError) -> Self {
        ObjectStoreError::internal(e.to_string())
    }
}
