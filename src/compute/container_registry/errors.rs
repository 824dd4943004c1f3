use thiserror::Error;

use crate::cmd::docker::DockerError;
use crate::errors::ErrorKind;

#[derive(Error, Debug)]
pub enum ContainerRegistryError {
    #[error("Bad request: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error("Repository or image not found: {raw_error_message:?}")]
    NotFound { raw_error_message: String },

    #[error("Registry name conflict: {raw_error_message:?}")]
    Conflict { raw_error_message: String },

    #[error("Not supported by this registry: {raw_error_message:?}")]
    Unsupported { raw_error_message: String },

    #[error("Registry operation timed out: {raw_error_message:?}")]
    Timeout { raw_error_message: String },

    #[error("Registry error: {raw_error_message:?}")]
    Internal { raw_error_message: String },
}

impl ContainerRegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerRegistryError::BadRequest { .. } => ErrorKind::BadRequest,
            ContainerRegistryError::NotFound { .. } => ErrorKind::NotFound,
            ContainerRegistryError::Conflict { .. } => ErrorKind::Conflict,
            ContainerRegistryError::Unsupported { .. } => ErrorKind::Unsupported,
            ContainerRegistryError::Timeout { .. } => ErrorKind::Timeout,
            ContainerRegistryError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ContainerRegistryError::BadRequest {
            raw_error_message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ContainerRegistryError::NotFound {
            raw_error_message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ContainerRegistryError::Internal {
            raw_error_message: message.into(),
        }
    }
}

impl From<DockerError> for ContainerRegistryError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::Timeout { raw_error_message } => ContainerRegistryError::Timeout { raw_error_message },
            other => ContainerRegistryError::internal(other.to_string()),
        }
    }
}
