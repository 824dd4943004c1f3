use enum_dispatch::enum_dispatch;
use thiserror::Error;

use crate::cmd::docker::DockerError;
use crate::errors::ErrorKind;
use crate::model::Response;
use crate::model::image::{BuildConfig, ContainerItem, ImageItem, PrepareConfig, RunConfig, SourceItem};

pub mod docker_local;

#[derive(Error, Debug)]
pub enum ContainerizerError {
    #[error("Bad request: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error("Source or container not found: {raw_error_message:?}")]
    NotFound { raw_error_message: String },

    #[error("Build timed out: {raw_error_message:?}")]
    Timeout { raw_error_message: String },

    #[error("Containerizer error: {raw_error_message:?}")]
    Internal { raw_error_message: String },
}

impl ContainerizerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerizerError::BadRequest { .. } => ErrorKind::BadRequest,
            ContainerizerError::NotFound { .. } => ErrorKind::NotFound,
            ContainerizerError::Timeout { .. } => ErrorKind::Timeout,
            ContainerizerError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ContainerizerError::BadRequest {
            raw_error_message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ContainerizerError::Internal {
            raw_error_message: message.into(),
        }
    }
}

impl From<DockerError> for ContainerizerError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::Timeout { raw_error_message } => ContainerizerError::Timeout { raw_error_message },
            other => ContainerizerError::internal(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    DockerLocal,
}

/// Source folder to OCI image pipeline.
#[enum_dispatch]
pub trait ContainerizerProvider {
    fn kind(&self) -> Kind;

    /// Turn a handle (a source folder to containerize) into a ready build
    /// context, synthesizing a Dockerfile from the prepare config when the
    /// folder does not carry one.
    fn prepare(&self, handle: &str, config: &PrepareConfig) -> Result<SourceItem, ContainerizerError>;

    fn build(&self, source: &str, config: &BuildConfig) -> Result<ImageItem, ContainerizerError>;

    fn run(&self, image_name: &str, container_name: &str, config: &RunConfig)
    -> Result<ContainerItem, ContainerizerError>;

    fn stop(&self, container_name: &str) -> Result<(), ContainerizerError>;

    fn remove(&self, container_name: &str) -> Result<(), ContainerizerError>;

    fn close(&self) -> Result<(), ContainerizerError>;
}

#[enum_dispatch(ContainerizerProvider)]
pub enum ContainerizerBackend {
    DockerLocal(docker_local::DockerLocal),
}

pub struct Containerizer {
    backend: ContainerizerBackend,
}

impl Containerizer {
    pub fn new(backend: impl Into<ContainerizerBackend>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.backend.kind()
    }

    pub fn prepare(&self, handle: &str, config: &PrepareConfig) -> Result<Response<SourceItem>, ContainerizerError> {
        self.backend.prepare(handle, config).map(Response::new)
    }

    pub fn build(&self, source: &str, config: &BuildConfig) -> Result<Response<ImageItem>, ContainerizerError> {
        self.backend.build(source, config).map(Response::new)
    }

    pub fn run(
        &self,
        image_name: &str,
        container_name: &str,
        config: &RunConfig,
    ) -> Result<Response<ContainerItem>, ContainerizerError> {
        self.backend.run(image_name, container_name, config).map(Response::new)
    }

    pub fn stop(&self, container_name: &str) -> Result<Response<()>, ContainerizerError> {
        self.backend.stop(container_name).map(Response::new)
    }

    pub fn remove(&self, container_name: &str) -> Result<Response<()>, ContainerizerError> {
        self.backend.remove(container_name).map(Response::new)
    }

    pub fn close(&self) -> Result<Response<()>, ContainerizerError> {
        self.backend.close().map(Response::new)
    }
}
