use enum_dispatch::enum_dispatch;
use thiserror::Error;

use crate::compute::image_pipeline::ImagePipelineError;
use crate::errors::ErrorKind;
use crate::model::Response;
use crate::model::service::{Revision, ServiceDefinition, ServiceItem, ServiceOverlay, TrafficAllocation};

pub mod convert;
pub mod ec2_helper;
pub mod helper;

pub mod amazon_ecs;
pub mod amazon_ecs_ec2;
pub mod amazon_ecs_fargate;
pub mod aws_app_runner;
pub mod azure_container_apps;
pub mod docker_local;
pub mod google_cloud_run;

#[derive(Error, Debug)]
pub enum DeploymentError {
    #[error("Bad request: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error("Service or revision not found: {raw_error_message:?}")]
    NotFound { raw_error_message: String },

    #[error("Service already exists: {raw_error_message:?}")]
    Conflict { raw_error_message: String },

    #[error("Precondition failed: {raw_error_message:?}")]
    PreconditionFailed { raw_error_message: String },

    #[error("Not supported by this provider: {raw_error_message:?}")]
    Unsupported { raw_error_message: String },

    #[error("Operation timed out: {raw_error_message:?}")]
    Timeout { raw_error_message: String },

    #[error("Provider error: {raw_error_message:?}")]
    Internal { raw_error_message: String },
}

impl DeploymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeploymentError::BadRequest { .. } => ErrorKind::BadRequest,
            DeploymentError::NotFound { .. } => ErrorKind::NotFound,
            DeploymentError::Conflict { .. } => ErrorKind::Conflict,
            DeploymentError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            DeploymentError::Unsupported { .. } => ErrorKind::Unsupported,
            DeploymentError::Timeout { .. } => ErrorKind::Timeout,
            DeploymentError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        DeploymentError::BadRequest {
            raw_error_message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DeploymentError::NotFound {
            raw_error_message: message.into(),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        DeploymentError::PreconditionFailed {
            raw_error_message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        DeploymentError::Unsupported {
            raw_error_message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DeploymentError::Internal {
            raw_error_message: message.into(),
        }
    }
}

impl From<ImagePipelineError> for DeploymentError {
    fn from(e: ImagePipelineError) -> Self {
        match e {
            ImagePipelineError::BadRequest { raw_error_message } => DeploymentError::BadRequest { raw_error_message },
            other => DeploymentError::internal(other.to_string()),
        }
    }
}

impl From<crate::cmd::docker::DockerError> for DeploymentError {
    fn from(e: crate::cmd::docker::DockerError) -> Self {
        DeploymentError::internal(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    AmazonEcsFargate,
    AmazonEcsEc2,
    AwsAppRunner,
    AzureContainerApps,
    GoogleCloudRun,
    DockerLocal,
}

/// Capabilities a caller can query before asking for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    MultipleRevisions,
    RevisionDelete,
    MultipleContainers,
    TrafficSplit,
}

/// Uniform provider contract for container deployments.
#[enum_dispatch]
pub trait ContainerDeploymentProvider {
    fn kind(&self) -> Kind;

    fn supports(&self, feature: Feature) -> bool;

    /// Reconcile the cloud service to the given definition, creating or
    /// updating every prerequisite, then wait for stability.
    fn create_service(
        &self,
        service: &ServiceDefinition,
        where_exists: Option<bool>,
    ) -> Result<ServiceItem, DeploymentError>;

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError>;

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError>;

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError>;

    fn list_revisions(&self, name: &str, limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError>;

    fn get_revision(&self, name: &str, revision: &str) -> Result<Revision, DeploymentError>;

    fn delete_revision(&self, name: &str, revision: &str) -> Result<(), DeploymentError>;

    fn update_traffic(&self, name: &str, traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError>;

    fn close(&self) -> Result<(), DeploymentError>;
}

#[enum_dispatch(ContainerDeploymentProvider)]
pub enum DeploymentBackend {
    AmazonEcs(amazon_ecs::AmazonEcs),
    AwsAppRunner(aws_app_runner::AwsAppRunner),
    AzureContainerApps(azure_container_apps::AzureContainerApps),
    GoogleCloudRun(google_cloud_run::GoogleCloudRun),
    DockerLocal(docker_local::DockerLocal),
}

/// Provider-agnostic container deployment component.
pub struct ContainerDeployment {
    backend: DeploymentBackend,
    service: Option<ServiceDefinition>,
    overlay: Option<ServiceOverlay>,
}

impl ContainerDeployment {
    pub fn new(backend: impl Into<DeploymentBackend>) -> Self {
        Self {
            backend: backend.into(),
            service: None,
            overlay: None,
        }
    }

    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_overlay(mut self, overlay: ServiceOverlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn kind(&self) -> Kind {
        self.backend.kind()
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.backend.supports(feature)
    }

    /// `where` on service creation is limited to `exists()` /
    /// `not_exists()`.
    fn parse_where_exists(where_expr: Option<&str>) -> Result<Option<bool>, DeploymentError> {
        match where_expr {
            None => Ok(None),
            Some(text) => {
                let expr = crate::ql::parse(text).map_err(|e| DeploymentError::bad_request(e.to_string()))?;
                expr.where_exists().map(Some).ok_or_else(|| {
                    DeploymentError::bad_request("Only exists() and not_exists() conditions are supported here")
                })
            }
        }
    }

    fn normalize_service(&self, service: Option<&ServiceDefinition>) -> Result<ServiceDefinition, DeploymentError> {
        let base = service
            .cloned()
            .or_else(|| self.service.clone())
            .ok_or_else(|| DeploymentError::bad_request("Service definition is required"))?;
        let merged = helper::merge_service_overlay(base, self.overlay.as_ref());
        helper::validate_service(&merged, &self.backend)?;
        Ok(merged)
    }

    pub fn create_service(
        &self,
        service: Option<&ServiceDefinition>,
        where_expr: Option<&str>,
    ) -> Result<Response<ServiceItem>, DeploymentError> {
        let where_exists = Self::parse_where_exists(where_expr)?;
        let service = self.normalize_service(service)?;
        self.backend.create_service(&service, where_exists).map(Response::new)
    }

    pub fn get_service(&self, name: &str) -> Result<Response<ServiceItem>, DeploymentError> {
        self.backend.get_service(name).map(Response::new)
    }

    pub fn delete_service(&self, name: &str) -> Result<Response<()>, DeploymentError> {
        self.backend.delete_service(name).map(Response::new)
    }

    pub fn list_services(&self) -> Result<Response<Vec<ServiceItem>>, DeploymentError> {
        self.backend.list_services().map(Response::new)
    }

    pub fn list_revisions(&self, name: &str, limit: Option<u32>) -> Result<Response<Vec<Revision>>, DeploymentError> {
        if !self.backend.supports(Feature::MultipleRevisions) {
            return Err(DeploymentError::unsupported("Provider does not support revisions"));
        }
        self.backend.list_revisions(name, limit).map(Response::new)
    }

    pub fn get_revision(&self, name: &str, revision: &str) -> Result<Response<Revision>, DeploymentError> {
        if !self.backend.supports(Feature::MultipleRevisions) {
            return Err(DeploymentError::unsupported("Provider does not support revisions"));
        }
        self.backend.get_revision(name, revision).map(Response::new)
    }

    pub fn delete_revision(&self, name: &str, revision: &str) -> Result<Response<()>, DeploymentError> {
        if !self.backend.supports(Feature::RevisionDelete) {
            return Err(DeploymentError::unsupported("Provider does not support revision delete"));
        }
        self.backend.delete_revision(name, revision).map(Response::new)
    }

    pub fn update_traffic(
        &self,
        name: &str,
        traffic: &[TrafficAllocation],
    ) -> Result<Response<ServiceItem>, DeploymentError> {
        self.backend.update_traffic(name, traffic).map(Response::new)
    }

    pub fn close(&self) -> Result<Response<()>, DeploymentError> {
        self.backend.close().map(Response::new)
    }
}
