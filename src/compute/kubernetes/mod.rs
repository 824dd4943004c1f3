use std::collections::HashMap;
use std::time::Duration;

use enum_dispatch::enum_dispatch;
use thiserror::Error;

use crate::errors::ErrorKind;
use crate::model::Response;

pub mod apply_engine;
pub mod cluster;
pub mod minikube;

#[derive(Error, Debug)]
pub enum KubernetesError {
    #[error("Bad request: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error("Resource not found: {raw_error_message:?}")]
    NotFound { raw_error_message: String },

    #[error("Wait timed out: {raw_error_message:?}")]
    Timeout { raw_error_message: String },

    #[error("Kubernetes error: {raw_error_message:?}")]
    Internal { raw_error_message: String },
}

impl KubernetesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KubernetesError::BadRequest { .. } => ErrorKind::BadRequest,
            KubernetesError::NotFound { .. } => ErrorKind::NotFound,
            KubernetesError::Timeout { .. } => ErrorKind::Timeout,
            KubernetesError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        KubernetesError::BadRequest {
            raw_error_message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        KubernetesError::Internal {
            raw_error_message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Cluster,
    Minikube,
}

/// One applied (or deleted) object, in `kind/namespace/name` terms.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedResource {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

pub struct ApplyOptions {
    pub namespace: Option<String>,
    /// Recursive overlay merged into every manifest; `null` removes.
    pub overlay: Option<serde_json::Value>,
    /// Image name to pushed-image-uri rewrites applied to pod templates.
    pub image_overrides: HashMap<String, String>,
    /// Delete previously applied objects missing from this manifest set.
    pub prune: bool,
    pub wait: bool,
    pub wait_timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            overlay: None,
            image_overrides: HashMap::new(),
            prune: false,
            wait: true,
            wait_timeout: Duration::from_secs(300),
        }
    }
}

#[enum_dispatch]
pub trait KubernetesProvider {
    fn kind(&self) -> Kind;

    fn apply(&self, manifests: &str, options: &ApplyOptions) -> Result<Vec<AppliedResource>, KubernetesError>;

    fn delete(&self, manifests: &str, namespace: Option<&str>) -> Result<(), KubernetesError>;

    fn wait_ready(&self, resources: &[AppliedResource], timeout: Duration) -> Result<(), KubernetesError>;
}

#[enum_dispatch(KubernetesProvider)]
pub enum KubernetesBackend {
    Cluster(cluster::Cluster),
    Minikube(minikube::Minikube),
}

/// Provider-agnostic Kubernetes apply component.
pub struct Kubernetes {
    backend: KubernetesBackend,
}

impl Kubernetes {
    pub fn new(backend: impl Into<KubernetesBackend>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.backend.kind()
    }

    pub fn apply(
        &self,
        manifests: &str,
        options: &ApplyOptions,
    ) -> Result<Response<Vec<AppliedResource>>, KubernetesError> {
        self.backend.apply(manifests, options).map(Response::new)
    }

    pub fn delete(&self, manifests: &str, namespace: Option<&str>) -> Result<Response<()>, KubernetesError> {
        self.backend.delete(manifests, namespace).map(Response::new)
    }

    pub fn wait_ready(
        &self,
        resources: &[AppliedResource],
        timeout: Duration,
    ) -> Result<Response<()>, KubernetesError> {
        self.backend.wait_ready(resources, timeout).map(Response::new)
    }
}
