use enum_dispatch::enum_dispatch;

use crate::model::Response;
use crate::model::image::{RegistryItem, RegistryItemDigest};

pub mod errors;

pub mod azure_container_registry;
pub mod docker_local;
pub mod ecr;
pub mod google_artifact_registry;

use errors::ContainerRegistryError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Ecr,
    AzureContainerRegistry,
    GoogleArtifactRegistry,
    DockerLocal,
}

/// Split `name[:tag]` into name and tag, defaulting the tag to `latest`.
pub(crate) fn split_image_name(image_name: &str) -> (String, String) {
    match image_name.rsplit_once(':') {
        // A colon inside a registry host (host:port/name) is not a tag.
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (image_name.to_string(), "latest".to_string()),
    }
}

/// Uniform provider contract for image registries.
#[enum_dispatch]
pub trait ContainerRegistryProvider {
    fn kind(&self) -> Kind;

    /// Registry endpoint images get tagged against, e.g.
    /// `123456.dkr.ecr.us-west-2.amazonaws.com`.
    fn registry_endpoint(&self) -> Result<String, ContainerRegistryError>;

    fn push(&self, image_name: &str) -> Result<RegistryItem, ContainerRegistryError>;

    fn pull(&self, image_name: &str, tag: Option<&str>) -> Result<RegistryItem, ContainerRegistryError>;

    fn tag(&self, image_name: &str, tag: &str, digest: Option<&str>)
    -> Result<RegistryItemDigest, ContainerRegistryError>;

    fn delete(&self, image_name: &str, digest: Option<&str>, tag: Option<&str>)
    -> Result<(), ContainerRegistryError>;

    fn list_images(&self) -> Result<Vec<RegistryItem>, ContainerRegistryError>;

    fn get_digests(&self, image_name: &str) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError>;

    fn close(&self) -> Result<(), ContainerRegistryError>;
}

#[enum_dispatch(ContainerRegistryProvider)]
pub enum ContainerRegistryBackend {
    Ecr(ecr::Ecr),
    AzureContainerRegistry(azure_container_registry::AzureContainerRegistry),
    GoogleArtifactRegistry(google_artifact_registry::GoogleArtifactRegistry),
    DockerLocal(docker_local::DockerLocal),
}

/// Provider-agnostic container registry component.
pub struct ContainerRegistry {
    backend: ContainerRegistryBackend,
}

impl ContainerRegistry {
    pub fn new(backend: impl Into<ContainerRegistryBackend>) -> Self {
        Self {
            backend: backend.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.backend.kind()
    }

    pub fn push(&self, image_name: &str) -> Result<Response<RegistryItem>, ContainerRegistryError> {
        self.backend.push(image_name).map(Response::new)
    }

    pub fn pull(&self, image_name: &str, tag: Option<&str>) -> Result<Response<RegistryItem>, ContainerRegistryError> {
        self.backend.pull(image_name, tag).map(Response::new)
    }

    pub fn tag(
        &self,
        image_name: &str,
        tag: &str,
        digest: Option<&str>,
    ) -> Result<Response<RegistryItemDigest>, ContainerRegistryError> {
        self.backend.tag(image_name, tag, digest).map(Response::new)
    }

    pub fn delete(
        &self,
        image_name: &str,
        digest: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Response<()>, ContainerRegistryError> {
        self.backend.delete(image_name, digest, tag).map(Response::new)
    }

    pub fn list_images(&self) -> Result<Response<Vec<RegistryItem>>, ContainerRegistryError> {
        self.backend.list_images().map(Response::new)
    }

    pub fn get_digests(&self, image_name: &str) -> Result<Response<Vec<RegistryItemDigest>>, ContainerRegistryError> {
        self.backend.get_digests(image_name).map(Response::new)
    }

    pub fn close(&self) -> Result<Response<()>, ContainerRegistryError> {
        self.backend.close().map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_name_handles_tags_and_ports() {
        assert_eq!(split_image_name("web"), ("web".to_string(), "latest".to_string()));
        assert_eq!(split_image_name("web:v1"), ("web".to_string(), "v1".to_string()));
        assert_eq!(
            split_image_name("localhost:5000/web"),
            ("localhost:5000/web".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_name("localhost:5000/web:v2"),
            ("localhost:5000/web".to_string(), "v2".to_string())
        );
    }
}
