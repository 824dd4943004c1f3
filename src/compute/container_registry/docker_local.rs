use std::sync::Arc;

use crate::cmd::docker::Docker;
use crate::compute::container_registry::errors::ContainerRegistryError;
use crate::compute::container_registry::{ContainerRegistryProvider, Kind, split_image_name};
use crate::model::image::{RegistryItem, RegistryItemDigest};

const DEFAULT_REGISTRY_HOST: &str = "localhost:5000";

/// Registry backed by a local Docker registry container
/// (`docker run -p 5000:5000 registry:2`).
pub struct DockerLocal {
    registry_host: String,
    docker: Arc<Docker>,
}

impl DockerLocal {
    pub fn new(docker: Arc<Docker>) -> DockerLocal {
        DockerLocal {
            registry_host: DEFAULT_REGISTRY_HOST.to_string(),
            docker,
        }
    }

    pub fn with_registry_host(registry_host: impl Into<String>, docker: Arc<Docker>) -> DockerLocal {
        DockerLocal {
            registry_host: registry_host.into(),
            docker,
        }
    }

    fn image_uri(&self, name: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.registry_host, name, tag)
    }
}

impl ContainerRegistryProvider for DockerLocal {
    fn kind(&self) -> Kind {
        Kind::DockerLocal
    }

    fn registry_endpoint(&self) -> Result<String, ContainerRegistryError> {
        Ok(self.registry_host.clone())
    }

    fn push(&self, image_name: &str) -> Result<RegistryItem, ContainerRegistryError> {
        let (name, tag) = split_image_name(image_name);
        let image_uri = self.image_uri(&name, &tag);
        self.docker.tag(image_name, &image_uri)?;
        self.docker.push(&image_uri, None)?;
        Ok(RegistryItem {
            image_name: image_name.to_string(),
            image_uri,
        })
    }

    fn pull(&self, image_name: &str, tag: Option<&str>) -> Result<RegistryItem, ContainerRegistryError> {
        let (name, default_tag) = split_image_name(image_name);
        let tag = tag.unwrap_or(&default_tag);
        let image_uri = self.image_uri(&name, tag);
        self.docker.pull(&image_uri, None)?;
        Ok(RegistryItem {
            image_name: image_name.to_string(),
            image_uri,
        })
    }

    fn tag(
        &self,
        image_name: &str,
        tag: &str,
        digest: Option<&str>,
    ) -> Result<RegistryItemDigest, ContainerRegistryError> {
        let (name, current_tag) = split_image_name(image_name);
        let source = match digest {
            Some(digest) => format!("{}/{}@{}", self.registry_host, name, digest),
            None => self.image_uri(&name, &current_tag),
        };
        let destination = self.image_uri(&name, tag);
        self.docker.pull(&source, None)?;
        self.docker.tag(&source, &destination)?;
        self.docker.push(&destination, None)?;
        Ok(RegistryItemDigest {
            image_uri: destination,
            digest: digest.unwrap_or_default().to_string(),
            image_size_bytes: None,
            upload_time: None,
            tags: vec![tag.to_string()],
        })
    }

    fn delete(
        &self,
        image_name: &str,
        digest: Option<&str>,
        tag: Option<&str>,
    ) -> Result<(), ContainerRegistryError> {
        let (name, default_tag) = split_image_name(image_name);
        let reference = match (digest, tag) {
            (Some(digest), _) => format!("{}/{}@{}", self.registry_host, name, digest),
            (None, Some(tag)) => self.image_uri(&name, tag),
            (None, None) => self.image_uri(&name, &default_tag),
        };
        self.docker.remove_image(&reference)?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<RegistryItem>, ContainerRegistryError> {
        // The registry container has no catalog API through docker; the
        // local image cache is the source of truth here.
        let references = self.docker.list_image_references(&format!("{}/*", self.registry_host))?;
        Ok(references
            .into_iter()
            .map(|reference| {
                let (name, _tag) = split_image_name(reference.trim_start_matches(&format!("{}/", self.registry_host)));
                RegistryItem {
                    image_name: name,
                    image_uri: reference,
                }
            })
            .collect())
    }

    fn get_digests(&self, image_name: &str) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError> {
        let (name, default_tag) = split_image_name(image_name);
        let image_uri = self.image_uri(&name, &default_tag);
        match self.docker.image_digest(&image_uri)? {
            Some(digest) => Ok(vec![RegistryItemDigest {
                image_uri: format!("{}/{}@{}", self.registry_host, name, digest),
                digest,
                image_size_bytes: None,
                upload_time: None,
                tags: vec![default_tag],
            }]),
            None => Ok(vec![]),
        }
    }

    fn close(&self) -> Result<(), ContainerRegistryError> {
        Ok(())
    }
}
