use thiserror::Error;

use crate::compute::container_registry::ContainerRegistry;
use crate::compute::container_registry::errors::ContainerRegistryError;
use crate::compute::containerizer::{Containerizer, ContainerizerError};
use crate::model::image::ImageMap;
use crate::model::service::{Container, ServiceDefinition};

#[derive(Error, Debug)]
pub enum ImagePipelineError {
    #[error("Image configuration error: {raw_error_message:?}")]
    BadRequest { raw_error_message: String },

    #[error(transparent)]
    Containerizer(#[from] ContainerizerError),

    #[error(transparent)]
    Registry(#[from] ContainerRegistryError),
}

impl ImagePipelineError {
    fn bad_request(message: impl Into<String>) -> Self {
        ImagePipelineError::BadRequest {
            raw_error_message: message.into(),
        }
    }
}

/// Resolve one image map to a pushed image URI: prepare the source when a
/// handle is given, build when a source is known, then push the local
/// image through the registry.
pub fn resolve_image(
    image_map: &ImageMap,
    containerizer: Option<&Containerizer>,
    container_registry: Option<&ContainerRegistry>,
) -> Result<String, ImagePipelineError> {
    let mut source: Option<String> = None;
    if let Some(handle) = &image_map.handle {
        let containerizer = containerizer
            .ok_or_else(|| ImagePipelineError::bad_request("Containerizer is required to get image from handle"))?;
        let prepared = containerizer.prepare(handle, &image_map.prepare)?;
        source = Some(prepared.result.source);
    } else if let Some(configured_source) = &image_map.source {
        source = Some(configured_source.clone());
    }

    let mut local_image: Option<String> = None;
    if let Some(source) = source {
        let containerizer = containerizer
            .ok_or_else(|| ImagePipelineError::bad_request("Containerizer is required to get image from source"))?;
        let mut build_config = image_map.build.clone();
        if build_config.image_name.is_none() {
            build_config.image_name = Some(image_map.name.clone());
        }
        containerizer.build(&source, &build_config)?;
        local_image = build_config.image_name;
    } else if let Some(configured_image) = &image_map.local_image {
        local_image = Some(configured_image.clone());
    }

    match local_image {
        Some(local_image) => {
            let container_registry = container_registry
                .ok_or_else(|| ImagePipelineError::bad_request("Container registry is required to push local image"))?;
            let pushed = container_registry.push(&local_image)?;
            Ok(pushed.result.image_uri)
        }
        None => Err(ImagePipelineError::bad_request(
            "Container image or local image or source is required",
        )),
    }
}

pub fn resolve_images(
    images: &[ImageMap],
    containerizer: Option<&Containerizer>,
    container_registry: Option<&ContainerRegistry>,
) -> Result<Vec<String>, ImagePipelineError> {
    images
        .iter()
        .map(|image_map| resolve_image(image_map, containerizer, container_registry))
        .collect()
}

/// One image URI per container: an image map matching the container name
/// wins, otherwise the container's own image reference is used.
pub fn map_images(
    containers: &[Container],
    images: &[ImageMap],
    containerizer: Option<&Containerizer>,
    container_registry: Option<&ContainerRegistry>,
) -> Result<Vec<String>, ImagePipelineError> {
    let image_uris = resolve_images(images, containerizer, container_registry)?;
    let mut container_images = Vec::with_capacity(containers.len());
    for container in containers {
        let mapped = images
            .iter()
            .position(|image| image.name == container.name)
            .map(|index| image_uris[index].clone());
        match mapped.or_else(|| container.image.clone()) {
            Some(image) => container_images.push(image),
            None => {
                return Err(ImagePipelineError::bad_request(format!(
                    "Container image not found for container: {}",
                    container.name
                )));
            }
        }
    }
    Ok(container_images)
}

/// A default registry only needs to exist when some container has no
/// direct image reference.
pub fn requires_container_registry(service: &ServiceDefinition) -> bool {
    service.containers.iter().any(|container| container.image.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::service::Container;

    #[test]
    fn map_images_prefers_image_map_over_container_image() {
        let containers = vec![
            Container {
                name: "web".to_string(),
                image: Some("fallback:latest".to_string()),
                ..Default::default()
            },
            Container {
                name: "sidecar".to_string(),
                image: Some("sidecar:v2".to_string()),
                ..Default::default()
            },
        ];
        // No image maps: containers keep their own image references.
        let images = map_images(&containers, &[], None, None).unwrap();
        assert_eq!(images, vec!["fallback:latest", "sidecar:v2"]);
    }

    #[test]
    fn map_images_fails_without_any_image() {
        let containers = vec![Container {
            name: "web".to_string(),
            ..Default::default()
        }];
        assert!(matches!(
            map_images(&containers, &[], None, None),
            Err(ImagePipelineError::BadRequest { .. })
        ));
    }

    #[test]
    fn registry_requirement_follows_missing_images() {
        let mut service = ServiceDefinition {
            containers: vec![Container {
                name: "web".to_string(),
                image: Some("nginx".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!requires_container_registry(&service));
        service.containers[0].image = None;
        assert!(requires_container_registry(&service));
    }
}
