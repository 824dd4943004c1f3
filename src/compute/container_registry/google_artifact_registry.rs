use std::borrow::BorrowMut;
use std::sync::Arc;
use std::time::Duration;

use google_cloud_artifact_registry::client::{Client, ClientConfig};
use google_cloud_googleapis::devtools::artifact_registry::v1::repository::Format;
use google_cloud_googleapis::devtools::artifact_registry::v1::{
    CreateRepositoryRequest, DeleteRepositoryRequest, GetRepositoryRequest, ListDockerImagesRequest,
    Repository as GcpRepository,
};
use tokio::sync::Mutex;

use crate::cmd::docker::Docker;
use crate::cmd::shell::Shell;
use crate::compute::container_registry::errors::ContainerRegistryError;
use crate::compute::container_registry::{ContainerRegistryProvider, Kind, split_image_name};
use crate::model::image::{RegistryItem, RegistryItemDigest};
use crate::runtime::block_on;

/// Registry on Google Artifact Registry. One GAR repository holds every
/// image this provider manages; images live under
/// `{location}-docker.pkg.dev/{project}/{repository}/{name}:{tag}`.
pub struct GoogleArtifactRegistry {
    client: Arc<Mutex<Client>>,
    project_id: String,
    location: String,
    repository: String,
    docker: Arc<Docker>,
    shell: Arc<dyn Shell>,
}

impl GoogleArtifactRegistry {
    pub fn new(
        project_id: impl Into<String>,
        location: impl Into<String>,
        repository: impl Into<String>,
        docker: Arc<Docker>,
        shell: Arc<dyn Shell>,
    ) -> Result<GoogleArtifactRegistry, ContainerRegistryError> {
        let config = block_on(ClientConfig::default().with_auth())
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot create artifact registry client: {e}")))?;
        let client = block_on(Client::new(config))
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot create artifact registry client: {e}")))?;
        Ok(GoogleArtifactRegistry {
            client: Arc::new(Mutex::from(client)),
            project_id: project_id.into(),
            location: location.into(),
            repository: repository.into(),
            docker,
            shell,
        })
    }

    fn registry_host(&self) -> String {
        format!("{}-docker.pkg.dev", self.location)
    }

    fn repository_identifier(&self) -> String {
        format!(
            "projects/{}/locations/{}/repositories/{}",
            self.project_id, self.location, self.repository
        )
    }

    fn image_uri(&self, name: &str, tag: &str) -> String {
        format!(
            "{}/{}/{}/{}:{}",
            self.registry_host(),
            self.project_id,
            self.repository,
            name,
            tag
        )
    }

    fn repository_exists(&self) -> Result<bool, ContainerRegistryError> {
        let result = block_on(self.client.clone().blocking_lock_owned().borrow_mut().get_repository(
            GetRepositoryRequest {
                name: self.repository_identifier(),
            },
            None,
        ));
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.to_ascii_lowercase().contains("not found") || message.contains("NotFound") {
                    Ok(false)
                } else {
                    Err(ContainerRegistryError::internal(format!("get_repository failed: {message}")))
                }
            }
        }
    }

    pub fn ensure_repository(&self) -> Result<(), ContainerRegistryError> {
        if self.repository_exists()? {
            return Ok(());
        }
        let mut operation = block_on(self.client.clone().blocking_lock_owned().borrow_mut().create_repository(
            CreateRepositoryRequest {
                parent: format!("projects/{}/locations/{}", self.project_id, self.location),
                repository_id: self.repository.clone(),
                repository: Some(GcpRepository {
                    name: self.repository.clone(),
                    format: Format::Docker.into(),
                    ..Default::default()
                }),
            },
            None,
        ))
        .map_err(|e| ContainerRegistryError::internal(format!("create_repository failed: {e}")))?;
        block_on(operation.wait(None))
            .map_err(|e| ContainerRegistryError::internal(format!("create_repository failed: {e}")))?;
        Ok(())
    }

    pub fn delete_repository(&self) -> Result<(), ContainerRegistryError> {
        block_on(self.client.clone().blocking_lock_owned().borrow_mut().delete_repository(
            DeleteRepositoryRequest {
                name: self.repository_identifier(),
            },
            None,
        ))
        .map_err(|e| ContainerRegistryError::internal(format!("delete_repository failed: {e}")))?;
        Ok(())
    }

    /// Short-lived token from the gcloud CLI; the Docker CLI logs in with
    /// the `oauth2accesstoken` virtual user.
    fn docker_login(&self) -> Result<(), ContainerRegistryError> {
        let output = self
            .shell
            .run(
                "gcloud",
                &["auth", "print-access-token"],
                &[],
                Some(Duration::from_secs(30)),
            )
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot get gcloud access token: {e}")))?;
        let token = output.stdout_string().trim().to_string();
        if token.is_empty() {
            return Err(ContainerRegistryError::internal("gcloud returned an empty access token"));
        }
        self.docker
            .login_with_credentials(&self.registry_host(), "oauth2accesstoken", &token)?;
        Ok(())
    }

    fn list_docker_images(&self) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError> {
        let mut digests = Vec::new();
        let mut next_page_token = String::new();
        loop {
            let response = block_on(
                self.client
                    .clone()
                    .blocking_lock_owned()
                    .borrow_mut()
                    .list_docker_images(
                        ListDockerImagesRequest {
                            parent: self.repository_identifier(),
                            page_token: next_page_token.clone(),
                            page_size: 100,
                            ..Default::default()
                        },
                        None,
                    ),
            )
            .map_err(|e| ContainerRegistryError::internal(format!("list_docker_images failed: {e}")))?;

            next_page_token = response.next_page_token;
            for image in response.docker_images {
                let digest = image.uri.rsplit('@').next().unwrap_or_default().to_string();
                digests.push(RegistryItemDigest {
                    image_uri: image.uri.clone(),
                    digest,
                    image_size_bytes: Some(image.image_size_bytes as u64),
                    upload_time: image.upload_time.as_ref().map(|t| t.seconds as f64),
                    tags: image.tags.clone(),
                });
            }
            if next_page_token.is_empty() {
                break;
            }
        }
        Ok(digests)
    }
}

impl ContainerRegistryProvider for GoogleArtifactRegistry {
    fn kind(&self) -> Kind {
        Kind::GoogleArtifactRegistry
    }

    fn registry_endpoint(&self) -> Result<String, ContainerRegistryError> {
        Ok(format!(
            "{}/{}/{}",
            self.registry_host(),
            self.project_id,
            self.repository
        ))
    }

    fn push(&self, image_name: &str) -> Result<RegistryItem, ContainerRegistryError> {
        let (name, tag) = split_image_name(image_name);
        self.ensure_repository()?;
        self.docker_login()?;

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
        self.docker_login()?;

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
        self.docker_login()?;

        let source = match digest {
            Some(digest) => format!(
                "{}/{}/{}/{}@{}",
                self.registry_host(),
                self.project_id,
                self.repository,
                name,
                digest
            ),
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
        let (name, _) = split_image_name(image_name);
        // Package level deletes cover the whole image; digest and tag
        // deletes go through the gcloud CLI which understands both forms.
        let reference = match (digest, tag) {
            (Some(digest), _) => format!(
                "{}/{}/{}/{}@{}",
                self.registry_host(),
                self.project_id,
                self.repository,
                name,
                digest
            ),
            (None, Some(tag)) => self.image_uri(&name, tag),
            (None, None) => format!(
                "{}/{}/{}/{}",
                self.registry_host(),
                self.project_id,
                self.repository,
                name
            ),
        };
        self.shell
            .run(
                "gcloud",
                &[
                    "artifacts",
                    "docker",
                    "images",
                    "delete",
                    &reference,
                    "--delete-tags",
                    "--quiet",
                ],
                &[],
                Some(Duration::from_secs(120)),
            )
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot delete image: {e}")))?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<RegistryItem>, ContainerRegistryError> {
        let digests = self.list_docker_images()?;
        let mut images: Vec<RegistryItem> = Vec::new();
        for digest in digests {
            let uri_without_digest = digest.image_uri.split('@').next().unwrap_or_default().to_string();
            let name = uri_without_digest.rsplit('/').next().unwrap_or_default().to_string();
            if !images.iter().any(|i| i.image_name == name) {
                images.push(RegistryItem {
                    image_name: name,
                    image_uri: uri_without_digest,
                });
            }
        }
        Ok(images)
    }

    fn get_digests(&self, image_name: &str) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError> {
        let (name, _) = split_image_name(image_name);
        let needle = format!("/{name}@");
        Ok(self
            .list_docker_images()?
            .into_iter()
            .filter(|digest| digest.image_uri.contains(&needle))
            .collect())
    }

    fn close(&self) -> Result<(), ContainerRegistryError> {
        Ok(())
    }
}
