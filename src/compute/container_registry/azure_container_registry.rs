use std::sync::Arc;
use std::time::Duration;

use azure_core::authority_hosts::AZURE_PUBLIC_CLOUD;
use azure_core::new_http_client;
use azure_identity::ClientSecretCredential;
use azure_mgmt_containerregistry::models::{Registry, Resource, Sku, sku};

use crate::cmd::docker::Docker;
use crate::cmd::shell::Shell;
use crate::compute::container_registry::errors::ContainerRegistryError;
use crate::compute::container_registry::{ContainerRegistryProvider, Kind, split_image_name};
use crate::model::image::{RegistryItem, RegistryItemDigest};
use crate::runtime::block_on;

const MIN_REGISTRY_NAME_LENGTH: usize = 5;
const MAX_REGISTRY_NAME_LENGTH: usize = 50;

#[derive(serde::Deserialize)]
struct AcrManifest {
    digest: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "imageSize", default)]
    image_size: Option<u64>,
}

/// Registry on Azure Container Registry. Registry management goes through
/// the ARM SDK; repository level operations are not in the SDK yet and go
/// through the `az` CLI.
pub struct AzureContainerRegistry {
    client: Arc<azure_mgmt_containerregistry::Client>,
    subscription_id: String,
    resource_group: String,
    registry_name: String,
    location: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    docker: Arc<Docker>,
    shell: Arc<dyn Shell>,
}

impl AzureContainerRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        registry_name: &str,
        location: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        docker: Arc<Docker>,
        shell: Arc<dyn Shell>,
    ) -> Result<AzureContainerRegistry, ContainerRegistryError> {
        let tenant_id = tenant_id.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let credentials = Arc::new(ClientSecretCredential::new(
            new_http_client(),
            AZURE_PUBLIC_CLOUD.clone(),
            tenant_id.clone(),
            client_id.clone(),
            client_secret.clone(),
        ));
        let client = azure_mgmt_containerregistry::ClientBuilder::new(credentials)
            .build()
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot create ACR client: {e}")))?;

        Ok(AzureContainerRegistry {
            client: Arc::new(client),
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            registry_name: Self::sanitized_registry_name(registry_name)?,
            location: location.into(),
            tenant_id,
            client_id,
            client_secret,
            docker,
            shell,
        })
    }

    /// ACR names are 5-50 alphanumeric characters.
    pub fn sanitized_registry_name(registry_name: &str) -> Result<String, ContainerRegistryError> {
        if registry_name.len() < MIN_REGISTRY_NAME_LENGTH {
            return Err(ContainerRegistryError::bad_request(format!(
                "Registry name must contain alpha numeric characters only and be at least {MIN_REGISTRY_NAME_LENGTH} characters"
            )));
        }
        Ok(registry_name
            .chars()
            .filter(|c| c.is_alphanumeric())
            .take(MAX_REGISTRY_NAME_LENGTH)
            .collect())
    }

    fn login_server(&self) -> String {
        format!("{}.azurecr.io", self.registry_name.to_lowercase())
    }

    fn az(&self, args: &[&str]) -> Result<String, ContainerRegistryError> {
        let output = self
            .shell
            .run("az", args, &[], Some(Duration::from_secs(60)))
            .map_err(|e| ContainerRegistryError::internal(format!("az command failed: {e}")))?;
        Ok(output.stdout_string())
    }

    fn az_login(&self) -> Result<(), ContainerRegistryError> {
        self.az(&[
            "login",
            "--service-principal",
            "-u",
            &self.client_id,
            "-p",
            &self.client_secret,
            "--tenant",
            &self.tenant_id,
        ])?;
        Ok(())
    }

    fn registry_exists(&self) -> Result<bool, ContainerRegistryError> {
        match block_on(
            self.client
                .registries_client()
                .get(&self.subscription_id, &self.resource_group, &self.registry_name)
                .into_future(),
        ) {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("404") || message.to_ascii_lowercase().contains("not found") {
                    Ok(false)
                } else {
                    Err(ContainerRegistryError::internal(format!("get registry failed: {message}")))
                }
            }
        }
    }

    pub fn ensure_registry(&self) -> Result<(), ContainerRegistryError> {
        if self.registry_exists()? {
            return Ok(());
        }
        block_on(
            self.client
                .registries_client()
                .create(
                    &self.subscription_id,
                    &self.resource_group,
                    &self.registry_name,
                    Registry::new(Resource::new(self.location.clone()), Sku::new(sku::Name::Basic)),
                )
                .into_future(),
        )
        .map_err(|e| ContainerRegistryError::internal(format!("create registry failed: {e}")))?;
        Ok(())
    }

    pub fn delete_registry(&self) -> Result<(), ContainerRegistryError> {
        block_on(
            self.client
                .registries_client()
                .delete(&self.subscription_id, &self.resource_group, &self.registry_name)
                .send(),
        )
        .map_err(|e| ContainerRegistryError::internal(format!("delete registry failed: {e}")))?;
        Ok(())
    }

    fn list_manifests(&self, repository: &str) -> Result<Vec<AcrManifest>, ContainerRegistryError> {
        self.az_login()?;
        let output = self.az(&[
            "acr",
            "repository",
            "show-manifests",
            "-n",
            &self.registry_name,
            "--repository",
            repository,
            "-o",
            "json",
        ])?;
        serde_json::from_str(&output)
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot parse manifest list: {e}")))
    }
}

impl ContainerRegistryProvider for AzureContainerRegistry {
    fn kind(&self) -> Kind {
        Kind::AzureContainerRegistry
    }

    fn registry_endpoint(&self) -> Result<String, ContainerRegistryError> {
        Ok(self.login_server())
    }

    fn push(&self, image_name: &str) -> Result<RegistryItem, ContainerRegistryError> {
        let (name, tag) = split_image_name(image_name);
        self.ensure_registry()?;
        self.docker
            .login_with_credentials(&self.login_server(), &self.client_id, &self.client_secret)?;

        let image_uri = format!("{}/{}:{}", self.login_server(), name, tag);
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
        self.docker
            .login_with_credentials(&self.login_server(), &self.client_id, &self.client_secret)?;

        let image_uri = format!("{}/{}:{}", self.login_server(), name, tag);
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
        self.az_login()?;
        let source = match digest {
            Some(digest) => format!("{}/{}@{}", self.login_server(), name, digest),
            None => format!("{}/{}:{}", self.login_server(), name, current_tag),
        };
        self.az(&[
            "acr",
            "import",
            "--name",
            &self.registry_name,
            "--source",
            &source,
            "--image",
            &format!("{name}:{tag}"),
            "--force",
        ])?;
        Ok(RegistryItemDigest {
            image_uri: format!("{}/{}:{}", self.login_server(), name, tag),
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
        self.az_login()?;
        match (digest, tag) {
            (Some(digest), _) => {
                self.az(&[
                    "acr",
                    "repository",
                    "delete",
                    "-n",
                    &self.registry_name,
                    "--image",
                    &format!("{name}@{digest}"),
                    "--yes",
                ])?;
            }
            (None, Some(tag)) => {
                self.az(&[
                    "acr",
                    "repository",
                    "delete",
                    "-n",
                    &self.registry_name,
                    "--image",
                    &format!("{name}:{tag}"),
                    "--yes",
                ])?;
            }
            (None, None) => {
                self.az(&[
                    "acr",
                    "repository",
                    "delete",
                    "-n",
                    &self.registry_name,
                    "--repository",
                    &name,
                    "--yes",
                ])?;
            }
        }
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<RegistryItem>, ContainerRegistryError> {
        self.az_login()?;
        let output = self.az(&["acr", "repository", "list", "-n", &self.registry_name, "-o", "json"])?;
        let names: Vec<String> = serde_json::from_str(&output)
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot parse repository list: {e}")))?;
        Ok(names
            .into_iter()
            .map(|name| RegistryItem {
                image_uri: format!("{}/{}", self.login_server(), name),
                image_name: name,
            })
            .collect())
    }

    fn get_digests(&self, image_name: &str) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError> {
        let (name, _) = split_image_name(image_name);
        let manifests = self.list_manifests(&name)?;
        Ok(manifests
            .into_iter()
            .map(|manifest| RegistryItemDigest {
                image_uri: format!("{}/{}@{}", self.login_server(), name, manifest.digest),
                digest: manifest.digest,
                image_size_bytes: manifest.image_size,
                upload_time: manifest
                    .timestamp
                    .as_deref()
                    .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                    .map(|dt| dt.timestamp() as f64),
                tags: manifest.tags.unwrap_or_default(),
            })
            .collect())
    }

    fn close(&self) -> Result<(), ContainerRegistryError> {
        Ok(())
    }
}
