use std::sync::Arc;

use aws_sdk_ecr::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_ecr::types::ImageIdentifier;
use base64::Engine;

use crate::cmd::docker::Docker;
use crate::compute::container_registry::errors::ContainerRegistryError;
use crate::compute::container_registry::{ContainerRegistryProvider, Kind, split_image_name};
use crate::model::image::{RegistryItem, RegistryItemDigest};
use crate::runtime::block_on;

/// Registry on Amazon ECR. One ECR repository per image name.
pub struct Ecr {
    client: aws_sdk_ecr::Client,
    docker: Arc<Docker>,
}

impl Ecr {
    pub fn new(region: impl Into<String>, docker: Arc<Docker>) -> Ecr {
        let config = block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.into()))
                .load(),
        );
        Ecr {
            client: aws_sdk_ecr::Client::new(&config),
            docker,
        }
    }

    pub fn with_credentials(
        region: impl Into<String>,
        access_key_id: &str,
        secret_access_key: &str,
        session_token: Option<&str>,
        docker: Arc<Docker>,
    ) -> Ecr {
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            session_token.map(str::to_string),
            None,
            "nimbus-engine",
        );
        let config = block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.into()))
                .credentials_provider(credentials)
                .load(),
        );
        Ecr {
            client: aws_sdk_ecr::Client::new(&config),
            docker,
        }
    }

    fn get_repository_uri(&self, repository_name: &str) -> Result<Option<String>, ContainerRegistryError> {
        match block_on(
            self.client
                .describe_repositories()
                .repository_names(repository_name)
                .send(),
        ) {
            Ok(output) => Ok(output
                .repositories()
                .first()
                .and_then(|r| r.repository_uri().map(str::to_string))),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_repository_not_found_exception())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(ContainerRegistryError::internal(format!(
                        "describe_repositories failed: {err:?}"
                    )))
                }
            }
        }
    }

    fn ensure_repository(&self, repository_name: &str) -> Result<String, ContainerRegistryError> {
        if let Some(uri) = self.get_repository_uri(repository_name)? {
            return Ok(uri);
        }
        let created = block_on(self.client.create_repository().repository_name(repository_name).send())
            .map_err(|e| ContainerRegistryError::internal(format!("create_repository failed: {e:?}")))?;
        created
            .repository()
            .and_then(|r| r.repository_uri().map(str::to_string))
            .ok_or_else(|| ContainerRegistryError::internal("Created repository has no uri"))
    }

    /// Authenticate the Docker CLI against this account's registry.
    fn docker_login(&self) -> Result<(), ContainerRegistryError> {
        let output = block_on(self.client.get_authorization_token().send())
            .map_err(|e| ContainerRegistryError::internal(format!("get_authorization_token failed: {e:?}")))?;
        let auth = output
            .authorization_data()
            .first()
            .ok_or_else(|| ContainerRegistryError::internal("No ECR authorization data returned"))?;
        let token = auth
            .authorization_token()
            .ok_or_else(|| ContainerRegistryError::internal("No ECR authorization token returned"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| ContainerRegistryError::internal(format!("Cannot decode ECR token: {e}")))?;
        let decoded = String::from_utf8_lossy(&decoded).to_string();
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| ContainerRegistryError::internal("Malformed ECR authorization token"))?;
        let endpoint = auth
            .proxy_endpoint()
            .ok_or_else(|| ContainerRegistryError::internal("No ECR proxy endpoint returned"))?;
        let host = endpoint.trim_start_matches("https://");
        self.docker.login_with_credentials(host, username, password)?;
        Ok(())
    }
}

impl ContainerRegistryProvider for Ecr {
    fn kind(&self) -> Kind {
        Kind::Ecr
    }

    fn registry_endpoint(&self) -> Result<String, ContainerRegistryError> {
        let output = block_on(self.client.get_authorization_token().send())
            .map_err(|e| ContainerRegistryError::internal(format!("get_authorization_token failed: {e:?}")))?;
        output
            .authorization_data()
            .first()
            .and_then(|a| a.proxy_endpoint())
            .map(|endpoint| endpoint.trim_start_matches("https://").to_string())
            .ok_or_else(|| ContainerRegistryError::internal("No ECR proxy endpoint returned"))
    }

    fn push(&self, image_name: &str) -> Result<RegistryItem, ContainerRegistryError> {
        let (name, tag) = split_image_name(image_name);
        let repository_uri = self.ensure_repository(&name)?;
        self.docker_login()?;

        let image_uri = format!("{repository_uri}:{tag}");
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
        let repository_uri = self
            .get_repository_uri(&name)?
            .ok_or_else(|| ContainerRegistryError::not_found(format!("Repository `{name}` not found")))?;
        self.docker_login()?;

        let image_uri = format!("{repository_uri}:{tag}");
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
        let repository_uri = self
            .get_repository_uri(&name)?
            .ok_or_else(|| ContainerRegistryError::not_found(format!("Repository `{name}` not found")))?;

        // Retag server-side: fetch the manifest, put it back under the new
        // tag.
        let image_id = match digest {
            Some(digest) => ImageIdentifier::builder().image_digest(digest).build(),
            None => ImageIdentifier::builder().image_tag(&current_tag).build(),
        };
        let images = block_on(
            self.client
                .batch_get_image()
                .repository_name(&name)
                .image_ids(image_id)
                .send(),
        )
        .map_err(|e| ContainerRegistryError::internal(format!("batch_get_image failed: {e:?}")))?;
        let image = images
            .images()
            .first()
            .ok_or_else(|| ContainerRegistryError::not_found(format!("Image `{image_name}` not found")))?;
        let manifest = image
            .image_manifest()
            .ok_or_else(|| ContainerRegistryError::internal("Image manifest missing"))?;

        block_on(
            self.client
                .put_image()
                .repository_name(&name)
                .image_manifest(manifest)
                .image_tag(tag)
                .send(),
        )
        .map_err(|e| ContainerRegistryError::internal(format!("put_image failed: {e:?}")))?;

        let resolved_digest = image
            .image_id()
            .and_then(|id| id.image_digest())
            .unwrap_or_default()
            .to_string();
        Ok(RegistryItemDigest {
            image_uri: format!("{repository_uri}:{tag}"),
            digest: resolved_digest,
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
        let image_ids = match (digest, tag) {
            (Some(digest), _) => vec![ImageIdentifier::builder().image_digest(digest).build()],
            (None, Some(tag)) => vec![ImageIdentifier::builder().image_tag(tag).build()],
            (None, None) => {
                let listed = block_on(self.client.list_images().repository_name(&name).send())
                    .map_err(|e| ContainerRegistryError::internal(format!("list_images failed: {e:?}")))?;
                listed.image_ids().to_vec()
            }
        };
        if image_ids.is_empty() {
            return Ok(());
        }
        block_on(
            self.client
                .batch_delete_image()
                .repository_name(&name)
                .set_image_ids(Some(image_ids))
                .send(),
        )
        .map_err(|e| ContainerRegistryError::internal(format!("batch_delete_image failed: {e:?}")))?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<RegistryItem>, ContainerRegistryError> {
        let output = block_on(self.client.describe_repositories().max_results(1000).send())
            .map_err(|e| ContainerRegistryError::internal(format!("describe_repositories failed: {e:?}")))?;
        Ok(output
            .repositories()
            .iter()
            .filter_map(|r| {
                let name = r.repository_name()?;
                let uri = r.repository_uri()?;
                Some(RegistryItem {
                    image_name: name.to_string(),
                    image_uri: uri.to_string(),
                })
            })
            .collect())
    }

    fn get_digests(&self, image_name: &str) -> Result<Vec<RegistryItemDigest>, ContainerRegistryError> {
        let (name, _) = split_image_name(image_name);
        let repository_uri = self
            .get_repository_uri(&name)?
            .ok_or_else(|| ContainerRegistryError::not_found(format!("Repository `{name}` not found")))?;
        let output = block_on(self.client.describe_images().repository_name(&name).send())
            .map_err(|e| ContainerRegistryError::internal(format!("describe_images failed: {e:?}")))?;
        Ok(output
            .image_details()
            .iter()
            .filter_map(|detail| {
                let digest = detail.image_digest()?;
                Some(RegistryItemDigest {
                    image_uri: format!("{repository_uri}@{digest}"),
                    digest: digest.to_string(),
                    image_size_bytes: detail.image_size_in_bytes().map(|s| s as u64),
                    upload_time: detail.image_pushed_at().map(|t| t.as_secs_f64()),
                    tags: detail.image_tags().iter().map(|t| t.to_string()).collect(),
                })
            })
            .collect())
    }

    fn close(&self) -> Result<(), ContainerRegistryError> {
        Ok(())
    }
}
