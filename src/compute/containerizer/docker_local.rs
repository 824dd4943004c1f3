use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cmd::docker::Docker;
use crate::compute::containerizer::{ContainerizerError, ContainerizerProvider, Kind};
use crate::model::image::{BuildConfig, ContainerItem, ImageItem, PrepareConfig, RunConfig, SourceItem};

const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Containerizer over the local Docker daemon.
pub struct DockerLocal {
    docker: Arc<Docker>,
}

impl DockerLocal {
    pub fn new(docker: Arc<Docker>) -> DockerLocal {
        DockerLocal { docker }
    }

    fn synthesize_dockerfile(config: &PrepareConfig) -> String {
        let mut dockerfile = String::new();
        let _ = writeln!(dockerfile, "FROM {}", config.base_image);
        let _ = writeln!(dockerfile, "WORKDIR /app");
        for requirement in &config.requirements {
            let _ = writeln!(dockerfile, "COPY {requirement} /app/{requirement}");
        }
        let _ = writeln!(dockerfile, "COPY . /app");
        for port in &config.expose {
            let _ = writeln!(dockerfile, "EXPOSE {port}");
        }
        dockerfile
    }
}

impl ContainerizerProvider for DockerLocal {
    fn kind(&self) -> Kind {
        Kind::DockerLocal
    }

    fn prepare(&self, handle: &str, config: &PrepareConfig) -> Result<SourceItem, ContainerizerError> {
        let source_dir = Path::new(handle);
        if !source_dir.is_dir() {
            return Err(ContainerizerError::NotFound {
                raw_error_message: format!("Source folder `{handle}` does not exist"),
            });
        }

        let build_dir = if config.prepare_in_place {
            source_dir.to_path_buf()
        } else {
            let staging = std::env::temp_dir().join(format!("nimbus-build-{}", uuid::Uuid::new_v4()));
            copy_dir(source_dir, &staging)
                .map_err(|e| ContainerizerError::internal(format!("Cannot stage build context: {e}")))?;
            staging
        };

        let dockerfile_path = build_dir.join("Dockerfile");
        if !dockerfile_path.is_file() {
            fs::write(&dockerfile_path, Self::synthesize_dockerfile(config))
                .map_err(|e| ContainerizerError::internal(format!("Cannot write Dockerfile: {e}")))?;
        }

        Ok(SourceItem {
            source: build_dir.to_string_lossy().to_string(),
        })
    }

    fn build(&self, source: &str, config: &BuildConfig) -> Result<ImageItem, ContainerizerError> {
        let image_name = config
            .image_name
            .as_deref()
            .ok_or_else(|| ContainerizerError::bad_request("Build config requires an image name"))?;

        self.docker.build(
            None,
            source,
            image_name,
            &config.platform,
            config.nocache,
            &[],
            Some(BUILD_TIMEOUT),
        )?;

        let digest = self.docker.image_digest(image_name).unwrap_or(None);
        Ok(ImageItem {
            name: image_name.to_string(),
            digest,
            tags: vec![],
        })
    }

    fn run(
        &self,
        image_name: &str,
        container_name: &str,
        config: &RunConfig,
    ) -> Result<ContainerItem, ContainerizerError> {
        let ports: Vec<(u16, u16)> = config
            .ports
            .iter()
            .filter_map(|(host, container)| host.parse::<u16>().ok().map(|h| (h, *container)))
            .collect();
        let envs: Vec<(&str, &str)> = config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let container_id = self.docker.run(
            container_name,
            image_name,
            &ports,
            &envs,
            config.detach,
            config.remove,
            None,
            &[],
        )?;

        Ok(ContainerItem {
            id: container_id,
            name: Some(container_name.to_string()),
            image: Some(ImageItem {
                name: image_name.to_string(),
                digest: None,
                tags: vec![],
            }),
        })
    }

    fn stop(&self, container_name: &str) -> Result<(), ContainerizerError> {
        self.docker.stop_container(container_name)?;
        Ok(())
    }

    fn remove(&self, container_name: &str) -> Result<(), ContainerizerError> {
        self.docker.remove_container(container_name, true)?;
        Ok(())
    }

    fn close(&self) -> Result<(), ContainerizerError> {
        Ok(())
    }
}

fn copy_dir(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_dockerfile_carries_base_image_and_ports() {
        let config = PrepareConfig {
            base_image: "debian:bookworm-slim".to_string(),
            expose: vec![8080, 9090],
            requirements: vec![],
            prepare_in_place: true,
        };
        let dockerfile = DockerLocal::synthesize_dockerfile(&config);
        assert!(dockerfile.starts_with("FROM debian:bookworm-slim"));
        assert!(dockerfile.contains("EXPOSE 8080"));
        assert!(dockerfile.contains("EXPOSE 9090"));
    }
}
