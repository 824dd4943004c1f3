use std::sync::Arc;

use crate::cmd::docker::Docker;
use crate::compute::container_deployment::convert::ecs::convert_ingress;
use crate::compute::container_deployment::helper::resolve_service_name;
use crate::compute::container_deployment::{ContainerDeploymentProvider, DeploymentError, Feature, Kind};
use crate::compute::container_registry::{ContainerRegistry, docker_local as registry_docker_local};
use crate::compute::containerizer::Containerizer;
use crate::compute::image_pipeline::{map_images, requires_container_registry};
use crate::model::service::{
    Container, ContainerKind, EnvVar, Ingress, Port, RestartPolicy, Revision, ServiceDefinition, ServiceItem,
    TrafficAllocation,
};

/// Single-host deployment on the local Docker daemon: one container per
/// service, the container name being the service name.
pub struct DockerLocal {
    docker: Arc<Docker>,
    service_name: Option<String>,
    containerizer: Option<Containerizer>,
    container_registry: Option<Arc<ContainerRegistry>>,
}

impl DockerLocal {
    pub fn new(docker: Arc<Docker>) -> DockerLocal {
        DockerLocal {
            docker,
            service_name: None,
            containerizer: None,
            container_registry: None,
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_containerizer(mut self, containerizer: Containerizer) -> Self {
        self.containerizer = Some(containerizer);
        self
    }

    pub fn with_container_registry(mut self, container_registry: Arc<ContainerRegistry>) -> Self {
        self.container_registry = Some(container_registry);
        self
    }

    fn ensure_container_registry(
        &self,
        service: &ServiceDefinition,
    ) -> Result<Option<Arc<ContainerRegistry>>, DeploymentError> {
        if let Some(registry) = &self.container_registry {
            return Ok(Some(registry.clone()));
        }
        if !requires_container_registry(service) {
            return Ok(None);
        }
        Ok(Some(Arc::new(ContainerRegistry::new(
            registry_docker_local::DockerLocal::new(self.docker.clone()),
        ))))
    }

    fn restart_policy_flag(policy: RestartPolicy) -> &'static str {
        match policy {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "no",
        }
    }

    fn service_item_from_inspect(&self, name: &str, inspect: &serde_json::Value) -> ServiceItem {
        let image = inspect
            .pointer("/Config/Image")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let env: Vec<EnvVar> = inspect
            .pointer("/Config/Env")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.as_str())
                    .filter_map(|entry| entry.split_once('='))
                    .map(|(key, value)| EnvVar::new(key, value))
                    .collect()
            })
            .unwrap_or_default();

        let mut ports: Vec<Port> = Vec::new();
        let mut published_port: Option<u16> = None;
        if let Some(bindings) = inspect.pointer("/HostConfig/PortBindings").and_then(|v| v.as_object()) {
            for (container_port_spec, host_bindings) in bindings {
                let container_port = container_port_spec
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                let host_port = host_bindings
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(|binding| binding.get("HostPort"))
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<u16>().ok());
                if let Some(container_port) = container_port {
                    if published_port.is_none() {
                        published_port = host_port;
                    }
                    ports.push(Port {
                        name: None,
                        container_port,
                        host_port,
                        protocol: Default::default(),
                    });
                }
            }
        }

        let container = Container {
            name: name.to_string(),
            kind: ContainerKind::Main,
            image,
            env,
            ports,
            ..Default::default()
        };
        let ingress = published_port.map(|port| Ingress {
            external: true,
            target_port: container.ports.first().map(|p| p.container_port),
            port: Some(port),
            transport: Some("http".to_string()),
        });

        ServiceItem {
            name: name.to_string(),
            uri: published_port.map(|port| format!("http://localhost:{port}")),
            service: Some(ServiceDefinition {
                name: Some(name.to_string()),
                containers: vec![container],
                ingress,
                ..Default::default()
            }),
        }
    }
}

impl ContainerDeploymentProvider for DockerLocal {
    fn kind(&self) -> Kind {
        Kind::DockerLocal
    }

    fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::MultipleRevisions => false,
            Feature::RevisionDelete => false,
            Feature::MultipleContainers => false,
            Feature::TrafficSplit => false,
        }
    }

    fn create_service(
        &self,
        service: &ServiceDefinition,
        where_exists: Option<bool>,
    ) -> Result<ServiceItem, DeploymentError> {
        let service_name = resolve_service_name(self.service_name.as_deref(), service)?;
        if service.containers.iter().any(|c| c.kind == ContainerKind::Init) {
            return Err(DeploymentError::unsupported(
                "Init containers are not supported on local Docker",
            ));
        }

        let existing = self.docker.inspect_container(&service_name)?;
        match (&existing, where_exists) {
            (Some(_), Some(false)) => {
                return Err(DeploymentError::precondition_failed(format!(
                    "Service {service_name} already exists"
                )));
            }
            (None, Some(true)) => {
                return Err(DeploymentError::precondition_failed(format!(
                    "Service {service_name} not found"
                )));
            }
            _ => {}
        }

        let registry = self.ensure_container_registry(service)?;
        let images = map_images(
            &service.containers,
            &service.images,
            self.containerizer.as_ref(),
            registry.as_deref(),
        )?;

        // Converging means replacing the running container wholesale.
        if existing.is_some() {
            self.docker.remove_container(&service_name, true)?;
        }

        let container = &service.containers[0];
        let image = &images[0];
        let ingress = convert_ingress(service);
        let mut ports: Vec<(u16, u16)> = Vec::new();
        if ingress.external {
            if let (Some(exposed), Some(target)) = (ingress.exposed_port, ingress.target_port) {
                ports.push((exposed, target));
            }
        }
        for port in &container.ports {
            if let Some(host_port) = port.host_port {
                if !ports.iter().any(|(_, target)| *target == port.container_port) {
                    ports.push((host_port, port.container_port));
                }
            }
        }
        let envs: Vec<(String, String)> = container
            .env
            .iter()
            .filter_map(|env| env.value.clone().map(|value| (env.name.clone(), value)))
            .collect();
        let env_refs: Vec<(&str, &str)> = envs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let command: Vec<String> = container
            .command
            .iter()
            .chain(container.args.iter())
            .flatten()
            .cloned()
            .collect();
        let command_refs: Vec<&str> = command.iter().map(String::as_str).collect();

        self.docker.run(
            &service_name,
            image,
            &ports,
            &env_refs,
            true,
            false,
            Some(Self::restart_policy_flag(service.restart_policy)),
            &command_refs,
        )?;

        self.get_service(&service_name)
    }

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError> {
        let inspect = self
            .docker
            .inspect_container(name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        Ok(self.service_item_from_inspect(name, &inspect))
    }

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError> {
        if self.docker.inspect_container(name)?.is_none() {
            return Err(DeploymentError::not_found(format!("Service {name} not found")));
        }
        self.docker.remove_container(name, true)?;
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError> {
        let containers = self.docker.list_containers(None)?;
        let mut services = Vec::new();
        for container in containers {
            if let Some(name) = container.get("Names").and_then(|v| v.as_str()) {
                let name = name.trim_start_matches('/');
                if let Ok(item) = self.get_service(name) {
                    services.push(item);
                }
            }
        }
        Ok(services)
    }

    fn list_revisions(&self, _name: &str, _limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError> {
        Err(DeploymentError::unsupported("Local Docker does not manage revisions"))
    }

    fn get_revision(&self, _name: &str, _revision: &str) -> Result<Revision, DeploymentError> {
        Err(DeploymentError::unsupported("Local Docker does not manage revisions"))
    }

    fn delete_revision(&self, _name: &str, _revision: &str) -> Result<(), DeploymentError> {
        Err(DeploymentError::unsupported("Local Docker does not manage revisions"))
    }

    fn update_traffic(&self, _name: &str, _traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError> {
        Err(DeploymentError::unsupported("Local Docker does not manage traffic"))
    }

    fn close(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
