use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aws_sdk_apprunner::types as apprunner_types;

use crate::compute::container_deployment::convert::aws_app_runner as convert;
use crate::compute::container_deployment::convert::ecs::convert_ingress;
use crate::compute::container_deployment::helper::resolve_service_name;
use crate::compute::container_deployment::{ContainerDeploymentProvider, DeploymentError, Feature, Kind};
use crate::compute::container_registry::{ContainerRegistry, ecr::Ecr};
use crate::compute::containerizer::Containerizer;
use crate::compute::image_pipeline::{map_images, requires_container_registry};
use crate::cmd::docker::Docker;
use crate::model::service::{
    Container, ContainerKind, EnvVar, Ingress, Port, ResourceRequirements, ResourceSpec, Revision, ServiceDefinition,
    ServiceItem, TrafficAllocation,
};
use crate::runtime::block_on;

const RUNNING_TIMEOUT: Duration = Duration::from_secs(600);

pub struct AwsAppRunnerConfig {
    pub region: String,
    pub service_name: Option<String>,
    /// Role App Runner assumes to pull from a private ECR.
    pub access_role_arn: Option<String>,
    pub profile_name: Option<String>,
}

/// App Runner deployment: one container, no revision management, no
/// traffic splitting.
pub struct AwsAppRunner {
    config: AwsAppRunnerConfig,
    client: aws_sdk_apprunner::Client,
    containerizer: Option<Containerizer>,
    container_registry: Option<Arc<ContainerRegistry>>,
}

impl AwsAppRunner {
    pub fn new(config: AwsAppRunnerConfig) -> AwsAppRunner {
        let mut loader = aws_config::defaults(aws_sdk_apprunner::config::BehaviorVersion::latest())
            .region(aws_sdk_apprunner::config::Region::new(config.region.clone()));
        if let Some(profile) = &config.profile_name {
            loader = loader.profile_name(profile);
        }
        let sdk_config = block_on(loader.load());
        AwsAppRunner {
            client: aws_sdk_apprunner::Client::new(&sdk_config),
            config,
            containerizer: None,
            container_registry: None,
        }
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
        let docker = Arc::new(Docker::new(None)?);
        Ok(Some(Arc::new(ContainerRegistry::new(Ecr::new(
            self.config.region.clone(),
            docker,
        )))))
    }

    fn find_service_arn(&self, name: &str) -> Result<Option<String>, DeploymentError> {
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self.client.list_services();
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let page = block_on(request.send())
                .map_err(|e| DeploymentError::internal(format!("list_services failed: {e:?}")))?;
            for summary in page.service_summary_list() {
                if summary.service_name() == Some(name) {
                    return Ok(summary.service_arn().map(str::to_string));
                }
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                return Ok(None);
            }
        }
    }

    fn describe(&self, service_arn: &str) -> Result<apprunner_types::Service, DeploymentError> {
        let output = block_on(self.client.describe_service().service_arn(service_arn).send())
            .map_err(|e| DeploymentError::internal(format!("describe_service failed: {e:?}")))?;
        output
            .service
            .ok_or_else(|| DeploymentError::internal("describe_service returned no service"))
    }

    fn source_configuration(
        &self,
        service: &ServiceDefinition,
        image: &str,
    ) -> Result<apprunner_types::SourceConfiguration, DeploymentError> {
        let ingress = convert_ingress(service);
        let container = &service.containers[0];
        let env: HashMap<String, String> = container
            .env
            .iter()
            .filter_map(|env| env.value.clone().map(|value| (env.name.clone(), value)))
            .collect();

        let mut image_configuration = apprunner_types::ImageConfiguration::builder();
        if let Some(port) = ingress.target_port {
            image_configuration = image_configuration.port(port.to_string());
        }
        if !env.is_empty() {
            image_configuration = image_configuration.set_runtime_environment_variables(Some(env));
        }

        let repository_type = if image.contains("public.ecr.aws") {
            apprunner_types::ImageRepositoryType::EcrPublic
        } else {
            apprunner_types::ImageRepositoryType::Ecr
        };
        let image_repository = apprunner_types::ImageRepository::builder()
            .image_identifier(image)
            .image_repository_type(repository_type)
            .image_configuration(image_configuration.build())
            .build()
            .map_err(|e| DeploymentError::internal(e.to_string()))?;

        let mut source = apprunner_types::SourceConfiguration::builder()
            .image_repository(image_repository)
            .auto_deployments_enabled(false);
        if let Some(access_role_arn) = &self.config.access_role_arn {
            source = source.authentication_configuration(
                apprunner_types::AuthenticationConfiguration::builder()
                    .access_role_arn(access_role_arn)
                    .build(),
            );
        }
        Ok(source.build())
    }

    /// vCPU free-form, memory bucketed to the instance classes.
    fn instance_configuration(
        &self,
        service: &ServiceDefinition,
    ) -> Result<apprunner_types::InstanceConfiguration, DeploymentError> {
        let mut builder = apprunner_types::InstanceConfiguration::builder();
        if let Some((cpu, memory_mib)) = service.containers[0]
            .resources
            .as_ref()
            .and_then(|r| r.effective_cpu_memory())
        {
            let memory_gb = convert::memory_gb_bucket(memory_mib as f64 / 1024.0)?;
            builder = builder
                .cpu(convert::vcpu_string(cpu))
                .memory(convert::memory_string(memory_gb));
        }
        Ok(builder.build())
    }

    fn wait_for_running(&self, service_arn: &str) {
        let start = Instant::now();
        loop {
            if let Ok(service) = self.describe(service_arn) {
                match service.status() {
                    Some(apprunner_types::ServiceStatus::Running) => {
                        info!("App Runner service is running");
                        return;
                    }
                    Some(apprunner_types::ServiceStatus::CreateFailed) => {
                        warn!("App Runner service creation failed");
                        return;
                    }
                    _ => {}
                }
            }
            if start.elapsed() > RUNNING_TIMEOUT {
                warn!(
                    "App Runner service did not reach RUNNING within {} seconds",
                    RUNNING_TIMEOUT.as_secs()
                );
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    fn service_item(&self, service: &apprunner_types::Service) -> ServiceItem {
        let name = service.service_name().unwrap_or_default().to_string();
        let uri = service.service_url().map(|url| format!("https://{url}"));

        let image = service
            .source_configuration()
            .and_then(|source| source.image_repository())
            .and_then(|repo| repo.image_identifier().map(str::to_string));
        let port = service
            .source_configuration()
            .and_then(|source| source.image_repository())
            .and_then(|repo| repo.image_configuration())
            .and_then(|config| config.port())
            .and_then(|port| port.parse::<u16>().ok());
        let env: Vec<EnvVar> = service
            .source_configuration()
            .and_then(|source| source.image_repository())
            .and_then(|repo| repo.image_configuration())
            .map(|config| {
                config
                    .runtime_environment_variables()
                    .map(|vars| {
                        vars.iter()
                            .map(|(name, value)| EnvVar::new(name.clone(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        let resources = service.instance_configuration().and_then(|instance| {
            let cpu = instance.cpu().and_then(|cpu| convert::parse_vcpu(cpu).ok());
            let memory = instance
                .memory()
                .and_then(|memory| convert::parse_memory_gb(memory).ok())
                .map(|gb| (gb * 1024.0) as u32);
            match (cpu, memory) {
                (None, None) => None,
                (cpu, memory) => Some(ResourceRequirements {
                    requests: Some(ResourceSpec { cpu, memory, gpu: None }),
                    ..Default::default()
                }),
            }
        });

        let container = Container {
            name: name.clone(),
            kind: ContainerKind::Main,
            image,
            env,
            ports: port
                .map(|port| {
                    vec![Port {
                        name: None,
                        container_port: port,
                        host_port: None,
                        protocol: Default::default(),
                    }]
                })
                .unwrap_or_default(),
            resources,
            ..Default::default()
        };

        ServiceItem {
            name: name.clone(),
            uri,
            service: Some(ServiceDefinition {
                name: Some(name),
                containers: vec![container],
                ingress: Some(Ingress {
                    external: true,
                    target_port: port,
                    port: Some(443),
                    transport: Some("https".to_string()),
                }),
                ..Default::default()
            }),
        }
    }
}

impl ContainerDeploymentProvider for AwsAppRunner {
    fn kind(&self) -> Kind {
        Kind::AwsAppRunner
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
        let name = resolve_service_name(self.config.service_name.as_deref(), service)?;
        let existing_arn = self.find_service_arn(&name)?;
        match (&existing_arn, where_exists) {
            (Some(_), Some(false)) => {
                return Err(DeploymentError::precondition_failed(format!(
                    "Service {name} already exists"
                )));
            }
            (None, Some(true)) => {
                return Err(DeploymentError::precondition_failed(format!("Service {name} not found")));
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
        let source = self.source_configuration(service, &images[0])?;
        let instance = self.instance_configuration(service)?;

        let service_arn = match existing_arn {
            Some(service_arn) => {
                block_on(
                    self.client
                        .update_service()
                        .service_arn(&service_arn)
                        .source_configuration(source)
                        .instance_configuration(instance)
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("update_service failed: {e:?}")))?;
                service_arn
            }
            None => {
                let created = block_on(
                    self.client
                        .create_service()
                        .service_name(&name)
                        .source_configuration(source)
                        .instance_configuration(instance)
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("create_service failed: {e:?}")))?;
                created
                    .service()
                    .and_then(|s| s.service_arn().map(str::to_string))
                    .ok_or_else(|| DeploymentError::internal("Created service has no arn"))?
            }
        };

        self.wait_for_running(&service_arn);
        Ok(self.service_item(&self.describe(&service_arn)?))
    }

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError> {
        let service_arn = self
            .find_service_arn(name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        Ok(self.service_item(&self.describe(&service_arn)?))
    }

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError> {
        let service_arn = self
            .find_service_arn(name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        block_on(self.client.delete_service().service_arn(&service_arn).send())
            .map_err(|e| DeploymentError::internal(format!("delete_service failed: {e:?}")))?;
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError> {
        let mut services = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self.client.list_services();
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let page = block_on(request.send())
                .map_err(|e| DeploymentError::internal(format!("list_services failed: {e:?}")))?;
            for summary in page.service_summary_list() {
                if let Some(service_arn) = summary.service_arn() {
                    if let Ok(service) = self.describe(service_arn) {
                        services.push(self.service_item(&service));
                    }
                }
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(services)
    }

    fn list_revisions(&self, _name: &str, _limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError> {
        Err(DeploymentError::unsupported("App Runner does not expose revisions"))
    }

    fn get_revision(&self, _name: &str, _revision: &str) -> Result<Revision, DeploymentError> {
        Err(DeploymentError::unsupported("App Runner does not expose revisions"))
    }

    fn delete_revision(&self, _name: &str, _revision: &str) -> Result<(), DeploymentError> {
        Err(DeploymentError::unsupported("App Runner does not expose revisions"))
    }

    fn update_traffic(&self, _name: &str, _traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError> {
        Err(DeploymentError::unsupported("App Runner does not split traffic"))
    }

    fn close(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
