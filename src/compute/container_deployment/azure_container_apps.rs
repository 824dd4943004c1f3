use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::compute::container_deployment::convert::azure_container_apps as convert;
use crate::compute::container_deployment::convert::ecs::convert_ingress;
use crate::compute::container_deployment::helper::{normalize_traffic_weights, resolve_service_name};
use crate::compute::container_deployment::{ContainerDeploymentProvider, DeploymentError, Feature, Kind};
use crate::compute::container_registry::ContainerRegistry;
use crate::compute::containerizer::Containerizer;
use crate::compute::image_pipeline::{map_images, requires_container_registry};
use crate::model::service::{
    Container, ContainerKind, EnvVar, Ingress, Port, Revision, Scale, ScaleMode, ScaleRule, ScaleRuleKind,
    ServiceDefinition, ServiceItem, TrafficAllocation,
};
use crate::services::azure::arm_client::{ArmClient, ArmClientError};

const API_VERSION: &str = "2024-03-01";
const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(600);

pub struct AzureContainerAppsConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    pub managed_environment_id: String,
    pub service_name: Option<String>,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Container Apps deployment over the ARM REST surface.
pub struct AzureContainerApps {
    config: AzureContainerAppsConfig,
    arm: ArmClient,
    containerizer: Option<Containerizer>,
    container_registry: Option<Arc<ContainerRegistry>>,
}

impl AzureContainerApps {
    pub fn new(config: AzureContainerAppsConfig) -> AzureContainerApps {
        let arm = ArmClient::new(&config.tenant_id, &config.client_id, &config.client_secret);
        AzureContainerApps {
            config,
            arm,
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

    fn app_path(&self, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/containerApps/{}?api-version={}",
            self.config.subscription_id, self.config.resource_group, name, API_VERSION
        )
    }

    fn revision_path(&self, name: &str, revision: &str, action: Option<&str>) -> String {
        let suffix = action.map(|a| format!("/{a}")).unwrap_or_default();
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/containerApps/{}/revisions/{}{}?api-version={}",
            self.config.subscription_id, self.config.resource_group, name, revision, suffix, API_VERSION
        )
    }

    fn get_app(&self, name: &str) -> Result<Option<Value>, DeploymentError> {
        match self.arm.get(&self.app_path(name)) {
            Ok(value) => Ok(Some(value)),
            Err(ArmClientError::NotFound { .. }) => Ok(None),
            Err(e) => Err(DeploymentError::internal(e.to_string())),
        }
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
        Err(DeploymentError::bad_request(
            "A container registry is required to build and push images for Container Apps",
        ))
    }

    fn app_body(&self, service: &ServiceDefinition, images: &[String]) -> Result<Value, DeploymentError> {
        let ingress = convert_ingress(service);
        let mut containers = Vec::new();
        for (container, image) in service.containers.iter().zip(images.iter()) {
            let mut spec = json!({
                "name": container.name,
                "image": image,
            });
            if let Some(command) = &container.command {
                spec["command"] = json!(command);
            }
            if let Some(args) = &container.args {
                spec["args"] = json!(args);
            }
            let env: Vec<Value> = container
                .env
                .iter()
                .map(|env| json!({"name": env.name, "value": env.value.clone().unwrap_or_default()}))
                .collect();
            if !env.is_empty() {
                spec["env"] = json!(env);
            }
            if let Some((cpu, memory)) = container.resources.as_ref().and_then(|r| r.effective_cpu_memory()) {
                spec["resources"] = json!({
                    "cpu": cpu,
                    "memory": convert::memory_mib_to_gi(memory),
                });
            }
            containers.push(spec);
        }

        let mut template = json!({ "containers": containers });
        if let Some(scale) = &service.scale {
            let mut scale_spec = json!({
                "minReplicas": scale.min_replicas.unwrap_or(0),
                "maxReplicas": scale.max_replicas.unwrap_or(10),
            });
            let rules: Vec<Value> = scale
                .rules
                .iter()
                .map(|rule| {
                    let name = rule.name.clone().unwrap_or_else(|| "scale-rule".to_string());
                    match rule.kind {
                        ScaleRuleKind::Http => json!({
                            "name": name,
                            "http": {"metadata": rule.metadata.clone().unwrap_or_default()},
                        }),
                        ScaleRuleKind::Tcp => json!({
                            "name": name,
                            "tcp": {"metadata": rule.metadata.clone().unwrap_or_default()},
                        }),
                        _ => json!({
                            "name": name,
                            "custom": {
                                "type": match rule.kind {
                                    ScaleRuleKind::Cpu => "cpu",
                                    ScaleRuleKind::Memory => "memory",
                                    _ => "external",
                                },
                                "metadata": rule.metadata.clone().unwrap_or_default(),
                            },
                        }),
                    }
                })
                .collect();
            if !rules.is_empty() {
                scale_spec["rules"] = json!(rules);
            }
            template["scale"] = scale_spec;
        }

        let mut configuration = json!({ "activeRevisionsMode": "Multiple" });
        if let Some(target_port) = ingress.target_port {
            configuration["ingress"] = json!({
                "external": ingress.external,
                "targetPort": target_port,
                "transport": "auto",
            });
        }

        Ok(json!({
            "location": self.config.location,
            "properties": {
                "managedEnvironmentId": self.config.managed_environment_id,
                "configuration": configuration,
                "template": template,
            },
        }))
    }

    fn wait_for_provisioned(&self, name: &str) {
        let start = Instant::now();
        loop {
            let state = self
                .get_app(name)
                .ok()
                .flatten()
                .and_then(|app| {
                    app.pointer("/properties/provisioningState")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                });
            match state.as_deref() {
                Some("Succeeded") => {
                    info!("Container app '{}' is provisioned", name);
                    return;
                }
                Some("Failed") | Some("Canceled") => {
                    warn!("Container app '{}' provisioning ended in {:?}", name, state);
                    return;
                }
                _ => {}
            }
            if start.elapsed() > PROVISIONING_TIMEOUT {
                warn!(
                    "Container app '{}' did not provision within {} seconds",
                    name,
                    PROVISIONING_TIMEOUT.as_secs()
                );
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    fn service_item_from_app(&self, name: &str, app: &Value) -> ServiceItem {
        let fqdn = app
            .pointer("/properties/configuration/ingress/fqdn")
            .and_then(|v| v.as_str());
        let uri = fqdn.map(|fqdn| format!("https://{fqdn}"));

        let containers: Vec<Container> = app
            .pointer("/properties/template/containers")
            .and_then(|v| v.as_array())
            .map(|entries| entries.iter().map(container_from_spec).collect())
            .unwrap_or_default();

        let ingress_spec = app.pointer("/properties/configuration/ingress");
        let ingress = ingress_spec.map(|spec| Ingress {
            external: spec.get("external").and_then(|v| v.as_bool()).unwrap_or(false),
            target_port: spec.get("targetPort").and_then(|v| v.as_u64()).map(|p| p as u16),
            port: Some(443),
            transport: spec.get("transport").and_then(|v| v.as_str()).map(str::to_string),
        });

        let scale = app.pointer("/properties/template/scale").map(|spec| Scale {
            mode: ScaleMode::Auto,
            min_replicas: spec.get("minReplicas").and_then(|v| v.as_u64()).map(|v| v as u32),
            max_replicas: spec.get("maxReplicas").and_then(|v| v.as_u64()).map(|v| v as u32),
            rules: spec
                .get("rules")
                .and_then(|v| v.as_array())
                .map(|rules| rules.iter().filter_map(scale_rule_from_spec).collect())
                .unwrap_or_default(),
            ..Default::default()
        });

        let traffic: Option<Vec<TrafficAllocation>> = app
            .pointer("/properties/configuration/ingress/traffic")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let revision = entry
                            .get("revisionName")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)?;
                        Some(TrafficAllocation {
                            revision,
                            percent: entry.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.0),
                            latest_revision: entry
                                .get("latestRevision")
                                .and_then(|v| v.as_bool())
                                .unwrap_or(false),
                            tag: entry.get("label").and_then(|v| v.as_str()).map(str::to_string),
                        })
                    })
                    .collect()
            });

        let latest_ready_revision = app
            .pointer("/properties/latestReadyRevisionName")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let latest_created_revision = app
            .pointer("/properties/latestRevisionName")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        ServiceItem {
            name: name.to_string(),
            uri,
            service: Some(ServiceDefinition {
                name: Some(name.to_string()),
                containers,
                ingress,
                scale,
                traffic,
                latest_ready_revision,
                latest_created_revision,
                ..Default::default()
            }),
        }
    }

    fn revision_from_spec(&self, spec: &Value) -> Option<Revision> {
        let name = spec.get("name").and_then(|v| v.as_str())?.to_string();
        let properties = spec.get("properties")?;
        Some(Revision {
            name,
            traffic: properties.get("trafficWeight").and_then(|v| v.as_f64()),
            created_time: properties
                .get("createdTime")
                .and_then(|v| v.as_str())
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.timestamp() as f64),
            status: properties
                .get("provisioningState")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            active: properties.get("active").and_then(|v| v.as_bool()),
            containers: properties
                .pointer("/template/containers")
                .and_then(|v| v.as_array())
                .map(|entries| entries.iter().map(container_from_spec).collect())
                .unwrap_or_default(),
            volumes: vec![],
        })
    }
}

fn container_from_spec(spec: &Value) -> Container {
    let memory = spec
        .pointer("/resources/memory")
        .and_then(|v| v.as_str())
        .and_then(|quantity| convert::parse_memory_to_mib(quantity).ok());
    let cpu = spec.pointer("/resources/cpu").and_then(|v| v.as_f64());
    let resources = match (cpu, memory) {
        (None, None) => None,
        (cpu, memory) => Some(crate::model::service::ResourceRequirements {
            requests: Some(crate::model::service::ResourceSpec {
                cpu,
                memory,
                gpu: None,
            }),
            ..Default::default()
        }),
    };
    Container {
        name: spec.get("name").and_then(|v| v.as_str()).unwrap_or("main").to_string(),
        kind: ContainerKind::Main,
        image: spec.get("image").and_then(|v| v.as_str()).map(str::to_string),
        command: spec
            .get("command")
            .and_then(|v| v.as_array())
            .map(|v| v.iter().filter_map(|c| c.as_str().map(str::to_string)).collect()),
        args: spec
            .get("args")
            .and_then(|v| v.as_array())
            .map(|v| v.iter().filter_map(|c| c.as_str().map(str::to_string)).collect()),
        env: spec
            .get("env")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        entry.get("name").and_then(|v| v.as_str()).map(|name| EnvVar {
                            name: name.to_string(),
                            value: entry.get("value").and_then(|v| v.as_str()).map(str::to_string),
                            value_from: None,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        ports: Vec::<Port>::new(),
        resources,
        ..Default::default()
    }
}

fn scale_rule_from_spec(spec: &Value) -> Option<ScaleRule> {
    let name = spec.get("name").and_then(|v| v.as_str()).map(str::to_string);
    let (kind, metadata) = if let Some(http) = spec.get("http") {
        (ScaleRuleKind::Http, http.get("metadata").cloned())
    } else if let Some(tcp) = spec.get("tcp") {
        (ScaleRuleKind::Tcp, tcp.get("metadata").cloned())
    } else if let Some(custom) = spec.get("custom") {
        let kind = match custom.get("type").and_then(|v| v.as_str()) {
            Some("cpu") => ScaleRuleKind::Cpu,
            Some("memory") => ScaleRuleKind::Memory,
            _ => ScaleRuleKind::Custom,
        };
        (kind, custom.get("metadata").cloned())
    } else {
        return None;
    };
    Some(ScaleRule {
        kind,
        name,
        metadata: metadata.and_then(|m| serde_json::from_value(m).ok()),
        auth: None,
    })
}

impl ContainerDeploymentProvider for AzureContainerApps {
    fn kind(&self) -> Kind {
        Kind::AzureContainerApps
    }

    fn supports(&self, _feature: Feature) -> bool {
        // Container Apps carries revisions, revision delete and splits.
        true
    }

    fn create_service(
        &self,
        service: &ServiceDefinition,
        where_exists: Option<bool>,
    ) -> Result<ServiceItem, DeploymentError> {
        let name = resolve_service_name(self.config.service_name.as_deref(), service)?;
        let existing = self.get_app(&name)?;
        match (&existing, where_exists) {
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

        let body = self.app_body(service, &images)?;
        self.arm
            .put(&self.app_path(&name), &body)
            .map_err(|e| DeploymentError::internal(e.to_string()))?;
        self.wait_for_provisioned(&name);
        self.get_service(&name)
    }

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError> {
        let app = self
            .get_app(name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        Ok(self.service_item_from_app(name, &app))
    }

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError> {
        if self.get_app(name)?.is_none() {
            return Err(DeploymentError::not_found(format!("Service {name} not found")));
        }
        self.arm
            .delete(&self.app_path(name))
            .map_err(|e| DeploymentError::internal(e.to_string()))?;

        let start = Instant::now();
        while start.elapsed() < PROVISIONING_TIMEOUT {
            if self.get_app(name)?.is_none() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(5));
        }
        warn!("Container app '{}' deletion did not settle in time", name);
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError> {
        let path = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/containerApps?api-version={}",
            self.config.subscription_id, self.config.resource_group, API_VERSION
        );
        let listed = self.arm.get(&path).map_err(|e| DeploymentError::internal(e.to_string()))?;
        Ok(listed
            .get("value")
            .and_then(|v| v.as_array())
            .map(|apps| {
                apps.iter()
                    .filter_map(|app| {
                        let name = app.get("name").and_then(|v| v.as_str())?;
                        Some(self.service_item_from_app(name, app))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_revisions(&self, name: &str, limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError> {
        let path = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.App/containerApps/{}/revisions?api-version={}",
            self.config.subscription_id, self.config.resource_group, name, API_VERSION
        );
        let listed = match self.arm.get(&path) {
            Ok(listed) => listed,
            Err(ArmClientError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Service {name} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        };
        let mut revisions: Vec<Revision> = listed
            .get("value")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|spec| self.revision_from_spec(spec))
                    .collect()
            })
            .unwrap_or_default();
        // Most recent first.
        revisions.sort_by(|a, b| {
            b.created_time
                .unwrap_or_default()
                .partial_cmp(&a.created_time.unwrap_or_default())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            revisions.truncate(limit as usize);
        }
        Ok(revisions)
    }

    fn get_revision(&self, name: &str, revision: &str) -> Result<Revision, DeploymentError> {
        let spec = match self.arm.get(&self.revision_path(name, revision, None)) {
            Ok(spec) => spec,
            Err(ArmClientError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Revision {revision} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        };
        self.revision_from_spec(&spec)
            .ok_or_else(|| DeploymentError::internal("Malformed revision payload"))
    }

    fn delete_revision(&self, name: &str, revision: &str) -> Result<(), DeploymentError> {
        let current = self.get_revision(name, revision)?;
        if current.active == Some(true) {
            return Err(DeploymentError::precondition_failed(
                "Cannot delete the current revision of the service",
            ));
        }
        self.arm
            .post(&self.revision_path(name, revision, Some("deactivate")), None)
            .map_err(|e| DeploymentError::internal(e.to_string()))?;
        Ok(())
    }

    fn update_traffic(&self, name: &str, traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError> {
        let weights = normalize_traffic_weights(traffic)?;
        let entries: Vec<Value> = weights
            .iter()
            .map(|(revision, weight)| json!({"revisionName": revision, "weight": weight}))
            .collect();
        let body = json!({
            "properties": {
                "configuration": {
                    "ingress": {"traffic": entries},
                },
            },
        });
        match self.arm.patch(&self.app_path(name), &body) {
            Ok(_) => {}
            Err(ArmClientError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Service {name} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        }
        self.get_service(name)
    }

    fn close(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
