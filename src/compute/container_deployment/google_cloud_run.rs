use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::compute::container_deployment::convert::ecs::convert_ingress;
use crate::compute::container_deployment::convert::google_cloud_run as convert;
use crate::compute::container_deployment::helper::{normalize_traffic_weights, resolve_service_name};
use crate::compute::container_deployment::{ContainerDeploymentProvider, DeploymentError, Feature, Kind};
use crate::compute::container_registry::ContainerRegistry;
use crate::compute::containerizer::Containerizer;
use crate::compute::image_pipeline::{map_images, requires_container_registry};
use crate::model::service::{
    Container, ContainerKind, EnvVar, Ingress, Port, Revision, Scale, ScaleMode, ServiceDefinition, ServiceItem,
    TrafficAllocation,
};
use crate::services::gcp::rest_client::{GcpRestClient, GcpRestError};

const RUN_BASE_URL: &str = "https://run.googleapis.com/v2";
const READY_TIMEOUT: Duration = Duration::from_secs(600);

pub struct GoogleCloudRunConfig {
    pub project_id: String,
    pub region: String,
    pub service_name: Option<String>,
}

/// Cloud Run deployment over the Admin API v2 REST surface.
pub struct GoogleCloudRun {
    config: GoogleCloudRunConfig,
    client: GcpRestClient,
    containerizer: Option<Containerizer>,
    container_registry: Option<Arc<ContainerRegistry>>,
}

impl GoogleCloudRun {
    pub fn new(config: GoogleCloudRunConfig) -> Result<GoogleCloudRun, DeploymentError> {
        let client = GcpRestClient::new().map_err(|e| DeploymentError::internal(e.to_string()))?;
        Ok(GoogleCloudRun {
            config,
            client,
            containerizer: None,
            container_registry: None,
        })
    }

    pub fn with_containerizer(mut self, containerizer: Containerizer) -> Self {
        self.containerizer = Some(containerizer);
        self
    }

    pub fn with_container_registry(mut self, container_registry: Arc<ContainerRegistry>) -> Self {
        self.container_registry = Some(container_registry);
        self
    }

    fn parent(&self) -> String {
        format!(
            "{RUN_BASE_URL}/projects/{}/locations/{}",
            self.config.project_id, self.config.region
        )
    }

    fn service_url(&self, name: &str) -> String {
        format!("{}/services/{}", self.parent(), name)
    }

    fn get_raw_service(&self, name: &str) -> Result<Option<Value>, DeploymentError> {
        match self.client.get(&self.service_url(name)) {
            Ok(value) => Ok(Some(value)),
            Err(GcpRestError::NotFound { .. }) => Ok(None),
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
            "A container registry is required to build and push images for Cloud Run",
        ))
    }

    fn service_body(&self, service: &ServiceDefinition, images: &[String]) -> Value {
        let ingress = convert_ingress(service);
        let mut containers = Vec::new();
        for (container, image) in service.containers.iter().zip(images.iter()) {
            let mut spec = json!({ "image": image });
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
            if container.kind == ContainerKind::Main {
                if let Some(target_port) = ingress.target_port {
                    spec["ports"] = json!([{"containerPort": target_port}]);
                }
            }
            if let Some((cpu, memory)) = container.resources.as_ref().and_then(|r| r.effective_cpu_memory()) {
                spec["resources"] = json!({
                    "limits": {
                        "cpu": convert::cores_to_cpu_string(cpu),
                        "memory": convert::memory_mib_to_quantity(memory),
                    },
                });
            }
            containers.push(spec);
        }

        let mut template = json!({ "containers": containers });
        if let Some(scale) = &service.scale {
            template["scaling"] = json!({
                "minInstanceCount": scale.min_replicas.unwrap_or(0),
                "maxInstanceCount": scale.max_replicas.unwrap_or(10),
            });
            if let Some(concurrency) = scale.max_concurrency {
                template["maxInstanceRequestConcurrency"] = json!(concurrency);
            }
        }

        json!({
            "template": template,
            "ingress": if ingress.external { "INGRESS_TRAFFIC_ALL" } else { "INGRESS_TRAFFIC_INTERNAL_ONLY" },
        })
    }

    fn wait_for_ready(&self, name: &str) {
        let start = Instant::now();
        loop {
            if let Ok(Some(raw)) = self.get_raw_service(name) {
                let reconciling = raw.get("reconciling").and_then(|v| v.as_bool()).unwrap_or(false);
                let ready = raw
                    .get("latestReadyRevision")
                    .and_then(|v| v.as_str())
                    .map(|r| !r.is_empty())
                    .unwrap_or(false);
                if !reconciling && ready {
                    info!("Cloud Run service '{}' is ready", name);
                    return;
                }
            }
            if start.elapsed() > READY_TIMEOUT {
                warn!(
                    "Cloud Run service '{}' did not become ready within {} seconds",
                    name,
                    READY_TIMEOUT.as_secs()
                );
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    fn service_item_from_raw(&self, name: &str, raw: &Value) -> ServiceItem {
        let uri = raw.get("uri").and_then(|v| v.as_str()).map(str::to_string);

        let containers: Vec<Container> = raw
            .pointer("/template/containers")
            .and_then(|v| v.as_array())
            .map(|entries| entries.iter().map(container_from_spec).collect())
            .unwrap_or_default();

        let scale = raw.pointer("/template/scaling").map(|scaling| Scale {
            mode: ScaleMode::Auto,
            min_replicas: scaling.get("minInstanceCount").and_then(|v| v.as_u64()).map(|v| v as u32),
            max_replicas: scaling.get("maxInstanceCount").and_then(|v| v.as_u64()).map(|v| v as u32),
            max_concurrency: raw
                .pointer("/template/maxInstanceRequestConcurrency")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            ..Default::default()
        });

        let traffic: Option<Vec<TrafficAllocation>> = raw.get("trafficStatuses").or(raw.get("traffic")).and_then(|v| v.as_array()).map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let revision = entry
                        .get("revision")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_default();
                    let latest = entry
                        .get("type")
                        .and_then(|v| v.as_str())
                        .map(|t| t == "TRAFFIC_TARGET_ALLOCATION_TYPE_LATEST")
                        .unwrap_or(false);
                    Some(TrafficAllocation {
                        revision,
                        percent: entry.get("percent").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        latest_revision: latest,
                        tag: entry.get("tag").and_then(|v| v.as_str()).map(str::to_string),
                    })
                })
                .collect()
        });

        let external = raw
            .get("ingress")
            .and_then(|v| v.as_str())
            .map(|v| v == "INGRESS_TRAFFIC_ALL")
            .unwrap_or(true);
        let target_port = containers
            .first()
            .and_then(|c| c.ports.first())
            .map(|p| p.container_port);

        ServiceItem {
            name: name.to_string(),
            uri,
            service: Some(ServiceDefinition {
                name: Some(name.to_string()),
                containers,
                ingress: Some(Ingress {
                    external,
                    target_port,
                    port: Some(443),
                    transport: Some("https".to_string()),
                }),
                scale,
                traffic,
                latest_ready_revision: raw
                    .get("latestReadyRevision")
                    .and_then(|v| v.as_str())
                    .map(short_revision_name),
                latest_created_revision: raw
                    .get("latestCreatedRevision")
                    .and_then(|v| v.as_str())
                    .map(short_revision_name),
                ..Default::default()
            }),
        }
    }

    fn revision_from_raw(&self, raw: &Value, serving_revision: Option<&str>) -> Option<Revision> {
        let full_name = raw.get("name").and_then(|v| v.as_str())?;
        let name = short_revision_name(full_name);
        let active = serving_revision.map(|serving| serving == name);
        Some(Revision {
            traffic: active.map(|is_active| if is_active { 100.0 } else { 0.0 }),
            created_time: raw
                .get("createTime")
                .and_then(|v| v.as_str())
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(|dt| dt.timestamp() as f64),
            status: raw
                .get("reconciling")
                .and_then(|v| v.as_bool())
                .map(|r| if r { "RECONCILING" } else { "READY" }.to_string()),
            active,
            containers: raw
                .get("containers")
                .and_then(|v| v.as_array())
                .map(|entries| entries.iter().map(container_from_spec).collect())
                .unwrap_or_default(),
            volumes: vec![],
            name,
        })
    }
}

fn short_revision_name(full_name: &str) -> String {
    full_name.rsplit('/').next().unwrap_or(full_name).to_string()
}

fn container_from_spec(spec: &Value) -> Container {
    let cpu = spec
        .pointer("/resources/limits/cpu")
        .and_then(|v| v.as_str())
        .and_then(|quantity| convert::parse_cpu_to_cores(quantity).ok());
    let memory = spec
        .pointer("/resources/limits/memory")
        .and_then(|v| v.as_str())
        .and_then(|quantity| convert::parse_memory_to_mib(quantity).ok());
    let resources = match (cpu, memory) {
        (None, None) => None,
        (cpu, memory) => Some(crate::model::service::ResourceRequirements {
            limits: Some(crate::model::service::ResourceSpec {
                cpu,
                memory,
                gpu: None,
            }),
            ..Default::default()
        }),
    };
    Container {
        name: spec
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("main")
            .to_string(),
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
        ports: spec
            .get("ports")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        entry
                            .get("containerPort")
                            .and_then(|v| v.as_u64())
                            .map(|port| Port {
                                name: None,
                                container_port: port as u16,
                                host_port: None,
                                protocol: Default::default(),
                            })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        resources,
        ..Default::default()
    }
}

impl ContainerDeploymentProvider for GoogleCloudRun {
    fn kind(&self) -> Kind {
        Kind::GoogleCloudRun
    }

    fn supports(&self, _feature: Feature) -> bool {
        // Cloud Run carries revisions, revision delete and splits.
        true
    }

    fn create_service(
        &self,
        service: &ServiceDefinition,
        where_exists: Option<bool>,
    ) -> Result<ServiceItem, DeploymentError> {
        let name = resolve_service_name(self.config.service_name.as_deref(), service)?;
        let existing = self.get_raw_service(&name)?;
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
        let body = self.service_body(service, &images);

        if existing.is_some() {
            self.client
                .patch(&self.service_url(&name), &body)
                .map_err(|e| DeploymentError::internal(e.to_string()))?;
        } else {
            let create_url = format!("{}/services?serviceId={}", self.parent(), name);
            self.client
                .post(&create_url, &body)
                .map_err(|e| DeploymentError::internal(e.to_string()))?;
        }
        self.wait_for_ready(&name);
        self.get_service(&name)
    }

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError> {
        let raw = self
            .get_raw_service(name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        Ok(self.service_item_from_raw(name, &raw))
    }

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError> {
        if self.get_raw_service(name)?.is_none() {
            return Err(DeploymentError::not_found(format!("Service {name} not found")));
        }
        self.client
            .delete(&self.service_url(name))
            .map_err(|e| DeploymentError::internal(e.to_string()))?;

        let start = Instant::now();
        while start.elapsed() < READY_TIMEOUT {
            if self.get_raw_service(name)?.is_none() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(5));
        }
        warn!("Cloud Run service '{}' deletion did not settle in time", name);
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError> {
        let url = format!("{}/services", self.parent());
        let listed = self.client.get(&url).map_err(|e| DeploymentError::internal(e.to_string()))?;
        Ok(listed
            .get("services")
            .and_then(|v| v.as_array())
            .map(|services| {
                services
                    .iter()
                    .filter_map(|raw| {
                        let name = raw.get("name").and_then(|v| v.as_str())?;
                        let short = short_revision_name(name);
                        Some(self.service_item_from_raw(&short, raw))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_revisions(&self, name: &str, limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError> {
        let service = self.get_service(name)?;
        let serving = service
            .service
            .as_ref()
            .and_then(|s| s.latest_ready_revision.clone());

        let url = format!("{}/revisions", self.service_url(name));
        let listed = match self.client.get(&url) {
            Ok(listed) => listed,
            Err(GcpRestError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Service {name} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        };
        let mut revisions: Vec<Revision> = listed
            .get("revisions")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|raw| self.revision_from_raw(raw, serving.as_deref()))
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
        let service = self.get_service(name)?;
        let serving = service
            .service
            .as_ref()
            .and_then(|s| s.latest_ready_revision.clone());
        let url = format!("{}/revisions/{}", self.service_url(name), revision);
        let raw = match self.client.get(&url) {
            Ok(raw) => raw,
            Err(GcpRestError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Revision {revision} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        };
        self.revision_from_raw(&raw, serving.as_deref())
            .ok_or_else(|| DeploymentError::internal("Malformed revision payload"))
    }

    fn delete_revision(&self, name: &str, revision: &str) -> Result<(), DeploymentError> {
        let current = self.get_revision(name, revision)?;
        if current.active == Some(true) {
            return Err(DeploymentError::precondition_failed(
                "Cannot delete the current revision of the service",
            ));
        }
        let url = format!("{}/revisions/{}", self.service_url(name), revision);
        self.client
            .delete(&url)
            .map_err(|e| DeploymentError::internal(e.to_string()))?;
        Ok(())
    }

    fn update_traffic(&self, name: &str, traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError> {
        let weights = normalize_traffic_weights(traffic)?;
        let entries: Vec<Value> = weights
            .iter()
            .map(|(revision, weight)| {
                json!({
                    "type": "TRAFFIC_TARGET_ALLOCATION_TYPE_REVISION",
                    "revision": revision,
                    "percent": weight,
                })
            })
            .collect();
        let body = json!({ "traffic": entries });
        match self.client.patch(&self.service_url(name), &body) {
            Ok(_) => {}
            Err(GcpRestError::NotFound { .. }) => {
                return Err(DeploymentError::not_found(format!("Service {name} not found")));
            }
            Err(e) => return Err(DeploymentError::internal(e.to_string())),
        }
        self.wait_for_ready(name);
        self.get_service(name)
    }

    fn close(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
