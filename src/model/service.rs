use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::image::ImageMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Main,
    Init,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
    pub host: Option<String>,
    pub scheme: String,
    pub http_headers: Vec<HttpHeader>,
}

impl Default for HttpGetAction {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            port: 80,
            host: None,
            scheme: "HTTP".to_string(),
            http_headers: vec![],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TcpSocketAction {
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecAction {
    pub command: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GrpcAction {
    pub port: u16,
    #[serde(default)]
    pub service: Option<String>,
}

/// A health probe. Exactly one action must be set; timing fields default
/// per provider at translation time but round-trip losslessly when set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Probe {
    pub http_get: Option<HttpGetAction>,
    pub tcp_socket: Option<TcpSocketAction>,
    pub exec: Option<ExecAction>,
    pub grpc: Option<GrpcAction>,

    pub initial_delay_seconds: Option<u32>,
    pub period_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub success_threshold: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub termination_grace_period_seconds: Option<u32>,
}

impl Probe {
    pub fn action_count(&self) -> usize {
        [
            self.http_get.is_some(),
            self.tcp_socket.is_some(),
            self.exec.is_some(),
            self.grpc.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProbeSet {
    pub liveness_probe: Option<Probe>,
    pub readiness_probe: Option<Probe>,
    pub startup_probe: Option<Probe>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Port {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GpuResource {
    pub count: u32,
    pub r#type: Option<String>,
    pub memory: Option<u32>,
}

impl Default for GpuResource {
    fn default() -> Self {
        Self {
            count: 1,
            r#type: None,
            memory: None,
        }
    }
}

/// CPU in cores, memory in MiB.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpu: Option<f64>,
    pub memory: Option<u32>,
    pub gpu: Option<GpuResource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ResourceRequirements {
    pub requests: Option<ResourceSpec>,
    pub limits: Option<ResourceSpec>,
    pub cpu_idle: bool,
    pub cpu_boost: bool,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            requests: None,
            limits: None,
            cpu_idle: true,
            cpu_boost: false,
        }
    }
}

impl ResourceRequirements {
    /// Limits win over requests when both carry a complete cpu+memory pair.
    pub fn effective_cpu_memory(&self) -> Option<(f64, u32)> {
        if let Some(limits) = &self.limits {
            if let (Some(cpu), Some(memory)) = (limits.cpu, limits.memory) {
                return Some((cpu, memory));
            }
        }
        if let Some(requests) = &self.requests {
            if let (Some(cpu), Some(memory)) = (requests.cpu, requests.memory) {
                return Some((cpu, memory));
            }
        }
        None
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_from: Option<serde_json::Value>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Lifecycle {
    pub pre_stop: Option<ExecAction>,
    pub post_start: Option<ExecAction>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SecurityContext {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub allow_privilege_escalation: Option<bool>,
    pub read_only_root_filesystem: Option<bool>,
    pub privileged: Option<bool>,
    pub capabilities: Option<HashMap<String, Vec<String>>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Container {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ContainerKind,
    pub image: Option<String>,
    pub image_pull_policy: Option<String>,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env: Vec<EnvVar>,
    pub ports: Vec<Port>,
    pub volume_mounts: Vec<VolumeMount>,
    pub resources: Option<ResourceRequirements>,
    pub probes: Option<ProbeSet>,
    pub lifecycle: Option<Lifecycle>,
    pub security_context: Option<SecurityContext>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeKind {
    #[default]
    EmptyDir,
    HostPath,
    Persistent,
    ConfigMap,
    Secret,
    ObjectStorage,
    FileStorage,
    Ephemeral,
    Nfs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Volume {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VolumeKind,
    #[serde(default)]
    pub size_limit: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub config: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    Manual,
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScaleRuleKind {
    Http,
    Tcp,
    Custom,
    Cpu,
    Memory,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScaleRule {
    #[serde(rename = "type")]
    pub kind: ScaleRuleKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub auth: Option<Vec<HashMap<String, String>>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Scale {
    pub mode: ScaleMode,
    pub replicas: Option<u32>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
    pub max_concurrency: Option<u32>,
    pub cooldown_period: Option<u32>,
    pub polling_interval: Option<u32>,
    pub rules: Vec<ScaleRule>,
}

impl Default for Scale {
    fn default() -> Self {
        Self {
            mode: ScaleMode::Auto,
            replicas: Some(1),
            min_replicas: Some(0),
            max_replicas: Some(10),
            max_concurrency: None,
            cooldown_period: Some(300),
            polling_interval: Some(30),
            rules: vec![],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Ingress {
    pub external: bool,
    pub target_port: Option<u16>,
    pub port: Option<u16>,
    pub transport: Option<String>,
}

impl Default for Ingress {
    fn default() -> Self {
        Self {
            external: true,
            target_port: None,
            port: None,
            transport: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrafficAllocation {
    pub revision: String,
    pub percent: f64,
    #[serde(default)]
    pub latest_revision: bool,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Desired state of one container service, in the neutral model.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ServiceDefinition {
    pub name: Option<String>,
    pub images: Vec<ImageMap>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    pub ingress: Option<Ingress>,
    pub scale: Option<Scale>,
    pub traffic: Option<Vec<TrafficAllocation>>,
    pub restart_policy: RestartPolicy,
    pub latest_ready_revision: Option<String>,
    pub latest_created_revision: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerOverride {
    pub name: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Environment-only override merged over a base definition on matching
/// `(container.name, env.name)`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ServiceOverlay {
    pub containers: Vec<ContainerOverride>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Revision {
    pub name: String,
    #[serde(default)]
    pub traffic: Option<f64>,
    #[serde(default)]
    pub created_time: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceItem {
    pub name: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub service: Option<ServiceDefinition>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAuthKind {
    Basic,
    Token,
    #[default]
    Managed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerRegistryCredentials {
    pub server: String,
    #[serde(default)]
    pub auth_type: RegistryAuthKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_action_count_enforces_exactly_one() {
        let mut probe = Probe {
            http_get: Some(HttpGetAction::default()),
            ..Default::default()
        };
        assert_eq!(probe.action_count(), 1);
        probe.tcp_socket = Some(TcpSocketAction { port: 80, host: None });
        assert_eq!(probe.action_count(), 2);
    }

    #[test]
    fn resource_limits_win_over_requests() {
        let resources = ResourceRequirements {
            requests: Some(ResourceSpec {
                cpu: Some(0.25),
                memory: Some(512),
                gpu: None,
            }),
            limits: Some(ResourceSpec {
                cpu: Some(0.5),
                memory: Some(1024),
                gpu: None,
            }),
            ..Default::default()
        };
        assert_eq!(resources.effective_cpu_memory(), Some((0.5, 1024)));
    }

    #[test]
    fn service_definition_round_trips_through_json() {
        let service = ServiceDefinition {
            name: Some("web".to_string()),
            containers: vec![Container {
                name: "web".to_string(),
                image: Some("nginx:latest".to_string()),
                ports: vec![Port {
                    name: None,
                    container_port: 8080,
                    host_port: None,
                    protocol: Protocol::Tcp,
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&service).unwrap();
        let back: ServiceDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(service, back);
    }
}
