use once_cell::sync::Lazy;
use regex::Regex;

use crate::compute::container_deployment::DeploymentError;
use crate::model::service::{
    Container, ContainerKind, HttpGetAction, Ingress, Probe, ProbeSet, Scale, ScaleMode, ServiceDefinition,
    TcpSocketAction,
};

/// Fargate task sizes: for each CPU class the allowed memory tiers in MiB.
const FARGATE_CONFIGS: &[(u32, &[u32])] = &[
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (
        2048,
        &[4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384],
    ),
    (
        4096,
        &[
            8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456, 20480, 21504, 22528,
            23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720,
        ],
    ),
    (
        8192,
        &[
            16384, 20480, 24576, 28672, 32768, 36864, 40960, 45056, 49152, 53248, 57344, 61440,
        ],
    ),
    (
        16384,
        &[
            32768, 40960, 49152, 57344, 65536, 73728, 81920, 90112, 98304, 106496, 114688, 122880,
        ],
    ),
];

/// Smallest Fargate class fitting the requested cpu (units of 1/1024 vCPU)
/// and, within it, the smallest allowed memory tier fitting the requested
/// MiB.
pub fn fargate_cpu_memory(cpu_units: u32, memory_mib: u32) -> Result<(String, String), DeploymentError> {
    for (cpu_class, memory_tiers) in FARGATE_CONFIGS {
        if cpu_units <= *cpu_class {
            for tier in *memory_tiers {
                if memory_mib <= *tier {
                    return Ok((cpu_class.to_string(), tier.to_string()));
                }
            }
            return Err(DeploymentError::bad_request(format!(
                "Memory {memory_mib}MiB is too large for {cpu_class} CPU"
            )));
        }
    }
    Err(DeploymentError::bad_request(format!("Unsupported CPU value: {cpu_units}")))
}

/// CPU units back to cores, e.g. `256` to 0.25.
pub fn cpu_units_to_cores(cpu_units: u32) -> f64 {
    match cpu_units {
        256 => 0.25,
        512 => 0.5,
        1024 => 1.0,
        2048 => 2.0,
        4096 => 4.0,
        8192 => 8.0,
        16384 => 16.0,
        other => other as f64 / 1024.0,
    }
}

/// Per-container cpu/memory in ECS units, limits winning over requests.
pub fn container_cpu_memory(container: &Container) -> Result<Option<(u32, u32)>, DeploymentError> {
    let Some(resources) = &container.resources else {
        return Ok(None);
    };
    let Some((cpu_cores, memory_mib)) = resources.effective_cpu_memory() else {
        return Ok(None);
    };
    let (cpu, memory) = fargate_cpu_memory((cpu_cores * 1024.0) as u32, memory_mib)?;
    Ok(Some((
        cpu.parse::<u32>().unwrap_or_default(),
        memory.parse::<u32>().unwrap_or_default(),
    )))
}

/// Task-level class: the sum of container allocations quantized to the
/// smallest Fargate class holding them.
pub fn aggregate_cpu_memory(service: &ServiceDefinition) -> Result<(String, String), DeploymentError> {
    let mut total_cpu: u32 = 0;
    let mut total_memory: u32 = 0;
    for container in &service.containers {
        if let Some((cpu, memory)) = container_cpu_memory(container)? {
            total_cpu += cpu;
            total_memory += memory;
        }
    }
    fargate_cpu_memory(total_cpu, total_memory)
}

/// Normalized ingress shape the ECS reconciliation consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct IngressSpec {
    pub external: bool,
    pub target_port: Option<u16>,
    pub exposed_port: Option<u16>,
    pub container_name: Option<String>,
}

pub fn convert_ingress(service: &ServiceDefinition) -> IngressSpec {
    let (external, mut target_port, mut exposed_port) = match &service.ingress {
        Some(Ingress {
            external,
            target_port,
            port,
            ..
        }) => (*external, *target_port, *port),
        None => (true, None, None),
    };

    let mut container_name = None;
    for container in &service.containers {
        if container.kind == ContainerKind::Main && !container.ports.is_empty() {
            container_name = Some(container.name.clone());
            if target_port.is_none() {
                target_port = Some(container.ports[0].container_port);
            }
            break;
        }
    }
    if container_name.is_none() {
        container_name = service
            .containers
            .iter()
            .find(|c| c.kind == ContainerKind::Main)
            .map(|c| c.name.clone());
    }
    if exposed_port.is_none() {
        exposed_port = target_port;
    }

    IngressSpec {
        external,
        target_port,
        exposed_port,
        container_name,
    }
}

pub fn scale_to_desired_count(scale: Option<&Scale>) -> i32 {
    match scale {
        None => 1,
        Some(scale) if scale.mode == ScaleMode::Auto => scale.min_replicas.unwrap_or(1).max(1) as i32,
        Some(scale) => scale.replicas.unwrap_or(1) as i32,
    }
}

/// Container healthcheck in the shell form ECS understands.
#[derive(Clone, Debug, PartialEq)]
pub struct EcsHealthCheck {
    pub command: Vec<String>,
    pub interval: i32,
    pub timeout: i32,
    pub retries: i32,
    pub start_period: i32,
}

pub fn probes_to_healthcheck(probes: Option<&ProbeSet>) -> Option<EcsHealthCheck> {
    let probes = probes?;
    let probe = probes
        .liveness_probe
        .as_ref()
        .or(probes.readiness_probe.as_ref())
        .or(probes.startup_probe.as_ref())?;

    let interval = probe.period_seconds.unwrap_or(30).max(5) as i32;
    let timeout = probe.timeout_seconds.unwrap_or(5).max(2) as i32;
    let retries = probe.failure_threshold.unwrap_or(3).max(1) as i32;
    let start_period = probe.initial_delay_seconds.unwrap_or(0) as i32;

    let command = if let Some(http) = &probe.http_get {
        let scheme = http.scheme.to_ascii_lowercase();
        let host = http.host.as_deref().unwrap_or("127.0.0.1");
        let port = http.port;
        let path = if http.path.is_empty() { "/" } else { http.path.as_str() };
        vec![
            "CMD-SHELL".to_string(),
            format!("curl -fsS {scheme}://{host}:{port}{path} || exit 1"),
        ]
    } else if let Some(tcp) = &probe.tcp_socket {
        let host = tcp.host.as_deref().unwrap_or("127.0.0.1");
        let port = tcp.port;
        vec![
            "CMD-SHELL".to_string(),
            format!("bash -c '</dev/tcp/{host}/{port}' || exit 1"),
        ]
    } else {
        return None;
    };

    Some(EcsHealthCheck {
        command,
        interval,
        timeout,
        retries,
        start_period,
    })
}

static CURL_PROBE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)curl\s+.*?\s+(?P<scheme>https?)://(?P<host>[^:/\s]+)(?::(?P<port>\d+))?(?P<path>/\S*)?").unwrap()
});
static TCP_PROBE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</dev/tcp/(?P<host>[^/]+)/(?P<port>\d+)").unwrap());

/// Parse a healthcheck shell back into a probe set; recognizes exactly
/// the shapes `probes_to_healthcheck` emits.
pub fn healthcheck_to_probes(
    command: &[String],
    interval: i32,
    timeout: i32,
    retries: i32,
    start_period: i32,
) -> Option<ProbeSet> {
    if command.is_empty() {
        return None;
    }
    let shell = if command[0] == "CMD-SHELL" {
        command[1..].join(" ")
    } else {
        command.join(" ")
    };

    let timing = |mut probe: Probe| {
        probe.period_seconds = Some(interval as u32);
        probe.timeout_seconds = Some(timeout as u32);
        probe.failure_threshold = Some(retries as u32);
        probe.initial_delay_seconds = Some(start_period as u32);
        probe
    };

    let probe = if let Some(captures) = CURL_PROBE_RE.captures(&shell) {
        let scheme = captures
            .name("scheme")
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_else(|| "HTTP".to_string());
        let host = captures.name("host").map(|m| m.as_str().to_string());
        let port = captures
            .name("port")
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(80);
        let path = captures
            .name("path")
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Some(timing(Probe {
            http_get: Some(HttpGetAction {
                path,
                port,
                host,
                scheme,
                http_headers: vec![],
            }),
            ..Default::default()
        }))
    } else {
        TCP_PROBE_RE.captures(&shell).map(|captures| {
            let host = captures.name("host").map(|m| m.as_str().to_string());
            let port = captures
                .name("port")
                .and_then(|m| m.as_str().parse::<u16>().ok())
                .unwrap_or(80);
            timing(Probe {
                tcp_socket: Some(TcpSocketAction { port, host }),
                ..Default::default()
            })
        })
    };

    probe.map(|probe| ProbeSet {
        liveness_probe: Some(probe),
        readiness_probe: None,
        startup_probe: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::service::{ResourceRequirements, ResourceSpec};

    #[test]
    fn fargate_quantization_picks_smallest_fitting_class() {
        assert_eq!(fargate_cpu_memory(0, 0).unwrap(), ("256".to_string(), "512".to_string()));
        assert_eq!(fargate_cpu_memory(256, 512).unwrap(), ("256".to_string(), "512".to_string()));
        assert_eq!(fargate_cpu_memory(300, 600).unwrap(), ("512".to_string(), "1024".to_string()));
        assert_eq!(
            fargate_cpu_memory(1024, 3000).unwrap(),
            ("1024".to_string(), "3072".to_string())
        );
        assert_eq!(
            fargate_cpu_memory(8192, 17000).unwrap(),
            ("8192".to_string(), "20480".to_string())
        );
    }

    #[test]
    fn fargate_quantization_rejects_oversized_memory() {
        assert!(fargate_cpu_memory(256, 4096).is_err());
        assert!(fargate_cpu_memory(20000, 1024).is_err());
    }

    #[test]
    fn cpu_units_round_trip_to_cores() {
        assert_eq!(cpu_units_to_cores(256), 0.25);
        assert_eq!(cpu_units_to_cores(1024), 1.0);
        assert_eq!(cpu_units_to_cores(1536), 1.5);
    }

    #[test]
    fn ingress_defaults_from_main_container_port() {
        let service = ServiceDefinition {
            containers: vec![Container {
                name: "web".to_string(),
                ports: vec![crate::model::service::Port {
                    name: None,
                    container_port: 8080,
                    host_port: None,
                    protocol: Default::default(),
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let ingress = convert_ingress(&service);
        assert!(ingress.external);
        assert_eq!(ingress.target_port, Some(8080));
        assert_eq!(ingress.exposed_port, Some(8080));
        assert_eq!(ingress.container_name.as_deref(), Some("web"));
    }

    #[test]
    fn desired_count_prefers_min_replicas_in_auto_mode() {
        let scale = Scale {
            mode: ScaleMode::Auto,
            min_replicas: Some(3),
            ..Default::default()
        };
        assert_eq!(scale_to_desired_count(Some(&scale)), 3);
        let scale = Scale {
            mode: ScaleMode::Manual,
            replicas: Some(5),
            ..Default::default()
        };
        assert_eq!(scale_to_desired_count(Some(&scale)), 5);
        assert_eq!(scale_to_desired_count(None), 1);
    }

    #[test]
    fn http_probe_round_trips_through_healthcheck_shell() {
        let probes = ProbeSet {
            liveness_probe: Some(Probe {
                http_get: Some(HttpGetAction {
                    path: "/healthz".to_string(),
                    port: 8080,
                    host: None,
                    scheme: "HTTP".to_string(),
                    http_headers: vec![],
                }),
                period_seconds: Some(10),
                timeout_seconds: Some(4),
                failure_threshold: Some(2),
                initial_delay_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let healthcheck = probes_to_healthcheck(Some(&probes)).unwrap();
        assert_eq!(healthcheck.command[0], "CMD-SHELL");
        assert_eq!(healthcheck.command[1], "curl -fsS http://127.0.0.1:8080/healthz || exit 1");

        let parsed = healthcheck_to_probes(
            &healthcheck.command,
            healthcheck.interval,
            healthcheck.timeout,
            healthcheck.retries,
            healthcheck.start_period,
        )
        .unwrap();
        let probe = parsed.liveness_probe.unwrap();
        let http = probe.http_get.unwrap();
        assert_eq!(http.path, "/healthz");
        assert_eq!(http.port, 8080);
        assert_eq!(http.scheme, "HTTP");
        assert_eq!(probe.period_seconds, Some(10));
    }

    #[test]
    fn tcp_probe_round_trips_through_healthcheck_shell() {
        let probes = ProbeSet {
            readiness_probe: Some(Probe {
                tcp_socket: Some(TcpSocketAction { port: 5432, host: None }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let healthcheck = probes_to_healthcheck(Some(&probes)).unwrap();
        assert_eq!(healthcheck.command[1], "bash -c '</dev/tcp/127.0.0.1/5432' || exit 1");

        let parsed = healthcheck_to_probes(&healthcheck.command, 30, 5, 3, 0).unwrap();
        let probe = parsed.liveness_probe.unwrap();
        assert_eq!(probe.tcp_socket.unwrap().port, 5432);
    }

    #[test]
    fn aggregate_resources_sum_before_quantizing() {
        let container = |cpu: f64, memory: u32| Container {
            name: "c".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(ResourceSpec {
                    cpu: Some(cpu),
                    memory: Some(memory),
                    gpu: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let service = ServiceDefinition {
            containers: vec![container(0.25, 512), container(0.25, 512)],
            ..Default::default()
        };
        assert_eq!(
            aggregate_cpu_memory(&service).unwrap(),
            ("512".to_string(), "1024".to_string())
        );
    }
}
