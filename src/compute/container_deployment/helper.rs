use crate::compute::container_deployment::{
    ContainerDeploymentProvider, DeploymentBackend, DeploymentError, Feature,
};
use crate::model::service::{ContainerKind, EnvVar, ServiceDefinition, ServiceOverlay, TrafficAllocation};

/// Merge overlay env entries over the base env: entries replace on name,
/// base order is preserved, new names append in overlay order.
pub fn merge_env(base_env: &[EnvVar], overlay: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = base_env.to_vec();
    for entry in overlay {
        match merged.iter_mut().find(|existing| existing.name == entry.name) {
            Some(existing) => *existing = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Overlay application: env entries replace base on matching
/// `(container.name, env.name)`; every other field comes from the base.
pub fn merge_service_overlay(mut service: ServiceDefinition, overlay: Option<&ServiceOverlay>) -> ServiceDefinition {
    let Some(overlay) = overlay else {
        return service;
    };
    for container_override in &overlay.containers {
        for container in service.containers.iter_mut() {
            if container.name == container_override.name {
                container.env = merge_env(&container.env, &container_override.env);
            }
        }
    }
    service
}

/// Structural checks every provider shares, including the feature guard
/// against multiple main containers.
pub fn validate_service(service: &ServiceDefinition, backend: &DeploymentBackend) -> Result<(), DeploymentError> {
    let main_containers = service
        .containers
        .iter()
        .filter(|c| c.kind == ContainerKind::Main)
        .count();
    if service.containers.is_empty() {
        return Err(DeploymentError::bad_request("Service requires at least one container"));
    }
    if main_containers == 0 {
        return Err(DeploymentError::bad_request("Service requires one main container"));
    }
    if main_containers > 1 && !backend.supports(Feature::MultipleContainers) {
        return Err(DeploymentError::bad_request(
            "Provider does not support multiple main containers",
        ));
    }
    if let Some(traffic) = &service.traffic {
        if !traffic.is_empty() {
            let total: f64 = traffic.iter().map(|t| t.percent).sum();
            if (total - 100.0).abs() > f64::EPSILON {
                return Err(DeploymentError::bad_request(
                    "Traffic allocation percents must sum to 100",
                ));
            }
        }
    }
    for container in &service.containers {
        for probe_set in container.probes.iter() {
            for probe in [
                probe_set.liveness_probe.as_ref(),
                probe_set.readiness_probe.as_ref(),
                probe_set.startup_probe.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                if probe.action_count() != 1 {
                    return Err(DeploymentError::bad_request(format!(
                        "Probe on container `{}` must define exactly one action",
                        container.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Service name precedence: provider config, then the definition.
pub fn resolve_service_name(
    configured_name: Option<&str>,
    service: &ServiceDefinition,
) -> Result<String, DeploymentError> {
    configured_name
        .map(str::to_string)
        .or_else(|| service.name.clone())
        .ok_or_else(|| DeploymentError::bad_request("Service name must be provided or defined in the service"))
}

/// For providers without traffic splitting: the single revision at 100%.
pub fn single_revision_at_full_traffic(traffic: &[TrafficAllocation]) -> Result<&str, DeploymentError> {
    for allocation in traffic {
        if allocation.percent > 0.0 && allocation.percent < 100.0 {
            return Err(DeploymentError::bad_request("Partial traffic allocation is not supported"));
        }
    }
    traffic
        .iter()
        .find(|allocation| allocation.percent == 100.0)
        .map(|allocation| allocation.revision.as_str())
        .ok_or_else(|| DeploymentError::bad_request("No revision with 100% traffic allocation found"))
}

/// Normalize a split into integer weights summing to 100.
pub fn normalize_traffic_weights(traffic: &[TrafficAllocation]) -> Result<Vec<(String, u32)>, DeploymentError> {
    if traffic.is_empty() {
        return Err(DeploymentError::bad_request("Traffic allocation is required"));
    }
    let mut weights: Vec<(String, u32)> = traffic
        .iter()
        .map(|allocation| (allocation.revision.clone(), allocation.percent.round() as u32))
        .collect();
    let total: u32 = weights.iter().map(|(_, weight)| *weight).sum();
    if total != 100 {
        // Rounding drift lands on the biggest allocation.
        let diff = 100i64 - total as i64;
        if let Some(max_entry) = weights.iter_mut().max_by_key(|(_, weight)| *weight) {
            let adjusted = max_entry.1 as i64 + diff;
            if adjusted < 0 {
                return Err(DeploymentError::bad_request("Traffic allocation percents must sum to 100"));
            }
            max_entry.1 = adjusted as u32;
        }
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::service::{Container, ContainerOverride};

    #[test]
    fn overlay_env_replaces_on_matching_names() {
        let service = ServiceDefinition {
            containers: vec![Container {
                name: "web".to_string(),
                env: vec![EnvVar::new("A", "1"), EnvVar::new("B", "2")],
                ..Default::default()
            }],
            ..Default::default()
        };
        let overlay = ServiceOverlay {
            containers: vec![ContainerOverride {
                name: "web".to_string(),
                env: vec![EnvVar::new("B", "overridden"), EnvVar::new("C", "3")],
            }],
        };
        let merged = merge_service_overlay(service, Some(&overlay));
        let env = &merged.containers[0].env;
        assert_eq!(env.len(), 3);
        assert_eq!(env[0], EnvVar::new("A", "1"));
        assert_eq!(env[1], EnvVar::new("B", "overridden"));
        assert_eq!(env[2], EnvVar::new("C", "3"));
    }

    #[test]
    fn single_revision_traffic_rejects_partial_splits() {
        let traffic = vec![
            TrafficAllocation {
                revision: "rev-1".to_string(),
                percent: 60.0,
                latest_revision: false,
                tag: None,
            },
            TrafficAllocation {
                revision: "rev-2".to_string(),
                percent: 40.0,
                latest_revision: false,
                tag: None,
            },
        ];
        assert!(single_revision_at_full_traffic(&traffic).is_err());

        let traffic = vec![TrafficAllocation {
            revision: "rev-1".to_string(),
            percent: 100.0,
            latest_revision: true,
            tag: None,
        }];
        assert_eq!(single_revision_at_full_traffic(&traffic).unwrap(), "rev-1");
    }

    #[test]
    fn traffic_weights_normalize_to_one_hundred() {
        let traffic = vec![
            TrafficAllocation {
                revision: "rev-1".to_string(),
                percent: 33.4,
                latest_revision: false,
                tag: None,
            },
            TrafficAllocation {
                revision: "rev-2".to_string(),
                percent: 66.6,
                latest_revision: false,
                tag: None,
            },
        ];
        let weights = normalize_traffic_weights(&traffic).unwrap();
        assert_eq!(weights.iter().map(|(_, w)| *w).sum::<u32>(), 100);
    }
}
