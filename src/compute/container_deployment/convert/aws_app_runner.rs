use crate::compute::container_deployment::DeploymentError;

/// Memory buckets App Runner instances come in, in GB.
const MEMORY_BUCKETS_GB: &[f64] = &[0.5, 1.0, 2.0, 3.0, 4.0, 8.0];

/// vCPU count as App Runner renders it, e.g. `0.25 vCPU`, `1 vCPU`.
pub fn vcpu_string(cpu_cores: f64) -> String {
    if cpu_cores.fract().abs() < f64::EPSILON {
        format!("{} vCPU", cpu_cores as u64)
    } else {
        let formatted = format!("{cpu_cores:.2}");
        format!("{} vCPU", formatted.trim_end_matches('0').trim_end_matches('.'))
    }
}

pub fn parse_vcpu(quantity: &str) -> Result<f64, DeploymentError> {
    quantity
        .trim()
        .trim_end_matches("vCPU")
        .trim()
        .parse::<f64>()
        .map_err(|_| DeploymentError::bad_request(format!("Invalid vCPU quantity: {quantity}")))
}

/// Smallest instance memory bucket holding the requested GB.
pub fn memory_gb_bucket(requested_gb: f64) -> Result<f64, DeploymentError> {
    for bucket in MEMORY_BUCKETS_GB {
        if requested_gb <= *bucket {
            return Ok(*bucket);
        }
    }
    Err(DeploymentError::bad_request(format!(
        "Memory {requested_gb}GB exceeds the largest App Runner instance"
    )))
}

pub fn memory_string(memory_gb: f64) -> String {
    if memory_gb.fract().abs() < f64::EPSILON {
        format!("{} GB", memory_gb as u64)
    } else {
        let formatted = format!("{memory_gb:.1}");
        format!("{} GB", formatted.trim_end_matches('0').trim_end_matches('.'))
    }
}

pub fn parse_memory_gb(quantity: &str) -> Result<f64, DeploymentError> {
    quantity
        .trim()
        .trim_end_matches("GB")
        .trim()
        .parse::<f64>()
        .map_err(|_| DeploymentError::bad_request(format!("Invalid memory quantity: {quantity}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_rendering_matches_app_runner_shapes() {
        assert_eq!(vcpu_string(0.25), "0.25 vCPU");
        assert_eq!(vcpu_string(0.5), "0.5 vCPU");
        assert_eq!(vcpu_string(1.0), "1 vCPU");
        assert_eq!(vcpu_string(2.0), "2 vCPU");
        assert_eq!(parse_vcpu("0.25 vCPU").unwrap(), 0.25);
    }

    #[test]
    fn memory_buckets_pick_smallest_fitting() {
        assert_eq!(memory_gb_bucket(0.3).unwrap(), 0.5);
        assert_eq!(memory_gb_bucket(0.5).unwrap(), 0.5);
        assert_eq!(memory_gb_bucket(1.5).unwrap(), 2.0);
        assert_eq!(memory_gb_bucket(5.0).unwrap(), 8.0);
        assert!(memory_gb_bucket(9.0).is_err());
    }

    #[test]
    fn memory_rendering_round_trips() {
        assert_eq!(memory_string(0.5), "0.5 GB");
        assert_eq!(memory_string(2.0), "2 GB");
        assert_eq!(parse_memory_gb("2 GB").unwrap(), 2.0);
        assert_eq!(parse_memory_gb("0.5 GB").unwrap(), 0.5);
    }
}
