use crate::compute::container_deployment::DeploymentError;

/// Cloud Run CPU quantity to cores: `250m` means 0.25 cores, bare numbers
/// are whole cores.
pub fn parse_cpu_to_cores(quantity: &str) -> Result<f64, DeploymentError> {
    let quantity = quantity.trim();
    if let Some(millicores) = quantity.strip_suffix('m') {
        return millicores
            .parse::<f64>()
            .map(|m| m / 1000.0)
            .map_err(|_| DeploymentError::bad_request(format!("Invalid cpu quantity: {quantity}")));
    }
    quantity
        .parse::<f64>()
        .map_err(|_| DeploymentError::bad_request(format!("Invalid cpu quantity: {quantity}")))
}

/// Cores back to the Cloud Run quantity: sub-core values in millicores,
/// whole cores bare.
pub fn cores_to_cpu_string(cpu_cores: f64) -> String {
    if cpu_cores < 1.0 || cpu_cores.fract().abs() > f64::EPSILON {
        format!("{}m", (cpu_cores * 1000.0).round() as u64)
    } else {
        format!("{}", cpu_cores as u64)
    }
}

/// Memory MiB to the `Mi`/`Gi` quantity Cloud Run expects.
pub fn memory_mib_to_quantity(memory_mib: u32) -> String {
    if memory_mib % 1024 == 0 {
        format!("{}Gi", memory_mib / 1024)
    } else {
        format!("{memory_mib}Mi")
    }
}

pub fn parse_memory_to_mib(quantity: &str) -> Result<u32, DeploymentError> {
    super::azure_container_apps::parse_memory_to_mib(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millicores_parse_to_fractional_cores() {
        assert_eq!(parse_cpu_to_cores("250m").unwrap(), 0.25);
        assert_eq!(parse_cpu_to_cores("1000m").unwrap(), 1.0);
        assert_eq!(parse_cpu_to_cores("2").unwrap(), 2.0);
        assert!(parse_cpu_to_cores("two").is_err());
    }

    #[test]
    fn cores_render_to_millicores_or_bare() {
        assert_eq!(cores_to_cpu_string(0.25), "250m");
        assert_eq!(cores_to_cpu_string(1.0), "1");
        assert_eq!(cores_to_cpu_string(1.5), "1500m");
        assert_eq!(cores_to_cpu_string(4.0), "4");
    }

    #[test]
    fn memory_quantities_prefer_gi_on_whole_gib() {
        assert_eq!(memory_mib_to_quantity(512), "512Mi");
        assert_eq!(memory_mib_to_quantity(1024), "1Gi");
        assert_eq!(memory_mib_to_quantity(1536), "1536Mi");
    }
}
