use crate::compute::container_deployment::DeploymentError;

/// MiB to the `Gi` quantity string Container Apps expects: two decimals,
/// trailing zeros stripped, e.g. 512 to `0.5Gi`, 1024 to `1Gi`.
pub fn memory_mib_to_gi(memory_mib: u32) -> String {
    let gi = memory_mib as f64 / 1024.0;
    let formatted = format!("{gi:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}Gi")
}

/// Parse a quantity with a Mi, Gi, or Ti suffix back into MiB.
pub fn parse_memory_to_mib(quantity: &str) -> Result<u32, DeploymentError> {
    let quantity = quantity.trim();
    let (number, multiplier) = if let Some(value) = quantity.strip_suffix("Mi") {
        (value, 1.0)
    } else if let Some(value) = quantity.strip_suffix("Gi") {
        (value, 1024.0)
    } else if let Some(value) = quantity.strip_suffix("Ti") {
        (value, 1024.0 * 1024.0)
    } else {
        return Err(DeploymentError::bad_request(format!("Invalid memory quantity: {quantity}")));
    };
    number
        .trim()
        .parse::<f64>()
        .map(|value| (value * multiplier).round() as u32)
        .map_err(|_| DeploymentError::bad_request(format!("Invalid memory quantity: {quantity}")))
}

/// CPU cores the way ACA renders them: fractional values keep up to two
/// decimals, whole values drop them.
pub fn cpu_cores_string(cpu_cores: f64) -> String {
    if (cpu_cores.fract()).abs() < f64::EPSILON {
        format!("{}", cpu_cores as u64)
    } else {
        let formatted = format!("{cpu_cores:.2}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

pub fn parse_cpu_cores(quantity: &str) -> Result<f64, DeploymentError> {
    quantity
        .trim()
        .parse::<f64>()
        .map_err(|_| DeploymentError::bad_request(format!("Invalid cpu quantity: {quantity}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_gi_encoding_trims_trailing_zeros() {
        assert_eq!(memory_mib_to_gi(512), "0.5Gi");
        assert_eq!(memory_mib_to_gi(1024), "1Gi");
        assert_eq!(memory_mib_to_gi(1536), "1.5Gi");
        assert_eq!(memory_mib_to_gi(2560), "2.5Gi");
        assert_eq!(memory_mib_to_gi(256), "0.25Gi");
    }

    #[test]
    fn memory_parsing_accepts_mi_gi_ti() {
        assert_eq!(parse_memory_to_mib("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_to_mib("0.5Gi").unwrap(), 512);
        assert_eq!(parse_memory_to_mib("1Gi").unwrap(), 1024);
        assert_eq!(parse_memory_to_mib("1Ti").unwrap(), 1024 * 1024);
        assert!(parse_memory_to_mib("12MB").is_err());
    }

    #[test]
    fn cpu_rendering_handles_whole_and_fractional_cores() {
        assert_eq!(cpu_cores_string(0.25), "0.25");
        assert_eq!(cpu_cores_string(0.5), "0.5");
        assert_eq!(cpu_cores_string(1.0), "1");
        assert_eq!(cpu_cores_string(2.0), "2");
    }
}
