use crate::compute::container_deployment::DeploymentError;
use crate::compute::container_deployment::amazon_ecs::{AmazonEcs, AmazonEcsConfig, LaunchKind, NetworkMode};

/// ECS on self-managed EC2 capacity: launch template, auto-scaling group
/// and capacity provider are reconciled alongside the service.
pub fn new(mut config: AmazonEcsConfig) -> Result<AmazonEcs, DeploymentError> {
    config.launch_kind = LaunchKind::Ec2;
    if config.network_mode == NetworkMode::Awsvpc && config.ec2_instance_type.is_none() {
        // Bridge networking is the common default for small instance types.
        config.network_mode = NetworkMode::Bridge;
    }
    AmazonEcs::new(config)
}
