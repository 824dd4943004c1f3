use crate::compute::container_deployment::DeploymentError;
use crate::compute::container_deployment::amazon_ecs::{AmazonEcs, AmazonEcsConfig, LaunchKind, NetworkMode};

/// Serverless ECS: the Fargate launch kind with awsvpc networking.
pub fn new(mut config: AmazonEcsConfig) -> Result<AmazonEcs, DeploymentError> {
    config.launch_kind = LaunchKind::Fargate;
    config.network_mode = NetworkMode::Awsvpc;
    AmazonEcs::new(config)
}
