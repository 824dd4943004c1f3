use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aws_sdk_ecs::types as ecs_types;
use aws_sdk_elasticloadbalancingv2::types as elbv2_types;
use base64::Engine;

use crate::cmd::docker::Docker;
use crate::compute::container_deployment::convert::ecs as convert;
use crate::compute::container_deployment::ec2_helper;
use crate::compute::container_deployment::helper::{resolve_service_name, single_revision_at_full_traffic};
use crate::compute::container_deployment::{ContainerDeploymentProvider, DeploymentError, Feature, Kind};
use crate::compute::container_registry::{ContainerRegistry, ecr::Ecr};
use crate::compute::containerizer::Containerizer;
use crate::compute::image_pipeline::{map_images, requires_container_registry};
use crate::model::service::{
    Container, ContainerKind, EnvVar, Port, Protocol, ResourceRequirements, ResourceSpec, Revision, Scale, ScaleMode,
    ScaleRule, ScaleRuleKind, ServiceDefinition, ServiceItem, TrafficAllocation, Volume, VolumeKind, VolumeMount,
};
use crate::runtime::block_on;

const EXECUTION_ROLE_NAME: &str = "ECSTaskExecutionRole";
const EXECUTION_ROLE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";
const INSTANCE_ROLE_NAME: &str = "ecsInstanceRole";
const INSTANCE_ROLE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role";
const SERVICE_STABLE_TIMEOUT: Duration = Duration::from_secs(600);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LaunchKind {
    #[default]
    Fargate,
    Ec2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkMode {
    #[default]
    Awsvpc,
    Bridge,
    Host,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Awsvpc => "awsvpc",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

/// Typed provider configuration; unset fields are detected or created.
#[derive(Default)]
pub struct AmazonEcsConfig {
    pub region: String,
    pub cluster_name: Option<String>,
    pub service_name: Option<String>,
    pub launch_kind: LaunchKind,
    pub network_mode: NetworkMode,

    pub ec2_ami_id: Option<String>,
    pub ec2_instance_type: Option<String>,
    pub ec2_min_size: Option<i32>,
    pub ec2_max_size: Option<i32>,
    pub ec2_desired_capacity: Option<i32>,
    pub ec2_target_capacity: Option<i32>,
    pub ec2_launch_template_id: Option<String>,
    pub ec2_launch_template_version: Option<String>,
    pub ec2_auto_scaling_group_arn: Option<String>,
    pub ecs_instance_profile_arn: Option<String>,

    pub capacity_providers: Option<Vec<String>>,

    pub vpc_id: Option<String>,
    pub subnet_ids: Vec<String>,
    pub execution_role_arn: Option<String>,
    pub task_role_arn: Option<String>,
    pub ecs_security_group_id: Option<String>,
    pub alb_security_group_id: Option<String>,
    pub target_group_arn: Option<String>,

    pub profile_name: Option<String>,
}

/// Declarative reconciliation of ECS services, shared by the Fargate and
/// EC2 launch kinds.
pub struct AmazonEcs {
    config: AmazonEcsConfig,
    ecs_client: aws_sdk_ecs::Client,
    ec2_client: aws_sdk_ec2::Client,
    iam_client: aws_sdk_iam::Client,
    elbv2_client: aws_sdk_elasticloadbalancingv2::Client,
    application_autoscaling_client: aws_sdk_applicationautoscaling::Client,
    autoscaling_client: aws_sdk_autoscaling::Client,
    containerizer: Option<Containerizer>,
    container_registry: Option<Arc<ContainerRegistry>>,
}

impl AmazonEcs {
    pub fn new(config: AmazonEcsConfig) -> Result<AmazonEcs, DeploymentError> {
        if config.launch_kind == LaunchKind::Fargate && config.network_mode != NetworkMode::Awsvpc {
            return Err(DeploymentError::bad_request("Fargate only supports 'awsvpc' network_mode"));
        }
        let mut loader = aws_config::defaults(aws_sdk_ecs::config::BehaviorVersion::latest())
            .region(aws_sdk_ecs::config::Region::new(config.region.clone()));
        if let Some(profile) = &config.profile_name {
            loader = loader.profile_name(profile);
        }
        let sdk_config = block_on(loader.load());

        Ok(AmazonEcs {
            ecs_client: aws_sdk_ecs::Client::new(&sdk_config),
            ec2_client: aws_sdk_ec2::Client::new(&sdk_config),
            iam_client: aws_sdk_iam::Client::new(&sdk_config),
            elbv2_client: aws_sdk_elasticloadbalancingv2::Client::new(&sdk_config),
            application_autoscaling_client: aws_sdk_applicationautoscaling::Client::new(&sdk_config),
            autoscaling_client: aws_sdk_autoscaling::Client::new(&sdk_config),
            containerizer: None,
            container_registry: None,
            config,
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

    fn cluster_name(&self, service_name: &str) -> String {
        self.config
            .cluster_name
            .clone()
            .unwrap_or_else(|| format!("{service_name}-cluster"))
    }

    /// Default ECR registry when containers need a build+push and the
    /// caller supplied no registry.
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
        let docker = Arc::new(Docker::new(None)?);
        let registry = ContainerRegistry::new(Ecr::new(self.config.region.clone(), docker));
        Ok(Some(Arc::new(registry)))
    }

    fn describe_service(
        &self,
        cluster_name: &str,
        service_name: &str,
    ) -> Result<Option<ecs_types::Service>, DeploymentError> {
        match block_on(
            self.ecs_client
                .describe_services()
                .cluster(cluster_name)
                .services(service_name)
                .send(),
        ) {
            Ok(output) => Ok(output.services().first().cloned()),
            Err(err) => {
                if err.to_string().contains("ClusterNotFound") {
                    Ok(None)
                } else {
                    Err(DeploymentError::internal(format!("describe_services failed: {err:?}")))
                }
            }
        }
    }

    fn network_config(&self) -> Result<(String, Vec<String>), DeploymentError> {
        let (vpc_id, subnet_ids) = ec2_helper::auto_detect_network_config(
            &self.ec2_client,
            self.config.vpc_id.as_deref(),
            &self.config.subnet_ids,
        )?;
        match (vpc_id, subnet_ids) {
            (Some(vpc_id), subnet_ids) if !subnet_ids.is_empty() => Ok((vpc_id, subnet_ids)),
            _ => Err(DeploymentError::bad_request("VPC ID is required for AWS ECS deployment")),
        }
    }

    fn ensure_cluster(&self, cluster_name: &str) -> Result<(), DeploymentError> {
        let (capacity_providers, strategy) = self.default_capacity_providers();
        let described = block_on(self.ecs_client.describe_clusters().clusters(cluster_name).send())
            .map_err(|e| DeploymentError::internal(format!("describe_clusters failed: {e:?}")))?;
        let active = described
            .clusters()
            .first()
            .map(|c| c.status() == Some("ACTIVE"))
            .unwrap_or(false);
        if active {
            info!("ECS cluster already exists: {}", cluster_name);
            return Ok(());
        }

        let mut request = self.ecs_client.create_cluster().cluster_name(cluster_name);
        if let Some(capacity_providers) = capacity_providers {
            request = request.set_capacity_providers(Some(capacity_providers));
        }
        if let Some(strategy) = strategy {
            request = request.set_default_capacity_provider_strategy(Some(strategy));
        }
        block_on(request.send()).map_err(|e| DeploymentError::internal(format!("create_cluster failed: {e:?}")))?;
        info!("Created ECS cluster: {}", cluster_name);
        Ok(())
    }

    fn default_capacity_providers(
        &self,
    ) -> (Option<Vec<String>>, Option<Vec<ecs_types::CapacityProviderStrategyItem>>) {
        let capacity_providers = match (&self.config.capacity_providers, self.config.launch_kind) {
            (Some(providers), _) => Some(providers.clone()),
            (None, LaunchKind::Fargate) => Some(vec!["FARGATE".to_string()]),
            (None, LaunchKind::Ec2) => None,
        };
        let strategy = capacity_providers.as_ref().map(|providers| {
            providers
                .iter()
                .filter_map(|provider| {
                    ecs_types::CapacityProviderStrategyItem::builder()
                        .capacity_provider(provider)
                        .weight(1)
                        .build()
                        .ok()
                })
                .collect()
        });
        (capacity_providers, strategy)
    }

    fn delete_cluster(&self, cluster_name: &str) -> Result<(), DeploymentError> {
        let remaining = block_on(self.ecs_client.list_services().cluster(cluster_name).send())
            .map(|output| output.service_arns().to_vec())
            .unwrap_or_default();
        if remaining.is_empty() {
            let _ = block_on(self.ecs_client.delete_cluster().cluster(cluster_name).send());
            info!("Deleted ECS cluster: {}", cluster_name);
        }
        Ok(())
    }

    fn ensure_execution_role(&self) -> Result<String, DeploymentError> {
        if let Some(arn) = &self.config.execution_role_arn {
            return Ok(arn.clone());
        }
        let trust_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"Service": "ecs-tasks.amazonaws.com"},
                "Action": "sts:AssumeRole",
            }],
        });

        let role_arn = match block_on(
            self.iam_client
                .create_role()
                .role_name(EXECUTION_ROLE_NAME)
                .assume_role_policy_document(trust_policy.to_string())
                .description("Role for ECS tasks to pull from ECR")
                .send(),
        ) {
            Ok(created) => created
                .role()
                .and_then(|r| r.arn().map(str::to_string))
                .ok_or_else(|| DeploymentError::internal("Created role has no arn"))?,
            Err(err) => {
                let already_exists = err
                    .to_string()
                    .contains("EntityAlreadyExists");
                if !already_exists {
                    return Err(DeploymentError::internal(format!("create_role failed: {err:?}")));
                }
                let existing = block_on(self.iam_client.get_role().role_name(EXECUTION_ROLE_NAME).send())
                    .map_err(|e| DeploymentError::internal(format!("get_role failed: {e:?}")))?;
                existing
                    .role()
                    .and_then(|r| r.arn().map(str::to_string))
                    .ok_or_else(|| DeploymentError::internal("Existing role has no arn"))?
            }
        };

        block_on(
            self.iam_client
                .attach_role_policy()
                .role_name(EXECUTION_ROLE_NAME)
                .policy_arn(EXECUTION_ROLE_POLICY_ARN)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("attach_role_policy failed: {e:?}")))?;
        Ok(role_arn)
    }

    fn delete_execution_role(&self) {
        let _ = block_on(
            self.iam_client
                .detach_role_policy()
                .role_name(EXECUTION_ROLE_NAME)
                .policy_arn(EXECUTION_ROLE_POLICY_ARN)
                .send(),
        );
        let _ = block_on(self.iam_client.delete_role().role_name(EXECUTION_ROLE_NAME).send());
        info!("Deleted ECS execution role: {}", EXECUTION_ROLE_NAME);
    }

    fn ensure_instance_profile(&self) -> Result<String, DeploymentError> {
        if let Some(arn) = &self.config.ecs_instance_profile_arn {
            return Ok(arn.clone());
        }
        let assume_role_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"Service": "ec2.amazonaws.com"},
                "Action": "sts:AssumeRole",
            }],
        });

        if block_on(self.iam_client.get_role().role_name(INSTANCE_ROLE_NAME).send()).is_err() {
            block_on(
                self.iam_client
                    .create_role()
                    .role_name(INSTANCE_ROLE_NAME)
                    .assume_role_policy_document(assume_role_policy.to_string())
                    .description("Allows EC2 instances to call ECS and related AWS services")
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("create_role failed: {e:?}")))?;
            info!("Created IAM role {}", INSTANCE_ROLE_NAME);
        }

        let attached = block_on(
            self.iam_client
                .list_attached_role_policies()
                .role_name(INSTANCE_ROLE_NAME)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("list_attached_role_policies failed: {e:?}")))?;
        let has_policy = attached
            .attached_policies()
            .iter()
            .any(|p| p.policy_arn() == Some(INSTANCE_ROLE_POLICY_ARN));
        if !has_policy {
            block_on(
                self.iam_client
                    .attach_role_policy()
                    .role_name(INSTANCE_ROLE_NAME)
                    .policy_arn(INSTANCE_ROLE_POLICY_ARN)
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("attach_role_policy failed: {e:?}")))?;
        }

        if block_on(
            self.iam_client
                .get_instance_profile()
                .instance_profile_name(INSTANCE_ROLE_NAME)
                .send(),
        )
        .is_err()
        {
            block_on(
                self.iam_client
                    .create_instance_profile()
                    .instance_profile_name(INSTANCE_ROLE_NAME)
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("create_instance_profile failed: {e:?}")))?;
            info!("Created instance profile {}", INSTANCE_ROLE_NAME);
        }

        let profile = block_on(
            self.iam_client
                .get_instance_profile()
                .instance_profile_name(INSTANCE_ROLE_NAME)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("get_instance_profile failed: {e:?}")))?;
        let has_role = profile
            .instance_profile()
            .map(|p| p.roles().iter().any(|r| r.role_name() == Some(INSTANCE_ROLE_NAME)))
            .unwrap_or(false);
        if !has_role {
            block_on(
                self.iam_client
                    .add_role_to_instance_profile()
                    .instance_profile_name(INSTANCE_ROLE_NAME)
                    .role_name(INSTANCE_ROLE_NAME)
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("add_role_to_instance_profile failed: {e:?}")))?;
        }

        self.wait_for_instance_profile_ready(Duration::from_secs(60));
        let profile = block_on(
            self.iam_client
                .get_instance_profile()
                .instance_profile_name(INSTANCE_ROLE_NAME)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("get_instance_profile failed: {e:?}")))?;
        profile
            .instance_profile()
            .and_then(|p| p.arn().map(str::to_string))
            .ok_or_else(|| DeploymentError::internal("Instance profile has no arn"))
    }

    fn wait_for_instance_profile_ready(&self, timeout: Duration) {
        let start = Instant::now();
        loop {
            if let Ok(output) = block_on(
                self.iam_client
                    .get_instance_profile()
                    .instance_profile_name(INSTANCE_ROLE_NAME)
                    .send(),
            ) {
                let ready = output
                    .instance_profile()
                    .map(|p| p.roles().iter().any(|r| r.role_name() == Some(INSTANCE_ROLE_NAME)))
                    .unwrap_or(false);
                if ready {
                    return;
                }
            }
            if start.elapsed() > timeout {
                warn!("Timeout waiting for instance profile to be ready");
                return;
            }
            std::thread::sleep(Duration::from_secs(2));
        }
    }

    fn delete_instance_profile(&self) {
        if let Ok(output) = block_on(
            self.iam_client
                .get_instance_profile()
                .instance_profile_name(INSTANCE_ROLE_NAME)
                .send(),
        ) {
            if let Some(profile) = output.instance_profile() {
                for role in profile.roles() {
                    let _ = block_on(
                        self.iam_client
                            .remove_role_from_instance_profile()
                            .instance_profile_name(INSTANCE_ROLE_NAME)
                            .role_name(role.role_name().unwrap_or_default())
                            .send(),
                    );
                }
            }
        }
        let _ = block_on(
            self.iam_client
                .delete_instance_profile()
                .instance_profile_name(INSTANCE_ROLE_NAME)
                .send(),
        );
        if let Ok(attached) = block_on(
            self.iam_client
                .list_attached_role_policies()
                .role_name(INSTANCE_ROLE_NAME)
                .send(),
        ) {
            for policy in attached.attached_policies() {
                if let Some(policy_arn) = policy.policy_arn() {
                    let _ = block_on(
                        self.iam_client
                            .detach_role_policy()
                            .role_name(INSTANCE_ROLE_NAME)
                            .policy_arn(policy_arn)
                            .send(),
                    );
                }
            }
        }
        let _ = block_on(self.iam_client.delete_role().role_name(INSTANCE_ROLE_NAME).send());
    }

    fn ensure_alb_security_group(
        &self,
        cluster_name: &str,
        vpc_id: &str,
        port: u16,
    ) -> Result<String, DeploymentError> {
        if let Some(sg) = &self.config.alb_security_group_id {
            return Ok(sg.clone());
        }
        let group_name = format!("{cluster_name}-alb-sg");

        match block_on(
            self.ec2_client
                .create_security_group()
                .group_name(&group_name)
                .description(format!("Security group for {cluster_name} ALB"))
                .vpc_id(vpc_id)
                .send(),
        ) {
            Ok(created) => {
                let sg_id = created
                    .group_id()
                    .ok_or_else(|| DeploymentError::internal("Created security group has no id"))?
                    .to_string();
                block_on(
                    self.ec2_client
                        .authorize_security_group_ingress()
                        .group_id(&sg_id)
                        .ip_permissions(
                            aws_sdk_ec2::types::IpPermission::builder()
                                .ip_protocol("tcp")
                                .from_port(port as i32)
                                .to_port(port as i32)
                                .ip_ranges(aws_sdk_ec2::types::IpRange::builder().cidr_ip("0.0.0.0/0").build())
                                .build(),
                        )
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("authorize_security_group_ingress failed: {e:?}")))?;
                info!("Created ALB security group: {}", sg_id);
                Ok(sg_id)
            }
            Err(err) => {
                if !err.to_string().contains("InvalidGroup.Duplicate") {
                    return Err(DeploymentError::internal(format!("create_security_group failed: {err:?}")));
                }
                self.find_security_group(&group_name, Some(vpc_id))?
                    .ok_or_else(|| {
                        DeploymentError::bad_request(format!(
                            "Security group '{group_name}' already exists but could not be found"
                        ))
                    })
            }
        }
    }

    fn ensure_ecs_security_group(&self, cluster_name: &str, vpc_id: &str) -> Result<String, DeploymentError> {
        if let Some(sg) = &self.config.ecs_security_group_id {
            return Ok(sg.clone());
        }
        let sg_name = self.ecs_security_group_name(cluster_name);
        if let Some(existing) = self.find_security_group(&sg_name, Some(vpc_id))? {
            return Ok(existing);
        }
        let created = block_on(
            self.ec2_client
                .create_security_group()
                .group_name(&sg_name)
                .description(format!("ECS EC2 instances for cluster {cluster_name}"))
                .vpc_id(vpc_id)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("create_security_group failed: {e:?}")))?;
        created
            .group_id()
            .map(str::to_string)
            .ok_or_else(|| DeploymentError::internal("Created security group has no id"))
    }

    fn ecs_security_group_name(&self, cluster_name: &str) -> String {
        match self.config.network_mode {
            NetworkMode::Awsvpc => format!("{cluster_name}-ecs-task-sg"),
            _ => format!("{cluster_name}-ecs-instance-sg"),
        }
    }

    fn find_security_group(&self, group_name: &str, vpc_id: Option<&str>) -> Result<Option<String>, DeploymentError> {
        let mut request = self.ec2_client.describe_security_groups().filters(
            aws_sdk_ec2::types::Filter::builder()
                .name("group-name")
                .values(group_name)
                .build(),
        );
        if let Some(vpc_id) = vpc_id {
            request = request.filters(
                aws_sdk_ec2::types::Filter::builder()
                    .name("vpc-id")
                    .values(vpc_id)
                    .build(),
            );
        }
        let described = block_on(request.send())
            .map_err(|e| DeploymentError::internal(format!("describe_security_groups failed: {e:?}")))?;
        Ok(described
            .security_groups()
            .first()
            .and_then(|sg| sg.group_id().map(str::to_string)))
    }

    /// Open target-port ingress from the caller security group; duplicate
    /// rules are fine.
    fn ensure_security_group_ingress(
        &self,
        security_group_id: &str,
        port: Option<u16>,
        caller_sg_id: Option<&str>,
    ) -> Result<(), DeploymentError> {
        let (Some(port), Some(caller_sg_id)) = (port, caller_sg_id) else {
            return Ok(());
        };
        match block_on(
            self.ec2_client
                .authorize_security_group_ingress()
                .group_id(security_group_id)
                .ip_permissions(
                    aws_sdk_ec2::types::IpPermission::builder()
                        .ip_protocol("tcp")
                        .from_port(port as i32)
                        .to_port(port as i32)
                        .user_id_group_pairs(
                            aws_sdk_ec2::types::UserIdGroupPair::builder()
                                .group_id(caller_sg_id)
                                .build(),
                        )
                        .build(),
                )
                .send(),
        ) {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.to_string().contains("InvalidPermission.Duplicate") {
                    Ok(())
                } else {
                    Err(DeploymentError::internal(format!(
                        "authorize_security_group_ingress failed: {err:?}"
                    )))
                }
            }
        }
    }

    fn delete_security_group_by_name(&self, group_name: &str) {
        if let Ok(Some(sg_id)) = self.find_security_group(group_name, None) {
            self.wait_for_security_group_detach(&sg_id, Duration::from_secs(60));
        }
    }

    fn wait_for_security_group_detach(&self, sg_id: &str, timeout: Duration) {
        let start = Instant::now();
        loop {
            match block_on(self.ec2_client.delete_security_group().group_id(sg_id).send()) {
                Ok(_) => {
                    info!("Deleted security group: {}", sg_id);
                    return;
                }
                Err(err) => {
                    if !err.to_string().contains("DependencyViolation") {
                        warn!("Cannot delete security group {}: {:?}", sg_id, err);
                        return;
                    }
                }
            }
            if start.elapsed() > timeout {
                warn!("Timed out waiting for security group {} to be deleted", sg_id);
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_load_balancer(
        &self,
        service_name: &str,
        vpc_id: &str,
        subnet_ids: &[String],
        security_group_id: &str,
        target_port: u16,
        exposed_port: u16,
    ) -> Result<(Option<String>, String), DeploymentError> {
        if let Some(tg_arn) = &self.config.target_group_arn {
            return Ok((None, tg_arn.clone()));
        }
        let alb_name = format!("{service_name}-alb");
        let tg_name = format!("{service_name}-tg");

        let alb_arn = match block_on(
            self.elbv2_client
                .create_load_balancer()
                .name(&alb_name)
                .set_subnets(Some(subnet_ids.to_vec()))
                .security_groups(security_group_id)
                .scheme(elbv2_types::LoadBalancerSchemeEnum::InternetFacing)
                .r#type(elbv2_types::LoadBalancerTypeEnum::Application)
                .ip_address_type(elbv2_types::IpAddressType::Ipv4)
                .send(),
        ) {
            Ok(created) => created
                .load_balancers()
                .first()
                .and_then(|lb| lb.load_balancer_arn().map(str::to_string))
                .ok_or_else(|| DeploymentError::internal("Created load balancer has no arn"))?,
            Err(err) => {
                if !err.to_string().contains("DuplicateLoadBalancerName") {
                    return Err(DeploymentError::bad_request(format!("Could not create ALB: {err:?}")));
                }
                let described = block_on(self.elbv2_client.describe_load_balancers().names(&alb_name).send())
                    .map_err(|e| DeploymentError::internal(format!("describe_load_balancers failed: {e:?}")))?;
                described
                    .load_balancers()
                    .first()
                    .and_then(|lb| lb.load_balancer_arn().map(str::to_string))
                    .ok_or_else(|| DeploymentError::internal("Existing load balancer has no arn"))?
            }
        };
        info!("Ensured ALB: {}", alb_arn);

        let target_type = match self.config.network_mode {
            NetworkMode::Awsvpc => elbv2_types::TargetTypeEnum::Ip,
            _ => elbv2_types::TargetTypeEnum::Instance,
        };
        let health_check_port = match target_type {
            elbv2_types::TargetTypeEnum::Ip => target_port.to_string(),
            _ => "traffic-port".to_string(),
        };
        let tg_arn = match block_on(
            self.elbv2_client
                .create_target_group()
                .name(&tg_name)
                .protocol(elbv2_types::ProtocolEnum::Http)
                .port(target_port as i32)
                .vpc_id(vpc_id)
                .target_type(target_type)
                .health_check_protocol(elbv2_types::ProtocolEnum::Http)
                .health_check_port(health_check_port)
                .send(),
        ) {
            Ok(created) => created
                .target_groups()
                .first()
                .and_then(|tg| tg.target_group_arn().map(str::to_string))
                .ok_or_else(|| DeploymentError::internal("Created target group has no arn"))?,
            Err(err) => {
                if !err.to_string().contains("DuplicateTargetGroupName") {
                    return Err(DeploymentError::bad_request(format!("Could not create Target Group: {err:?}")));
                }
                let described = block_on(self.elbv2_client.describe_target_groups().names(&tg_name).send())
                    .map_err(|e| DeploymentError::internal(format!("describe_target_groups failed: {e:?}")))?;
                described
                    .target_groups()
                    .first()
                    .and_then(|tg| tg.target_group_arn().map(str::to_string))
                    .ok_or_else(|| DeploymentError::internal("Existing target group has no arn"))?
            }
        };
        info!("Ensured Target Group: {}", tg_arn);

        match block_on(
            self.elbv2_client
                .create_listener()
                .load_balancer_arn(&alb_arn)
                .protocol(elbv2_types::ProtocolEnum::Http)
                .port(exposed_port as i32)
                .default_actions(
                    elbv2_types::Action::builder()
                        .r#type(elbv2_types::ActionTypeEnum::Forward)
                        .target_group_arn(&tg_arn)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                )
                .send(),
        ) {
            Ok(_) => info!("Created listener on port {}", exposed_port),
            Err(err) => {
                if !err.to_string().contains("DuplicateListener") {
                    return Err(DeploymentError::bad_request(format!("Could not create listener: {err:?}")));
                }
            }
        }

        Ok((Some(alb_arn), tg_arn))
    }

    fn delete_load_balancer(&self, service_name: &str) {
        let alb_name = format!("{service_name}-alb");
        let tg_name = format!("{service_name}-tg");

        if let Ok(described) = block_on(self.elbv2_client.describe_load_balancers().names(&alb_name).send()) {
            if let Some(alb_arn) = described
                .load_balancers()
                .first()
                .and_then(|lb| lb.load_balancer_arn().map(str::to_string))
            {
                if let Ok(listeners) = block_on(
                    self.elbv2_client
                        .describe_listeners()
                        .load_balancer_arn(&alb_arn)
                        .send(),
                ) {
                    for listener in listeners.listeners() {
                        if let Some(listener_arn) = listener.listener_arn() {
                            let _ = block_on(self.elbv2_client.delete_listener().listener_arn(listener_arn).send());
                        }
                    }
                }
                let _ = block_on(
                    self.elbv2_client
                        .delete_load_balancer()
                        .load_balancer_arn(&alb_arn)
                        .send(),
                );
                info!("Deleted ALB: {}", alb_arn);
            }
        }

        if let Ok(described) = block_on(self.elbv2_client.describe_target_groups().names(&tg_name).send()) {
            if let Some(tg_arn) = described
                .target_groups()
                .first()
                .and_then(|tg| tg.target_group_arn().map(str::to_string))
            {
                let _ = block_on(self.elbv2_client.delete_target_group().target_group_arn(&tg_arn).send());
                info!("Deleted Target Group: {}", tg_arn);
            }
        }
    }

    /// Readiness probe applied as the target-group health check.
    fn apply_readiness_probe_to_target_group(
        &self,
        target_group_arn: &str,
        service: &ServiceDefinition,
    ) -> Result<(), DeploymentError> {
        let Some(probe) = service.containers.iter().find_map(|container| {
            if container.kind == ContainerKind::Main && !container.ports.is_empty() {
                container.probes.as_ref().and_then(|p| p.readiness_probe.clone())
            } else {
                None
            }
        }) else {
            return Ok(());
        };
        let Some(http) = &probe.http_get else {
            return Ok(());
        };

        let protocol = match http.scheme.to_ascii_uppercase().as_str() {
            "HTTPS" => elbv2_types::ProtocolEnum::Https,
            _ => elbv2_types::ProtocolEnum::Http,
        };
        let health_check_port = match self.config.network_mode {
            NetworkMode::Awsvpc => http.port.to_string(),
            _ => "traffic-port".to_string(),
        };
        block_on(
            self.elbv2_client
                .modify_target_group()
                .target_group_arn(target_group_arn)
                .health_check_enabled(true)
                .health_check_protocol(protocol)
                .health_check_port(health_check_port)
                .health_check_path(if http.path.is_empty() { "/" } else { &http.path })
                .health_check_interval_seconds(probe.period_seconds.unwrap_or(30) as i32)
                .health_check_timeout_seconds(probe.timeout_seconds.unwrap_or(5) as i32)
                .healthy_threshold_count(probe.success_threshold.unwrap_or(3) as i32)
                .unhealthy_threshold_count(probe.failure_threshold.unwrap_or(3) as i32)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("modify_target_group failed: {e:?}")))?;
        info!("Updated health check on target group {}", target_group_arn);
        Ok(())
    }

    fn alb_from_target_group(&self, tg_arn: &str) -> Option<String> {
        block_on(
            self.elbv2_client
                .describe_target_groups()
                .target_group_arns(tg_arn)
                .send(),
        )
        .ok()
        .and_then(|output| {
            output
                .target_groups()
                .first()
                .and_then(|tg| tg.load_balancer_arns().first().cloned())
        })
    }

    // ---- EC2 capacity -------------------------------------------------

    fn latest_ecs_ami_id(&self) -> Result<String, DeploymentError> {
        let images = block_on(
            self.ec2_client
                .describe_images()
                .filters(
                    aws_sdk_ec2::types::Filter::builder()
                        .name("name")
                        .values("amzn2-ami-ecs-hvm-*-x86_64-ebs")
                        .build(),
                )
                .filters(
                    aws_sdk_ec2::types::Filter::builder()
                        .name("state")
                        .values("available")
                        .build(),
                )
                .owners("amazon")
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("describe_images failed: {e:?}")))?;
        let mut images = images.images().to_vec();
        if images.is_empty() {
            return Err(DeploymentError::bad_request("No ECS-optimized AMI found"));
        }
        images.sort_by(|a, b| b.creation_date().cmp(&a.creation_date()));
        images
            .first()
            .and_then(|image| image.image_id().map(str::to_string))
            .ok_or_else(|| DeploymentError::internal("ECS-optimized AMI has no id"))
    }

    fn ec2_user_data(&self, cluster_name: &str) -> String {
        let script = format!("#!/bin/bash\necho ECS_CLUSTER={cluster_name} >> /etc/ecs/ecs.config\n");
        base64::engine::general_purpose::STANDARD.encode(script)
    }

    fn ensure_auto_scaling_group(
        &self,
        cluster_name: &str,
        lt_id: &str,
        lt_version: &str,
        subnets: &[String],
    ) -> Result<String, DeploymentError> {
        let asg_name = format!("{cluster_name}-asg");
        let subnet_str = subnets.join(",");
        let min_size = self.config.ec2_min_size.unwrap_or(1);
        let max_size = self.config.ec2_max_size.unwrap_or(10);
        let desired = self.config.ec2_desired_capacity.unwrap_or(2);

        let described = block_on(
            self.autoscaling_client
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(&asg_name)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("describe_auto_scaling_groups failed: {e:?}")))?;
        if let Some(group) = described.auto_scaling_groups().first() {
            if let Some(arn) = group.auto_scaling_group_arn() {
                block_on(
                    self.autoscaling_client
                        .update_auto_scaling_group()
                        .auto_scaling_group_name(&asg_name)
                        .min_size(min_size)
                        .max_size(max_size)
                        .desired_capacity(desired)
                        .launch_template(
                            aws_sdk_autoscaling::types::LaunchTemplateSpecification::builder()
                                .launch_template_id(lt_id)
                                .version(lt_version)
                                .build(),
                        )
                        .vpc_zone_identifier(&subnet_str)
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("update_auto_scaling_group failed: {e:?}")))?;
                info!("Updated auto scaling group: {}", asg_name);
                return Ok(arn.to_string());
            }
        }

        // Instance profile propagation makes the first create racy; retry
        // with a capped jittered backoff.
        let attempts = 5;
        let mut delay = 0.7f64;
        for attempt in 1..=attempts {
            match block_on(
                self.autoscaling_client
                    .create_auto_scaling_group()
                    .auto_scaling_group_name(&asg_name)
                    .min_size(min_size)
                    .max_size(max_size)
                    .desired_capacity(desired)
                    .launch_template(
                        aws_sdk_autoscaling::types::LaunchTemplateSpecification::builder()
                            .launch_template_id(lt_id)
                            .version(lt_version)
                            .build(),
                    )
                    .vpc_zone_identifier(&subnet_str)
                    .health_check_type("EC2")
                    .new_instances_protected_from_scale_in(false)
                    .send(),
            ) {
                Ok(_) => {
                    info!("Created auto scaling group: {}", asg_name);
                    let described = block_on(
                        self.autoscaling_client
                            .describe_auto_scaling_groups()
                            .auto_scaling_group_names(&asg_name)
                            .send(),
                    )
                    .map_err(|e| DeploymentError::internal(format!("describe_auto_scaling_groups failed: {e:?}")))?;
                    return described
                        .auto_scaling_groups()
                        .first()
                        .and_then(|g| g.auto_scaling_group_arn().map(str::to_string))
                        .ok_or_else(|| DeploymentError::internal("Auto scaling group has no arn"));
                }
                Err(err) => {
                    let message = err.to_string().to_ascii_lowercase();
                    let should_retry = message.contains("validationerror")
                        && message.contains("iaminstanceprofile")
                        && (message.contains("invalid") || message.contains("not found"));
                    if !should_retry || attempt == attempts {
                        return Err(DeploymentError::internal(format!(
                            "create_auto_scaling_group failed: {err:?}"
                        )));
                    }
                    std::thread::sleep(Duration::from_secs_f64(delay));
                    delay = (delay * 1.7 + 0.1 * attempt as f64).min(3.0);
                }
            }
        }
        Err(DeploymentError::internal("create_auto_scaling_group did not converge"))
    }

    fn delete_auto_scaling_group(&self, cluster_name: &str) {
        let asg_name = format!("{cluster_name}-asg");
        let exists = block_on(
            self.autoscaling_client
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(&asg_name)
                .send(),
        )
        .map(|output| !output.auto_scaling_groups().is_empty())
        .unwrap_or(false);
        if !exists {
            return;
        }

        let _ = block_on(
            self.autoscaling_client
                .update_auto_scaling_group()
                .auto_scaling_group_name(&asg_name)
                .min_size(0)
                .max_size(0)
                .desired_capacity(0)
                .send(),
        );
        let _ = block_on(
            self.autoscaling_client
                .delete_auto_scaling_group()
                .auto_scaling_group_name(&asg_name)
                .force_delete(true)
                .send(),
        );

        for _ in 0..24 {
            std::thread::sleep(Duration::from_secs(5));
            match block_on(
                self.autoscaling_client
                    .describe_auto_scaling_groups()
                    .auto_scaling_group_names(&asg_name)
                    .send(),
            ) {
                Ok(output) if output.auto_scaling_groups().is_empty() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        info!("Deleted auto scaling group: {}", asg_name);
    }

    fn ensure_capacity_provider(
        &self,
        cluster_name: &str,
        auto_scaling_group_arn: &str,
    ) -> Result<String, DeploymentError> {
        let cp_name = format!("{cluster_name}-cp");
        let target_capacity = self.config.ec2_target_capacity.unwrap_or(100);

        let described = block_on(
            self.ecs_client
                .describe_capacity_providers()
                .capacity_providers(&cp_name)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("describe_capacity_providers failed: {e:?}")))?;
        let mut exists = false;
        if let Some(provider) = described.capacity_providers().first() {
            if provider.status() == Some(&ecs_types::CapacityProviderStatus::Active) {
                exists = true;
                let current_asg = provider
                    .auto_scaling_group_provider()
                    .and_then(|p| p.auto_scaling_group_arn())
                    .unwrap_or_default();
                if current_asg != auto_scaling_group_arn {
                    info!(
                        "Capacity provider {} exists with a different auto scaling group, deleting it",
                        cp_name
                    );
                    self.delete_capacity_provider(cluster_name);
                    exists = false;
                }
            }
        }

        if exists {
            block_on(
                self.ecs_client
                    .update_capacity_provider()
                    .name(&cp_name)
                    .auto_scaling_group_provider(
                        ecs_types::AutoScalingGroupProviderUpdate::builder()
                            .managed_scaling(
                                ecs_types::ManagedScaling::builder()
                                    .status(ecs_types::ManagedScalingStatus::Enabled)
                                    .target_capacity(target_capacity)
                                    .build(),
                            )
                            .managed_termination_protection(ecs_types::ManagedTerminationProtection::Disabled)
                            .build(),
                    )
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("update_capacity_provider failed: {e:?}")))?;
            info!("Updated capacity provider {}", cp_name);
            return Ok(cp_name);
        }

        block_on(
            self.ecs_client
                .create_capacity_provider()
                .name(&cp_name)
                .auto_scaling_group_provider(
                    ecs_types::AutoScalingGroupProvider::builder()
                        .auto_scaling_group_arn(auto_scaling_group_arn)
                        .managed_scaling(
                            ecs_types::ManagedScaling::builder()
                                .status(ecs_types::ManagedScalingStatus::Enabled)
                                .target_capacity(target_capacity)
                                .minimum_scaling_step_size(1)
                                .maximum_scaling_step_size(1000)
                                .build(),
                        )
                        .managed_termination_protection(ecs_types::ManagedTerminationProtection::Disabled)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                )
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("create_capacity_provider failed: {e:?}")))?;
        info!("Created capacity provider {}", cp_name);
        Ok(cp_name)
    }

    fn delete_capacity_provider(&self, cluster_name: &str) {
        let cp_name = format!("{cluster_name}-cp");
        let _ = block_on(self.ecs_client.delete_capacity_provider().capacity_provider(&cp_name).send());
        // No waiter available; a short sleep reduces immediate
        // read-after-write flakiness.
        std::thread::sleep(Duration::from_secs(2));
        info!("Deleted capacity provider {}", cp_name);
    }

    fn detach_capacity_provider_from_cluster(&self, cluster_name: &str) {
        let _ = block_on(
            self.ecs_client
                .put_cluster_capacity_providers()
                .cluster(cluster_name)
                .set_capacity_providers(Some(vec![]))
                .set_default_capacity_provider_strategy(Some(vec![]))
                .send(),
        );
    }

    fn ensure_ec2_capacity(
        &self,
        cluster_name: &str,
        subnet_ids: &[String],
        security_group_id: &str,
    ) -> Result<(), DeploymentError> {
        let ami_id = match &self.config.ec2_ami_id {
            Some(ami_id) => ami_id.clone(),
            None => self.latest_ecs_ami_id()?,
        };
        let instance_profile_arn = self.ensure_instance_profile()?;

        let (lt_id, lt_version) = match &self.config.ec2_launch_template_id {
            Some(lt_id) => (
                lt_id.clone(),
                self.config
                    .ec2_launch_template_version
                    .clone()
                    .unwrap_or_else(|| "$Latest".to_string()),
            ),
            None => ec2_helper::ensure_launch_template(
                &self.ec2_client,
                &format!("{cluster_name}-lt"),
                &ami_id,
                self.config.ec2_instance_type.as_deref().unwrap_or("t3.micro"),
                security_group_id,
                Some(&instance_profile_arn),
                &self.ec2_user_data(cluster_name),
            )?,
        };

        let auto_scaling_group_arn = match &self.config.ec2_auto_scaling_group_arn {
            Some(arn) => arn.clone(),
            None => self.ensure_auto_scaling_group(cluster_name, &lt_id, &lt_version, subnet_ids)?,
        };

        let (capacity_providers, strategy) = match &self.config.capacity_providers {
            Some(providers) => {
                let strategy = providers
                    .iter()
                    .filter_map(|p| {
                        ecs_types::CapacityProviderStrategyItem::builder()
                            .capacity_provider(p)
                            .weight(1)
                            .build()
                            .ok()
                    })
                    .collect::<Vec<_>>();
                (providers.clone(), strategy)
            }
            None => {
                let cp_name = self.ensure_capacity_provider(cluster_name, &auto_scaling_group_arn)?;
                let strategy = vec![
                    ecs_types::CapacityProviderStrategyItem::builder()
                        .capacity_provider(&cp_name)
                        .weight(1)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                ];
                (vec![cp_name], strategy)
            }
        };

        block_on(
            self.ecs_client
                .put_cluster_capacity_providers()
                .cluster(cluster_name)
                .set_capacity_providers(Some(capacity_providers))
                .set_default_capacity_provider_strategy(Some(strategy))
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("put_cluster_capacity_providers failed: {e:?}")))?;

        self.wait_for_container_instances(cluster_name, Duration::from_secs(300))?;
        info!("Ensured EC2 capacity for ECS cluster");
        Ok(())
    }

    fn delete_ec2_capacity(&self, cluster_name: &str) {
        if self.config.capacity_providers.is_none() {
            self.detach_capacity_provider_from_cluster(cluster_name);
            self.delete_capacity_provider(cluster_name);
        }
        if self.config.ec2_auto_scaling_group_arn.is_none() {
            self.delete_auto_scaling_group(cluster_name);
        }
        if self.config.ec2_launch_template_id.is_none() {
            let _ = ec2_helper::delete_launch_template(&self.ec2_client, &format!("{cluster_name}-lt"));
        }
        if self.config.ecs_instance_profile_arn.is_none() {
            self.delete_instance_profile();
        }
    }

    fn wait_for_container_instances(&self, cluster_name: &str, timeout: Duration) -> Result<(), DeploymentError> {
        let start = Instant::now();
        loop {
            let arns = block_on(self.ecs_client.list_container_instances().cluster(cluster_name).send())
                .map(|output| output.container_instance_arns().to_vec())
                .unwrap_or_default();
            if !arns.is_empty() {
                let described = block_on(
                    self.ecs_client
                        .describe_container_instances()
                        .cluster(cluster_name)
                        .set_container_instances(Some(arns))
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("describe_container_instances failed: {e:?}")))?;
                let active = described
                    .container_instances()
                    .iter()
                    .any(|ci| ci.status() == Some("ACTIVE") && ci.agent_connected());
                if active {
                    return Ok(());
                }
            }
            if start.elapsed() > timeout {
                return Err(DeploymentError::Timeout {
                    raw_error_message: "No ECS container instances registered in time".to_string(),
                });
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    // ---- Application autoscaling --------------------------------------

    fn ensure_application_autoscaling(
        &self,
        cluster_name: &str,
        service_name: &str,
        scale: Option<&Scale>,
    ) -> Result<(), DeploymentError> {
        let Some(scale) = scale else { return Ok(()) };
        if scale.mode != ScaleMode::Auto {
            return Ok(());
        }
        let resource_id = format!("service/{cluster_name}/{service_name}");

        block_on(
            self.application_autoscaling_client
                .register_scalable_target()
                .service_namespace(aws_sdk_applicationautoscaling::types::ServiceNamespace::Ecs)
                .resource_id(&resource_id)
                .scalable_dimension(aws_sdk_applicationautoscaling::types::ScalableDimension::EcsServiceDesiredCount)
                .min_capacity(scale.min_replicas.unwrap_or(1) as i32)
                .max_capacity(scale.max_replicas.unwrap_or(10) as i32)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("register_scalable_target failed: {e:?}")))?;

        for rule in &scale.rules {
            self.put_scaling_policy(&resource_id, scale, rule)?;
        }
        Ok(())
    }

    fn put_scaling_policy(&self, resource_id: &str, scale: &Scale, rule: &ScaleRule) -> Result<(), DeploymentError> {
        use aws_sdk_applicationautoscaling::types as aas_types;

        let metadata = rule
            .metadata
            .as_ref()
            .ok_or_else(|| DeploymentError::bad_request("Scale rule metadata must be provided for ECS"))?;
        let target_value = metadata
            .get("targetValue")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DeploymentError::bad_request("Scale rule requires a numeric targetValue"))?;
        let cooldown = scale.cooldown_period.unwrap_or(60) as i32;

        let mut tracking = aas_types::TargetTrackingScalingPolicyConfiguration::builder()
            .target_value(target_value)
            .scale_in_cooldown(cooldown)
            .scale_out_cooldown(cooldown);

        match rule.kind {
            ScaleRuleKind::Cpu => {
                tracking = tracking.predefined_metric_specification(
                    aas_types::PredefinedMetricSpecification::builder()
                        .predefined_metric_type(aas_types::MetricType::EcsServiceAverageCpuUtilization)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                );
            }
            ScaleRuleKind::Memory => {
                tracking = tracking.predefined_metric_specification(
                    aas_types::PredefinedMetricSpecification::builder()
                        .predefined_metric_type(aas_types::MetricType::EcsServiceAverageMemoryUtilization)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                );
            }
            ScaleRuleKind::Custom => {
                let metric_name = metadata
                    .get("metricName")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DeploymentError::bad_request("Custom scale rule requires metricName"))?;
                let namespace = metadata
                    .get("namespace")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Custom/ECS");
                let mut custom = aas_types::CustomizedMetricSpecification::builder()
                    .metric_name(metric_name)
                    .namespace(namespace)
                    .statistic(aas_types::MetricStatistic::Average);
                if let Some(dimensions) = metadata.get("dimensions").and_then(|v| v.as_object()) {
                    for (name, value) in dimensions {
                        if let Some(value) = value.as_str() {
                            custom = custom.dimensions(
                                aas_types::MetricDimension::builder()
                                    .name(name)
                                    .value(value)
                                    .build()
                                    .map_err(|e| DeploymentError::internal(e.to_string()))?,
                            );
                        }
                    }
                }
                tracking = tracking.customized_metric_specification(custom.build());
            }
            other => {
                return Err(DeploymentError::bad_request(format!(
                    "Unsupported rule type for ECS: {other:?}"
                )));
            }
        }

        block_on(
            self.application_autoscaling_client
                .put_scaling_policy()
                .policy_name(rule.name.clone().unwrap_or_else(|| "target-tracking".to_string()))
                .service_namespace(aws_sdk_applicationautoscaling::types::ServiceNamespace::Ecs)
                .resource_id(resource_id)
                .scalable_dimension(aws_sdk_applicationautoscaling::types::ScalableDimension::EcsServiceDesiredCount)
                .policy_type(aws_sdk_applicationautoscaling::types::PolicyType::TargetTrackingScaling)
                .target_tracking_scaling_policy_configuration(
                    tracking.build().map_err(|e| DeploymentError::internal(e.to_string()))?,
                )
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("put_scaling_policy failed: {e:?}")))?;
        Ok(())
    }

    fn get_autoscaling(&self, cluster_name: &str, service_name: &str) -> Scale {
        use aws_sdk_applicationautoscaling::types as aas_types;
        let resource_id = format!("service/{cluster_name}/{service_name}");

        let targets = block_on(
            self.application_autoscaling_client
                .describe_scalable_targets()
                .service_namespace(aas_types::ServiceNamespace::Ecs)
                .resource_ids(&resource_id)
                .send(),
        )
        .map(|output| output.scalable_targets().to_vec())
        .unwrap_or_default();

        let Some(target) = targets.first() else {
            return Scale {
                mode: ScaleMode::Manual,
                ..Default::default()
            };
        };
        let mut scale = Scale {
            mode: ScaleMode::Auto,
            min_replicas: Some(target.min_capacity().unwrap_or_default() as u32),
            max_replicas: Some(target.max_capacity().unwrap_or_default() as u32),
            rules: vec![],
            ..Default::default()
        };

        let policies = block_on(
            self.application_autoscaling_client
                .describe_scaling_policies()
                .service_namespace(aas_types::ServiceNamespace::Ecs)
                .resource_id(&resource_id)
                .send(),
        )
        .map(|output| output.scaling_policies().to_vec())
        .unwrap_or_default();

        for policy in policies {
            let Some(config) = policy.target_tracking_scaling_policy_configuration() else {
                continue;
            };
            let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
            metadata.insert(
                "targetValue".to_string(),
                serde_json::json!(config.target_value().unwrap_or_default()),
            );

            let kind = if let Some(predefined) = config.predefined_metric_specification() {
                match predefined.predefined_metric_type() {
                    Some(aas_types::MetricType::EcsServiceAverageCpuUtilization) => Some(ScaleRuleKind::Cpu),
                    Some(aas_types::MetricType::EcsServiceAverageMemoryUtilization) => Some(ScaleRuleKind::Memory),
                    _ => None,
                }
            } else if let Some(custom) = config.customized_metric_specification() {
                if let Some(metric_name) = custom.metric_name() {
                    metadata.insert("metricName".to_string(), serde_json::json!(metric_name));
                }
                if let Some(namespace) = custom.namespace() {
                    metadata.insert("namespace".to_string(), serde_json::json!(namespace));
                }
                Some(ScaleRuleKind::Custom)
            } else {
                None
            };

            if let Some(kind) = kind {
                scale.rules.push(ScaleRule {
                    kind,
                    name: policy.policy_name().map(str::to_string),
                    metadata: Some(metadata),
                    auth: None,
                });
                let cooldown = config
                    .scale_in_cooldown()
                    .or(config.scale_out_cooldown())
                    .unwrap_or(60);
                scale.cooldown_period = Some(cooldown as u32);
            }
        }
        scale
    }

    fn delete_autoscaling(&self, cluster_name: &str, service_name: &str) {
        use aws_sdk_applicationautoscaling::types as aas_types;
        let resource_id = format!("service/{cluster_name}/{service_name}");

        if let Ok(output) = block_on(
            self.application_autoscaling_client
                .describe_scaling_policies()
                .service_namespace(aas_types::ServiceNamespace::Ecs)
                .resource_id(&resource_id)
                .send(),
        ) {
            for policy in output.scaling_policies() {
                let _ = block_on(
                    self.application_autoscaling_client
                        .delete_scaling_policy()
                        .service_namespace(aas_types::ServiceNamespace::Ecs)
                        .policy_name(policy.policy_name().unwrap_or_default())
                        .resource_id(&resource_id)
                        .scalable_dimension(aas_types::ScalableDimension::EcsServiceDesiredCount)
                        .send(),
                );
            }
        }
        if let Ok(output) = block_on(
            self.application_autoscaling_client
                .describe_scalable_targets()
                .service_namespace(aas_types::ServiceNamespace::Ecs)
                .resource_ids(&resource_id)
                .send(),
        ) {
            for target in output.scalable_targets() {
                let _ = block_on(
                    self.application_autoscaling_client
                        .deregister_scalable_target()
                        .service_namespace(aas_types::ServiceNamespace::Ecs)
                        .resource_id(target.resource_id().unwrap_or_default())
                        .set_scalable_dimension(target.scalable_dimension().cloned())
                        .send(),
                );
            }
        }
    }

    // ---- Waiters ------------------------------------------------------

    /// Stable means the primary deployment finished rolling out and every
    /// desired task is running. Expiry returns the current state.
    fn wait_for_service_stable(&self, cluster_name: &str, service_name: &str, alb_arn: Option<&str>) {
        info!("Waiting for service {} to be stable", service_name);
        let start = Instant::now();
        loop {
            let service = self.describe_service(cluster_name, service_name).ok().flatten();
            if let Some(service) = &service {
                let primary_completed = service
                    .deployments()
                    .iter()
                    .find(|d| d.status() == Some("PRIMARY"))
                    .map(|d| d.rollout_state() == Some(&ecs_types::DeploymentRolloutState::Completed))
                    .unwrap_or(false);
                if primary_completed && service.running_count() == service.desired_count() {
                    info!("Service '{}' is stable", service_name);
                    break;
                }
            }
            if start.elapsed() > SERVICE_STABLE_TIMEOUT {
                warn!(
                    "Service {} did not become stable within {} seconds",
                    service_name,
                    SERVICE_STABLE_TIMEOUT.as_secs()
                );
                break;
            }
            std::thread::sleep(Duration::from_secs(5));
        }

        if let Some(alb_arn) = alb_arn {
            let start = Instant::now();
            loop {
                let state = block_on(
                    self.elbv2_client
                        .describe_load_balancers()
                        .load_balancer_arns(alb_arn)
                        .send(),
                )
                .ok()
                .and_then(|output| {
                    output
                        .load_balancers()
                        .first()
                        .and_then(|lb| lb.state().and_then(|s| s.code().cloned()))
                });
                if state == Some(elbv2_types::LoadBalancerStateEnum::Active) {
                    info!("ALB {} is now ACTIVE", alb_arn);
                    break;
                }
                if start.elapsed() > SERVICE_STABLE_TIMEOUT {
                    warn!(
                        "ALB {} did not become ACTIVE within {} seconds",
                        alb_arn,
                        SERVICE_STABLE_TIMEOUT.as_secs()
                    );
                    break;
                }
                std::thread::sleep(Duration::from_secs(5));
            }
        }
    }

    fn wait_for_drained(&self, cluster_name: &str, service_name: &str) {
        let start = Instant::now();
        loop {
            let service = self.describe_service(cluster_name, service_name).ok().flatten();
            match &service {
                Some(service) => {
                    let running = service.running_count();
                    let draining = service.deployments().iter().any(|d| d.status() != Some("PRIMARY"));
                    if running == 0 && !draining {
                        return;
                    }
                }
                None => return,
            }
            if start.elapsed() > DRAIN_TIMEOUT {
                warn!("Timed out waiting for service {} to drain", service_name);
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    // ---- Operation shaping --------------------------------------------

    fn build_task_definition_request(
        &self,
        service_name: &str,
        service: &ServiceDefinition,
        images: &[String],
        execution_role_arn: &str,
    ) -> Result<aws_sdk_ecs::operation::register_task_definition::builders::RegisterTaskDefinitionFluentBuilder, DeploymentError>
    {
        let mut request = self
            .ecs_client
            .register_task_definition()
            .family(service_name)
            .network_mode(ecs_types::NetworkMode::from(self.config.network_mode.as_str()))
            .requires_compatibilities(match self.config.launch_kind {
                LaunchKind::Fargate => ecs_types::Compatibility::Fargate,
                LaunchKind::Ec2 => ecs_types::Compatibility::Ec2,
            })
            .execution_role_arn(execution_role_arn);

        if self.config.launch_kind == LaunchKind::Fargate {
            let (cpu, memory) = convert::aggregate_cpu_memory(service)?;
            request = request.cpu(cpu).memory(memory);
        }
        if let Some(task_role_arn) = &self.config.task_role_arn {
            request = request.task_role_arn(task_role_arn);
        }

        let init_container_names: Vec<String> = service
            .containers
            .iter()
            .filter(|c| c.kind == ContainerKind::Init)
            .map(|c| c.name.clone())
            .collect();

        for (container, image) in service.containers.iter().zip(images.iter()) {
            request = request.container_definitions(self.build_container_definition(
                container,
                image,
                &init_container_names,
            )?);
        }
        for volume in &service.volumes {
            if volume.kind == VolumeKind::EmptyDir {
                request = request.volumes(ecs_types::Volume::builder().name(&volume.name).build());
            }
        }
        Ok(request)
    }

    fn build_container_definition(
        &self,
        container: &Container,
        image: &str,
        init_container_names: &[String],
    ) -> Result<ecs_types::ContainerDefinition, DeploymentError> {
        let mut builder = ecs_types::ContainerDefinition::builder()
            .name(&container.name)
            .image(image)
            .essential(true);

        for env in &container.env {
            builder = builder.environment(
                ecs_types::KeyValuePair::builder()
                    .name(&env.name)
                    .value(env.value.clone().unwrap_or_default())
                    .build(),
            );
        }
        for port in &container.ports {
            let mut mapping = ecs_types::PortMapping::builder()
                .container_port(port.container_port as i32)
                .protocol(match port.protocol {
                    Protocol::Tcp => ecs_types::TransportProtocol::Tcp,
                    Protocol::Udp => ecs_types::TransportProtocol::Udp,
                });
            match self.config.network_mode {
                NetworkMode::Bridge | NetworkMode::Host => {
                    mapping = mapping.host_port(port.host_port.unwrap_or(0) as i32);
                }
                NetworkMode::Awsvpc => {
                    if let Some(host_port) = port.host_port {
                        mapping = mapping.host_port(host_port as i32);
                    }
                }
            }
            builder = builder.port_mappings(mapping.build());
        }
        if let Some(command) = &container.command {
            builder = builder.set_entry_point(Some(command.clone()));
        }
        if let Some(args) = &container.args {
            builder = builder.set_command(Some(args.clone()));
        }
        if let Some(working_dir) = &container.working_dir {
            builder = builder.working_directory(working_dir);
        }
        if let Some((cpu, memory)) = convert::container_cpu_memory(container)? {
            builder = builder.cpu(cpu as i32).memory(memory as i32);
        }
        if let Some(healthcheck) = convert::probes_to_healthcheck(container.probes.as_ref()) {
            builder = builder.health_check(
                ecs_types::HealthCheck::builder()
                    .set_command(Some(healthcheck.command))
                    .interval(healthcheck.interval)
                    .timeout(healthcheck.timeout)
                    .retries(healthcheck.retries)
                    .start_period(healthcheck.start_period)
                    .build()
                    .map_err(|e| DeploymentError::internal(e.to_string()))?,
            );
        }
        for mount in &container.volume_mounts {
            if mount.sub_path.is_some() {
                warn!("ECS does not support sub_path (ignored): {:?}", mount.sub_path);
            }
            builder = builder.mount_points(
                ecs_types::MountPoint::builder()
                    .source_volume(&mount.name)
                    .container_path(&mount.mount_path)
                    .read_only(mount.read_only.unwrap_or(false))
                    .build(),
            );
        }
        // Main containers start only once every init container finished.
        if !init_container_names.contains(&container.name) {
            for init_name in init_container_names {
                builder = builder.depends_on(
                    ecs_types::ContainerDependency::builder()
                        .container_name(init_name)
                        .condition(ecs_types::ContainerCondition::Complete)
                        .build()
                        .map_err(|e| DeploymentError::internal(e.to_string()))?,
                );
            }
        }
        Ok(builder.build())
    }

    fn register_task_definition(
        &self,
        service_name: &str,
        service: &ServiceDefinition,
        images: &[String],
        execution_role_arn: &str,
    ) -> Result<String, DeploymentError> {
        let request = self.build_task_definition_request(service_name, service, images, execution_role_arn)?;
        let registered = block_on(request.send())
            .map_err(|e| DeploymentError::internal(format!("register_task_definition failed: {e:?}")))?;
        registered
            .task_definition()
            .and_then(|td| td.task_definition_arn().map(str::to_string))
            .ok_or_else(|| DeploymentError::internal("Registered task definition has no arn"))
    }

    #[allow(clippy::too_many_arguments)]
    fn create_ecs_service(
        &self,
        cluster_name: &str,
        service_name: &str,
        task_definition_arn: &str,
        service: &ServiceDefinition,
        ingress: &convert::IngressSpec,
        subnet_ids: &[String],
        security_group_id: &str,
        target_group_arn: Option<&str>,
    ) -> Result<(), DeploymentError> {
        let (_providers, strategy) = self.default_capacity_providers();
        let mut request = self
            .ecs_client
            .create_service()
            .cluster(cluster_name)
            .service_name(service_name)
            .task_definition(task_definition_arn)
            .desired_count(convert::scale_to_desired_count(service.scale.as_ref()));

        match strategy {
            Some(strategy) => request = request.set_capacity_provider_strategy(Some(strategy)),
            None => {
                request = request.launch_type(match self.config.launch_kind {
                    LaunchKind::Fargate => ecs_types::LaunchType::Fargate,
                    LaunchKind::Ec2 => ecs_types::LaunchType::Ec2,
                });
            }
        }
        if self.config.launch_kind == LaunchKind::Fargate {
            request = request.platform_version("LATEST");
        }
        if self.config.network_mode == NetworkMode::Awsvpc {
            let mut awsvpc = ecs_types::AwsVpcConfiguration::builder()
                .set_subnets(Some(subnet_ids.to_vec()))
                .security_groups(security_group_id);
            if self.config.launch_kind == LaunchKind::Fargate {
                awsvpc = awsvpc.assign_public_ip(if ingress.external {
                    ecs_types::AssignPublicIp::Enabled
                } else {
                    ecs_types::AssignPublicIp::Disabled
                });
            }
            request = request.network_configuration(
                ecs_types::NetworkConfiguration::builder()
                    .awsvpc_configuration(awsvpc.build().map_err(|e| DeploymentError::internal(e.to_string()))?)
                    .build(),
            );
        }
        if ingress.external {
            if let (Some(target_group_arn), Some(container_name), Some(target_port)) =
                (target_group_arn, &ingress.container_name, ingress.target_port)
            {
                request = request.load_balancers(
                    ecs_types::LoadBalancer::builder()
                        .target_group_arn(target_group_arn)
                        .container_name(container_name)
                        .container_port(target_port as i32)
                        .build(),
                );
            }
        }
        block_on(request.send()).map_err(|e| DeploymentError::internal(format!("create_service failed: {e:?}")))?;
        Ok(())
    }

    fn update_ecs_service(
        &self,
        cluster_name: &str,
        service_name: &str,
        task_definition_arn: &str,
        service: &ServiceDefinition,
    ) -> Result<(), DeploymentError> {
        let mut request = self
            .ecs_client
            .update_service()
            .cluster(cluster_name)
            .service(service_name)
            .task_definition(task_definition_arn)
            .desired_count(convert::scale_to_desired_count(service.scale.as_ref()))
            .force_new_deployment(true);
        if self.config.launch_kind == LaunchKind::Fargate {
            request = request.platform_version("LATEST");
        }
        block_on(request.send()).map_err(|e| DeploymentError::internal(format!("update_service failed: {e:?}")))?;
        Ok(())
    }

    // ---- Result shaping -----------------------------------------------

    fn service_item(&self, cluster_name: &str, service_name: &str) -> Result<ServiceItem, DeploymentError> {
        let service_desc = self
            .describe_service(cluster_name, service_name)?
            .filter(|s| s.status() == Some("ACTIVE"))
            .ok_or_else(|| DeploymentError::not_found(format!("Service {service_name} not found")))?;
        let task_def_arn = service_desc
            .task_definition()
            .ok_or_else(|| DeploymentError::internal("Service has no task definition"))?
            .to_string();
        let task_def = block_on(
            self.ecs_client
                .describe_task_definition()
                .task_definition(&task_def_arn)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("describe_task_definition failed: {e:?}")))?;
        let task_def = task_def
            .task_definition()
            .ok_or_else(|| DeploymentError::internal("Task definition missing"))?;

        let resolved_name = service_desc.service_name().unwrap_or(service_name).to_string();
        let scale = self.get_autoscaling(cluster_name, &resolved_name);
        let endpoint = self.service_endpoint(&service_desc);
        let (traffic, latest_created_revision) = self.revisions_traffic(&service_desc)?;

        let containers = convert_containers(task_def.container_definitions());
        let volumes: Vec<Volume> = task_def
            .volumes()
            .iter()
            .filter_map(|v| {
                v.name().map(|name| Volume {
                    name: name.to_string(),
                    kind: VolumeKind::EmptyDir,
                    size_limit: None,
                    read_only: false,
                    config: None,
                })
            })
            .collect();

        let mut scale = scale;
        if scale.mode == ScaleMode::Manual {
            scale.replicas = Some(service_desc.desired_count() as u32);
        }
        let latest_ready_revision = traffic
            .iter()
            .find(|t| t.percent == 100.0)
            .map(|t| t.revision.clone());

        let ingress = match &endpoint {
            None => crate::model::service::Ingress {
                external: false,
                target_port: None,
                port: None,
                transport: None,
            },
            Some(endpoint) => {
                let container_port = service_desc
                    .load_balancers()
                    .first()
                    .and_then(|lb| lb.container_port())
                    .unwrap_or(80) as u16;
                crate::model::service::Ingress {
                    external: true,
                    target_port: Some(container_port),
                    port: Some(endpoint.port),
                    transport: Some(endpoint.scheme.clone()),
                }
            }
        };

        let definition = ServiceDefinition {
            name: Some(resolved_name.clone()),
            images: vec![],
            containers,
            volumes,
            ingress: Some(ingress),
            scale: Some(scale),
            traffic: Some(traffic),
            restart_policy: Default::default(),
            latest_ready_revision,
            latest_created_revision,
        };

        Ok(ServiceItem {
            name: resolved_name,
            uri: endpoint.map(|e| e.uri),
            service: Some(definition),
        })
    }

    fn service_endpoint(&self, service_desc: &ecs_types::Service) -> Option<ServiceEndpoint> {
        let tg_arn = service_desc.load_balancers().first()?.target_group_arn()?;
        let tg = block_on(
            self.elbv2_client
                .describe_target_groups()
                .target_group_arns(tg_arn)
                .send(),
        )
        .ok()?;
        let lb_arn = tg.target_groups().first()?.load_balancer_arns().first()?.clone();
        let lb = block_on(
            self.elbv2_client
                .describe_load_balancers()
                .load_balancer_arns(&lb_arn)
                .send(),
        )
        .ok()?;
        let dns_name = lb.load_balancers().first()?.dns_name()?.to_string();
        let listeners = block_on(self.elbv2_client.describe_listeners().load_balancer_arn(&lb_arn).send()).ok()?;

        let matched = listeners.listeners().iter().find(|listener| {
            listener.default_actions().iter().any(|action| {
                action.r#type() == Some(&elbv2_types::ActionTypeEnum::Forward)
                    && action.target_group_arn() == Some(tg_arn)
            })
        });
        let listener = matched.or_else(|| listeners.listeners().first())?;
        let port = listener.port().unwrap_or(80) as u16;
        let scheme = if port == 443 { "https" } else { "http" };
        Some(ServiceEndpoint {
            uri: format!("{scheme}://{dns_name}"),
            port,
            scheme: scheme.to_string(),
        })
    }

    /// Traffic is implicit on ECS: the deployed revision has 100%.
    fn revisions_traffic(
        &self,
        service_desc: &ecs_types::Service,
    ) -> Result<(Vec<TrafficAllocation>, Option<String>), DeploymentError> {
        let current_td_arn = service_desc.task_definition().unwrap_or_default();
        let family = family_of(current_td_arn);

        let mut traffic = Vec::new();
        let mut latest_created_revision = None;
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self
                .ecs_client
                .list_task_definitions()
                .family_prefix(&family)
                .status(ecs_types::TaskDefinitionStatus::Active)
                .sort(ecs_types::SortOrder::Desc)
                .max_results(100);
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let page = block_on(request.send())
                .map_err(|e| DeploymentError::internal(format!("list_task_definitions failed: {e:?}")))?;
            for td_arn in page.task_definition_arns() {
                let td_id = revision_id_of(td_arn);
                if latest_created_revision.is_none() {
                    latest_created_revision = Some(td_id.clone());
                }
                let current = td_arn == current_td_arn;
                traffic.push(TrafficAllocation {
                    revision: td_id,
                    percent: if current { 100.0 } else { 0.0 },
                    latest_revision: current,
                    tag: None,
                });
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok((traffic, latest_created_revision))
    }

    fn revision_from_task_definition(
        &self,
        td_id: &str,
        task_def: &ecs_types::TaskDefinition,
        current: bool,
    ) -> Revision {
        let containers = convert_containers(task_def.container_definitions());
        let volumes: Vec<Volume> = task_def
            .volumes()
            .iter()
            .filter_map(|v| {
                v.name().map(|name| Volume {
                    name: name.to_string(),
                    kind: VolumeKind::EmptyDir,
                    size_limit: None,
                    read_only: false,
                    config: None,
                })
            })
            .collect();
        Revision {
            name: td_id.to_string(),
            traffic: Some(if current { 100.0 } else { 0.0 }),
            created_time: task_def.registered_at().map(|t| t.as_secs_f64()),
            status: task_def.status().map(|s| s.as_str().to_string()),
            active: Some(current),
            containers,
            volumes,
        }
    }

    fn deregister_task_definitions(&self, service_name: &str) {
        if let Ok(output) = block_on(
            self.ecs_client
                .list_task_definitions()
                .family_prefix(service_name)
                .send(),
        ) {
            for td_arn in output.task_definition_arns() {
                let _ = block_on(
                    self.ecs_client
                        .deregister_task_definition()
                        .task_definition(td_arn)
                        .send(),
                );
            }
        }
    }
}

struct ServiceEndpoint {
    uri: String,
    port: u16,
    scheme: String,
}

fn family_of(task_definition_arn: &str) -> String {
    task_definition_arn
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .rsplit_once(':')
        .map(|(family, _)| family.to_string())
        .unwrap_or_default()
}

fn revision_id_of(task_definition_arn: &str) -> String {
    task_definition_arn.rsplit('/').next().unwrap_or_default().to_string()
}

fn convert_containers(container_definitions: &[ecs_types::ContainerDefinition]) -> Vec<Container> {
    let mut init_containers: Vec<String> = Vec::new();
    for definition in container_definitions {
        for dependency in definition.depends_on() {
            if let Some(name) = dependency.container_name() {
                if !init_containers.iter().any(|existing| existing == name) {
                    init_containers.push(name.to_string());
                }
            }
        }
    }

    container_definitions
        .iter()
        .map(|definition| {
            let name = definition.name().unwrap_or("main").to_string();
            let resources = match (definition.cpu(), definition.memory()) {
                (cpu, Some(memory)) if cpu > 0 => {
                    let cores = convert::cpu_units_to_cores(cpu as u32);
                    Some(ResourceRequirements {
                        requests: Some(ResourceSpec {
                            cpu: Some(cores),
                            memory: Some(memory as u32),
                            gpu: None,
                        }),
                        limits: Some(ResourceSpec {
                            cpu: Some(cores),
                            memory: Some(memory as u32),
                            gpu: None,
                        }),
                        ..Default::default()
                    })
                }
                _ => None,
            };
            let probes = definition.health_check().and_then(|hc| {
                convert::healthcheck_to_probes(
                    hc.command(),
                    hc.interval().unwrap_or(30),
                    hc.timeout().unwrap_or(5),
                    hc.retries().unwrap_or(3),
                    hc.start_period().unwrap_or(0),
                )
            });
            Container {
                kind: if init_containers.contains(&name) {
                    ContainerKind::Init
                } else {
                    ContainerKind::Main
                },
                image: definition.image().map(str::to_string),
                command: (!definition.entry_point().is_empty()).then(|| definition.entry_point().to_vec()),
                args: (!definition.command().is_empty()).then(|| definition.command().to_vec()),
                working_dir: definition.working_directory().map(str::to_string),
                env: definition
                    .environment()
                    .iter()
                    .filter_map(|kv| {
                        kv.name().map(|n| EnvVar {
                            name: n.to_string(),
                            value: kv.value().map(str::to_string),
                            value_from: None,
                        })
                    })
                    .collect(),
                ports: definition
                    .port_mappings()
                    .iter()
                    .filter_map(|pm| {
                        pm.container_port().map(|port| Port {
                            name: None,
                            container_port: port as u16,
                            host_port: pm.host_port().map(|p| p as u16),
                            protocol: match pm.protocol() {
                                Some(ecs_types::TransportProtocol::Udp) => Protocol::Udp,
                                _ => Protocol::Tcp,
                            },
                        })
                    })
                    .collect(),
                volume_mounts: definition
                    .mount_points()
                    .iter()
                    .filter_map(|mp| match (mp.source_volume(), mp.container_path()) {
                        (Some(volume), Some(path)) => Some(VolumeMount {
                            name: volume.to_string(),
                            mount_path: path.to_string(),
                            sub_path: None,
                            read_only: mp.read_only(),
                        }),
                        _ => None,
                    })
                    .collect(),
                resources,
                probes,
                name,
                ..Default::default()
            }
        })
        .collect()
}

impl ContainerDeploymentProvider for AmazonEcs {
    fn kind(&self) -> Kind {
        match self.config.launch_kind {
            LaunchKind::Fargate => Kind::AmazonEcsFargate,
            LaunchKind::Ec2 => Kind::AmazonEcsEc2,
        }
    }

    fn supports(&self, _feature: Feature) -> bool {
        // ECS carries the full feature set, revision management included.
        true
    }

    fn create_service(
        &self,
        service: &ServiceDefinition,
        where_exists: Option<bool>,
    ) -> Result<ServiceItem, DeploymentError> {
        let service_name = resolve_service_name(self.config.service_name.as_deref(), service)?;
        let cluster_name = self.cluster_name(&service_name);

        let existing_service = self
            .describe_service(&cluster_name, &service_name)?
            .filter(|s| s.status() == Some("ACTIVE"));

        let ingress = convert::convert_ingress(service);
        if existing_service.is_some() {
            if where_exists == Some(false) {
                return Err(DeploymentError::precondition_failed(format!(
                    "Service {service_name} already exists"
                )));
            }
            let (vpc_id, subnet_ids) = self.network_config()?;
            let execution_role_arn = self.ensure_execution_role()?;

            // Re-apply the readiness probe on the existing target group.
            if ingress.external {
                let existing_tg = existing_service
                    .as_ref()
                    .and_then(|s| s.load_balancers().first())
                    .and_then(|lb| lb.target_group_arn().map(str::to_string));
                if let Some(tg_arn) = existing_tg {
                    self.apply_readiness_probe_to_target_group(&tg_arn, service)?;
                }
            }
            let ecs_security_group_id = self.ensure_ecs_security_group(&cluster_name, &vpc_id)?;
            let mut caller_sg_id = self.config.alb_security_group_id.clone();
            if ingress.external && caller_sg_id.is_none() {
                caller_sg_id = Some(self.ensure_alb_security_group(
                    &cluster_name,
                    &vpc_id,
                    ingress.exposed_port.unwrap_or(80),
                )?);
            }
            self.ensure_security_group_ingress(&ecs_security_group_id, ingress.target_port, caller_sg_id.as_deref())?;
            if self.config.launch_kind == LaunchKind::Ec2 {
                self.ensure_ec2_capacity(&cluster_name, &subnet_ids, &ecs_security_group_id)?;
            }

            let registry = self.ensure_container_registry(service)?;
            let images = map_images(
                &service.containers,
                &service.images,
                self.containerizer.as_ref(),
                registry.as_deref(),
            )?;
            let task_def_arn =
                self.register_task_definition(&service_name, service, &images, &execution_role_arn)?;
            self.update_ecs_service(&cluster_name, &service_name, &task_def_arn, service)?;
            self.ensure_application_autoscaling(&cluster_name, &service_name, service.scale.as_ref())?;
            self.wait_for_service_stable(&cluster_name, &service_name, None);
        } else {
            if where_exists == Some(true) {
                return Err(DeploymentError::precondition_failed(format!(
                    "Service {service_name} not found"
                )));
            }
            self.ensure_cluster(&cluster_name)?;
            let execution_role_arn = self.ensure_execution_role()?;
            let (vpc_id, subnet_ids) = self.network_config()?;

            let mut caller_sg_id = self.config.alb_security_group_id.clone();
            let mut alb_arn = None;
            let mut target_group_arn = self.config.target_group_arn.clone();
            if ingress.external {
                if caller_sg_id.is_none() {
                    caller_sg_id = Some(self.ensure_alb_security_group(
                        &cluster_name,
                        &vpc_id,
                        ingress.exposed_port.unwrap_or(80),
                    )?);
                }
                if let Some(tg_arn) = &target_group_arn {
                    alb_arn = self.alb_from_target_group(tg_arn);
                } else {
                    let (created_alb, created_tg) = self.ensure_load_balancer(
                        &service_name,
                        &vpc_id,
                        &subnet_ids,
                        caller_sg_id.as_deref().unwrap_or_default(),
                        ingress.target_port.unwrap_or(80),
                        ingress.exposed_port.unwrap_or(80),
                    )?;
                    alb_arn = created_alb;
                    target_group_arn = Some(created_tg);
                }
                if let Some(tg_arn) = &target_group_arn {
                    self.apply_readiness_probe_to_target_group(tg_arn, service)?;
                }
            }

            let ecs_security_group_id = self.ensure_ecs_security_group(&cluster_name, &vpc_id)?;
            self.ensure_security_group_ingress(&ecs_security_group_id, ingress.target_port, caller_sg_id.as_deref())?;
            if self.config.launch_kind == LaunchKind::Ec2 {
                self.ensure_ec2_capacity(&cluster_name, &subnet_ids, &ecs_security_group_id)?;
            }

            let registry = self.ensure_container_registry(service)?;
            let images = map_images(
                &service.containers,
                &service.images,
                self.containerizer.as_ref(),
                registry.as_deref(),
            )?;
            let task_def_arn =
                self.register_task_definition(&service_name, service, &images, &execution_role_arn)?;
            self.create_ecs_service(
                &cluster_name,
                &service_name,
                &task_def_arn,
                service,
                &ingress,
                &subnet_ids,
                &ecs_security_group_id,
                target_group_arn.as_deref(),
            )?;
            self.ensure_application_autoscaling(&cluster_name, &service_name, service.scale.as_ref())?;
            self.wait_for_service_stable(&cluster_name, &service_name, alb_arn.as_deref());
        }

        self.service_item(&cluster_name, &service_name)
    }

    fn get_service(&self, name: &str) -> Result<ServiceItem, DeploymentError> {
        let cluster_name = self.cluster_name(name);
        self.service_item(&cluster_name, name)
    }

    fn delete_service(&self, name: &str) -> Result<(), DeploymentError> {
        let cluster_name = self.cluster_name(name);
        let service = self
            .describe_service(&cluster_name, name)?
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        drop(service);

        if block_on(
            self.ecs_client
                .update_service()
                .cluster(&cluster_name)
                .service(name)
                .desired_count(0)
                .send(),
        )
        .is_ok()
        {
            info!("Waiting for service {} to be drained", name);
            self.wait_for_drained(&cluster_name, name);
        }

        block_on(
            self.ecs_client
                .delete_service()
                .cluster(&cluster_name)
                .service(name)
                .force(true)
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("delete_service failed: {e:?}")))?;
        info!("Deleted service {}", name);

        if self.config.launch_kind == LaunchKind::Ec2 {
            self.delete_ec2_capacity(&cluster_name);
        }
        self.deregister_task_definitions(name);
        if self.config.execution_role_arn.is_none() {
            self.delete_execution_role();
        }
        self.delete_load_balancer(name);
        self.delete_security_group_by_name(&self.ecs_security_group_name(&cluster_name));
        self.delete_security_group_by_name(&format!("{cluster_name}-alb-sg"));
        self.delete_autoscaling(&cluster_name, name);
        self.delete_cluster(&cluster_name)?;
        Ok(())
    }

    fn list_services(&self) -> Result<Vec<ServiceItem>, DeploymentError> {
        let clusters: Vec<String> = match &self.config.cluster_name {
            Some(cluster) => vec![cluster.clone()],
            None => {
                let mut clusters = Vec::new();
                let mut next_token: Option<String> = None;
                loop {
                    let mut request = self.ecs_client.list_clusters();
                    if let Some(token) = &next_token {
                        request = request.next_token(token);
                    }
                    let page = block_on(request.send())
                        .map_err(|e| DeploymentError::internal(format!("list_clusters failed: {e:?}")))?;
                    clusters.extend(page.cluster_arns().iter().map(|arn| arn.to_string()));
                    next_token = page.next_token().map(str::to_string);
                    if next_token.is_none() {
                        break;
                    }
                }
                clusters
            }
        };

        let mut services = Vec::new();
        for cluster in clusters {
            let mut next_token: Option<String> = None;
            loop {
                let mut request = self.ecs_client.list_services().cluster(&cluster);
                if let Some(token) = &next_token {
                    request = request.next_token(token);
                }
                let page = block_on(request.send())
                    .map_err(|e| DeploymentError::internal(format!("list_services failed: {e:?}")))?;
                for service_arn in page.service_arns() {
                    if let Ok(item) = self.service_item(&cluster, service_arn) {
                        services.push(item);
                    }
                }
                next_token = page.next_token().map(str::to_string);
                if next_token.is_none() {
                    break;
                }
            }
        }
        Ok(services)
    }

    fn list_revisions(&self, name: &str, limit: Option<u32>) -> Result<Vec<Revision>, DeploymentError> {
        let cluster_name = self.cluster_name(name);
        let service = self
            .describe_service(&cluster_name, name)?
            .filter(|s| s.status() == Some("ACTIVE"))
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        let current_td_arn = service.task_definition().unwrap_or_default().to_string();
        let family = family_of(&current_td_arn);

        let mut revisions = Vec::new();
        let mut next_token: Option<String> = None;
        'pages: loop {
            let mut request = self
                .ecs_client
                .list_task_definitions()
                .family_prefix(&family)
                .status(ecs_types::TaskDefinitionStatus::Active)
                .sort(ecs_types::SortOrder::Desc)
                .max_results(100);
            if let Some(token) = &next_token {
                request = request.next_token(token);
            }
            let page = block_on(request.send())
                .map_err(|e| DeploymentError::internal(format!("list_task_definitions failed: {e:?}")))?;
            for td_arn in page.task_definition_arns() {
                let described = block_on(
                    self.ecs_client
                        .describe_task_definition()
                        .task_definition(td_arn)
                        .send(),
                )
                .map_err(|e| DeploymentError::internal(format!("describe_task_definition failed: {e:?}")))?;
                if let Some(task_def) = described.task_definition() {
                    let current = *td_arn == current_td_arn;
                    revisions.push(self.revision_from_task_definition(&revision_id_of(td_arn), task_def, current));
                    if let Some(limit) = limit {
                        if revisions.len() >= limit as usize {
                            break 'pages;
                        }
                    }
                }
            }
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(revisions)
    }

    fn get_revision(&self, name: &str, revision: &str) -> Result<Revision, DeploymentError> {
        let cluster_name = self.cluster_name(name);
        let service = self
            .describe_service(&cluster_name, name)?
            .filter(|s| s.status() == Some("ACTIVE"))
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        let current_td_arn = service.task_definition().unwrap_or_default().to_string();

        let described = block_on(
            self.ecs_client
                .describe_task_definition()
                .task_definition(revision)
                .send(),
        )
        .map_err(|_| DeploymentError::not_found(format!("Revision {revision} not found")))?;
        let task_def = described
            .task_definition()
            .ok_or_else(|| DeploymentError::not_found(format!("Revision {revision} not found")))?;
        let td_arn = task_def.task_definition_arn().unwrap_or_default();
        let current = td_arn == current_td_arn;
        Ok(self.revision_from_task_definition(&revision_id_of(td_arn), task_def, current))
    }

    fn delete_revision(&self, name: &str, revision: &str) -> Result<(), DeploymentError> {
        let cluster_name = self.cluster_name(name);
        let service = self
            .describe_service(&cluster_name, name)?
            .filter(|s| s.status() == Some("ACTIVE"))
            .ok_or_else(|| DeploymentError::not_found(format!("Service {name} not found")))?;
        let current_revision = revision_id_of(service.task_definition().unwrap_or_default());
        if revision == current_revision {
            return Err(DeploymentError::precondition_failed(
                "Cannot delete the current revision of the service",
            ));
        }
        block_on(
            self.ecs_client
                .deregister_task_definition()
                .task_definition(revision)
                .send(),
        )
        .map_err(|_| DeploymentError::not_found(format!("Revision {revision} not found")))?;
        Ok(())
    }

    fn update_traffic(&self, name: &str, traffic: &[TrafficAllocation]) -> Result<ServiceItem, DeploymentError> {
        let cluster_name = self.cluster_name(name);
        // ECS deliberately narrows traffic to one revision at 100%.
        let revision = single_revision_at_full_traffic(traffic)?;

        info!("Updating to revision: {}", revision);
        block_on(
            self.ecs_client
                .update_service()
                .cluster(&cluster_name)
                .service(name)
                .task_definition(revision)
                .send(),
        )
        .map_err(|err| {
            let message = err.to_string();
            if message.contains("ServiceNotFound") || message.contains("ClusterNotFound") {
                DeploymentError::not_found(format!("Service {name} not found"))
            } else if message.contains("taskDefinition") {
                DeploymentError::not_found(format!("Revision {revision} not found"))
            } else {
                DeploymentError::internal(format!("update_service failed: {err:?}"))
            }
        })?;
        self.wait_for_service_stable(&cluster_name, name, None);
        self.service_item(&cluster_name, name)
    }

    fn close(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
