use aws_sdk_ec2::types::{
    Filter, LaunchTemplateIamInstanceProfileSpecificationRequest, RequestLaunchTemplateData,
};

use crate::compute::container_deployment::DeploymentError;
use crate::runtime::block_on;

/// Existing launch template by name, or a fresh one from the given pieces.
/// Returns `(template_id, version)`.
#[allow(clippy::too_many_arguments)]
pub fn ensure_launch_template(
    ec2_client: &aws_sdk_ec2::Client,
    launch_template_name: &str,
    ami_id: &str,
    instance_type: &str,
    security_group_id: &str,
    instance_profile_arn: Option<&str>,
    user_data: &str,
) -> Result<(String, String), DeploymentError> {
    match block_on(
        ec2_client
            .describe_launch_templates()
            .launch_template_names(launch_template_name)
            .send(),
    ) {
        Ok(output) => {
            if let Some(template) = output.launch_templates().first() {
                if let Some(id) = template.launch_template_id() {
                    return Ok((id.to_string(), "$Latest".to_string()));
                }
            }
        }
        Err(err) => {
            if !err.to_string().contains("NotFoundException") {
                return Err(DeploymentError::internal(format!(
                    "describe_launch_templates failed: {err:?}"
                )));
            }
        }
    }

    let mut data = RequestLaunchTemplateData::builder()
        .image_id(ami_id)
        .instance_type(aws_sdk_ec2::types::InstanceType::from(instance_type))
        .security_group_ids(security_group_id)
        .user_data(user_data);
    if let Some(arn) = instance_profile_arn {
        data = data.iam_instance_profile(
            LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                .arn(arn)
                .build(),
        );
    }

    let created = block_on(
        ec2_client
            .create_launch_template()
            .launch_template_name(launch_template_name)
            .launch_template_data(data.build())
            .send(),
    )
    .map_err(|e| DeploymentError::internal(format!("create_launch_template failed: {e:?}")))?;
    info!("Created launch template: {}", launch_template_name);
    let template_id = created
        .launch_template()
        .and_then(|t| t.launch_template_id())
        .ok_or_else(|| DeploymentError::internal("Created launch template has no id"))?;
    Ok((template_id.to_string(), "$Latest".to_string()))
}

pub fn delete_launch_template(
    ec2_client: &aws_sdk_ec2::Client,
    launch_template_name: &str,
) -> Result<(), DeploymentError> {
    match block_on(
        ec2_client
            .delete_launch_template()
            .launch_template_name(launch_template_name)
            .send(),
    ) {
        Ok(_) => Ok(()),
        Err(err) => {
            if err.to_string().contains("NotFound") {
                Ok(())
            } else {
                Err(DeploymentError::internal(format!(
                    "delete_launch_template failed: {err:?}"
                )))
            }
        }
    }
}

/// Fall back to the default VPC and its subnets when the caller supplied
/// neither.
pub fn auto_detect_network_config(
    ec2_client: &aws_sdk_ec2::Client,
    vpc_id: Option<&str>,
    subnet_ids: &[String],
) -> Result<(Option<String>, Vec<String>), DeploymentError> {
    let mut vpc_id = vpc_id.map(str::to_string);
    let mut subnet_ids = subnet_ids.to_vec();

    if vpc_id.is_none() {
        let vpcs = block_on(
            ec2_client
                .describe_vpcs()
                .filters(Filter::builder().name("is-default").values("true").build())
                .send(),
        )
        .map_err(|e| DeploymentError::internal(format!("describe_vpcs failed: {e:?}")))?;
        vpc_id = vpcs.vpcs().first().and_then(|v| v.vpc_id().map(str::to_string));
    }

    if subnet_ids.is_empty() {
        if let Some(vpc) = &vpc_id {
            let subnets = block_on(
                ec2_client
                    .describe_subnets()
                    .filters(Filter::builder().name("vpc-id").values(vpc).build())
                    .send(),
            )
            .map_err(|e| DeploymentError::internal(format!("describe_subnets failed: {e:?}")))?;
            subnet_ids = subnets
                .subnets()
                .iter()
                .filter_map(|s| s.subnet_id().map(str::to_string))
                .collect();
        }
    }

    Ok((vpc_id, subnet_ids))
}
