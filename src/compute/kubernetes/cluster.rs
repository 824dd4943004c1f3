use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::compute::kubernetes::apply_engine::ApplyEngine;
use crate::compute::kubernetes::{AppliedResource, ApplyOptions, Kind, KubernetesError, KubernetesProvider};
use crate::runtime::block_on;

/// Generic cluster provider over whatever the ambient kubeconfig (or the
/// in-cluster environment) points at.
pub struct Cluster {
    engine: ApplyEngine,
}

impl Cluster {
    pub fn new() -> Result<Cluster, KubernetesError> {
        let client = block_on(kube::Client::try_default())
            .map_err(|e| KubernetesError::internal(format!("Cannot create kube client: {e}")))?;
        Ok(Cluster {
            engine: ApplyEngine::new(client),
        })
    }

    pub fn with_context(context: &str) -> Result<Cluster, KubernetesError> {
        let kubeconfig = Kubeconfig::read()
            .map_err(|e| KubernetesError::internal(format!("Cannot read kubeconfig: {e}")))?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = block_on(kube::Config::from_custom_kubeconfig(kubeconfig, &options))
            .map_err(|e| KubernetesError::internal(format!("Cannot load kube context: {e}")))?;
        let client = kube::Client::try_from(config)
            .map_err(|e| KubernetesError::internal(format!("Cannot create kube client: {e}")))?;
        Ok(Cluster {
            engine: ApplyEngine::new(client),
        })
    }
}

impl KubernetesProvider for Cluster {
    fn kind(&self) -> Kind {
        Kind::Cluster
    }

    fn apply(&self, manifests: &str, options: &ApplyOptions) -> Result<Vec<AppliedResource>, KubernetesError> {
        self.engine.apply(manifests, options)
    }

    fn delete(&self, manifests: &str, namespace: Option<&str>) -> Result<(), KubernetesError> {
        self.engine.delete(manifests, namespace)
    }

    fn wait_ready(&self, resources: &[AppliedResource], timeout: Duration) -> Result<(), KubernetesError> {
        self.engine.wait_ready(resources, timeout)
    }
}
