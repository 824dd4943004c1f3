use std::sync::Arc;
use std::time::Duration;

use crate::cmd::shell::Shell;
use crate::compute::kubernetes::cluster::Cluster;
use crate::compute::kubernetes::{AppliedResource, ApplyOptions, Kind, KubernetesError, KubernetesProvider};

const MINIKUBE_CONTEXT: &str = "minikube";

/// Minikube-backed provider: checks the local cluster is up, then drives
/// the shared apply engine against the `minikube` kube context.
pub struct Minikube {
    cluster: Cluster,
    shell: Arc<dyn Shell>,
}

impl Minikube {
    pub fn new(shell: Arc<dyn Shell>) -> Result<Minikube, KubernetesError> {
        let status = shell
            .run(
                "minikube",
                &["status", "--format", "{{.Host}}"],
                &[],
                Some(Duration::from_secs(30)),
            )
            .map_err(|e| KubernetesError::internal(format!("Cannot check minikube status: {e}")))?;
        if !status.stdout_string().contains("Running") {
            return Err(KubernetesError::internal("Minikube is not running"));
        }
        Ok(Minikube {
            cluster: Cluster::with_context(MINIKUBE_CONTEXT)?,
            shell,
        })
    }

    /// Side-load a locally built image into the minikube runtime so pods
    /// can use it without a registry.
    pub fn load_image(&self, image_name: &str) -> Result<(), KubernetesError> {
        self.shell
            .run(
                "minikube",
                &["image", "load", image_name],
                &[],
                Some(Duration::from_secs(300)),
            )
            .map_err(|e| KubernetesError::internal(format!("Cannot load image into minikube: {e}")))?;
        Ok(())
    }
}

impl KubernetesProvider for Minikube {
    fn kind(&self) -> Kind {
        Kind::Minikube
    }

    fn apply(&self, manifests: &str, options: &ApplyOptions) -> Result<Vec<AppliedResource>, KubernetesError> {
        self.cluster.apply(manifests, options)
    }

    fn delete(&self, manifests: &str, namespace: Option<&str>) -> Result<(), KubernetesError> {
        self.cluster.delete(manifests, namespace)
    }

    fn wait_ready(&self, resources: &[AppliedResource], timeout: Duration) -> Result<(), KubernetesError> {
        self.cluster.wait_ready(resources, timeout)
    }
}
