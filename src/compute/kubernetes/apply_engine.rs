use std::time::{Duration, Instant};

use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use serde_json::Value;

use crate::compute::kubernetes::{AppliedResource, ApplyOptions, KubernetesError};
use crate::merge::merge;
use crate::runtime::block_on;

pub const FIELD_MANAGER: &str = "nimbus-engine";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Shared server-side-apply engine every Kubernetes provider drives with
/// its own client.
pub struct ApplyEngine {
    client: kube::Client,
}

impl ApplyEngine {
    pub fn new(client: kube::Client) -> ApplyEngine {
        ApplyEngine { client }
    }

    /// Split a multi-document YAML stream into JSON trees, dropping empty
    /// documents.
    pub fn parse_manifests(manifests: &str) -> Result<Vec<Value>, KubernetesError> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(manifests) {
            let value: Value = serde::Deserialize::deserialize(document)
                .map_err(|e| KubernetesError::bad_request(format!("Invalid manifest YAML: {e}")))?;
            if value.is_null() {
                continue;
            }
            if !value.is_object() {
                return Err(KubernetesError::bad_request("Manifest documents must be objects"));
            }
            documents.push(value);
        }
        Ok(documents)
    }

    /// Normalization: stamp the managed-by label, default the namespace,
    /// merge the overlay, rewrite image references.
    pub fn normalize(document: &Value, options: &ApplyOptions) -> Value {
        let mut normalized = match &options.overlay {
            Some(overlay) => merge(document, overlay),
            None => document.clone(),
        };

        if let Some(labels) = normalized
            .pointer_mut("/metadata")
            .and_then(|metadata| metadata.as_object_mut())
        {
            let label_map = labels
                .entry("labels")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(label_map) = label_map.as_object_mut() {
                label_map.insert(MANAGED_BY_LABEL.to_string(), Value::String(FIELD_MANAGER.to_string()));
            }
        }
        if let Some(namespace) = &options.namespace {
            if normalized.pointer("/metadata/namespace").is_none() {
                if let Some(metadata) = normalized.pointer_mut("/metadata").and_then(|m| m.as_object_mut()) {
                    metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
                }
            }
        }
        if !options.image_overrides.is_empty() {
            rewrite_images(&mut normalized, &options.image_overrides);
        }
        normalized
    }

    fn resolve_api(
        &self,
        document: &Value,
        default_namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, AppliedResource), KubernetesError> {
        let api_version = document
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KubernetesError::bad_request("Manifest document has no apiVersion"))?;
        let kind = document
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KubernetesError::bad_request("Manifest document has no kind"))?;
        let name = document
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KubernetesError::bad_request("Manifest document has no metadata.name"))?;
        let namespace = document
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .or(default_namespace);

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind::gvk(&group, &version, kind);

        let discovery = block_on(Discovery::new(self.client.clone()).run())
            .map_err(|e| KubernetesError::internal(format!("API discovery failed: {e}")))?;
        let (api_resource, capabilities) = discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| KubernetesError::bad_request(format!("Unknown resource kind: {api_version}/{kind}")))?;

        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => {
                let namespace = namespace.unwrap_or("default");
                Api::namespaced_with(self.client.clone(), namespace, &api_resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &api_resource),
        };

        Ok((
            api,
            AppliedResource {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                namespace: matches!(capabilities.scope, Scope::Namespaced)
                    .then(|| namespace.unwrap_or("default").to_string()),
                name: name.to_string(),
            },
        ))
    }

    pub fn apply(&self, manifests: &str, options: &ApplyOptions) -> Result<Vec<AppliedResource>, KubernetesError> {
        let documents = Self::parse_manifests(manifests)?;
        let mut applied = Vec::with_capacity(documents.len());

        for document in &documents {
            let normalized = Self::normalize(document, options);
            let (api, resource) = self.resolve_api(&normalized, options.namespace.as_deref())?;

            let patch_params = PatchParams::apply(FIELD_MANAGER).force();
            block_on(api.patch(&resource.name, &patch_params, &Patch::Apply(&normalized)))
                .map_err(|e| KubernetesError::internal(format!("apply failed for {}: {e}", resource.name)))?;
            info!("Applied {}/{}", resource.kind, resource.name);
            applied.push(resource);
        }

        if options.prune {
            self.prune(&applied, options)?;
        }
        if options.wait {
            self.wait_ready(&applied, options.wait_timeout)?;
        }
        Ok(applied)
    }

    /// Delete previously applied objects of the just-applied kinds that
    /// are no longer part of the manifest set.
    fn prune(&self, applied: &[AppliedResource], options: &ApplyOptions) -> Result<(), KubernetesError> {
        let mut seen_kinds: Vec<(String, String, Option<String>)> = Vec::new();
        for resource in applied {
            let key = (resource.api_version.clone(), resource.kind.clone(), resource.namespace.clone());
            if !seen_kinds.contains(&key) {
                seen_kinds.push(key);
            }
        }
        for (api_version, kind, namespace) in seen_kinds {
            let probe = serde_json::json!({
                "apiVersion": api_version,
                "kind": kind,
                "metadata": {"name": "probe", "namespace": namespace},
            });
            let (api, _) = self.resolve_api(&probe, options.namespace.as_deref())?;
            let list_params = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={FIELD_MANAGER}"));
            let existing = block_on(api.list(&list_params))
                .map_err(|e| KubernetesError::internal(format!("list failed for prune: {e}")))?;
            for object in existing.items {
                let name = object.metadata.name.clone().unwrap_or_default();
                let still_wanted = applied
                    .iter()
                    .any(|resource| resource.kind == kind && resource.name == name);
                if !still_wanted {
                    info!("Pruning {}/{}", kind, name);
                    let _ = block_on(api.delete(&name, &DeleteParams::default()));
                }
            }
        }
        Ok(())
    }

    pub fn delete(&self, manifests: &str, namespace: Option<&str>) -> Result<(), KubernetesError> {
        let documents = Self::parse_manifests(manifests)?;
        // Reverse order so dependents go before their owners.
        for document in documents.iter().rev() {
            let (api, resource) = self.resolve_api(document, namespace)?;
            match block_on(api.delete(&resource.name, &DeleteParams::default())) {
                Ok(_) => info!("Deleted {}/{}", resource.kind, resource.name),
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(e) => {
                    return Err(KubernetesError::internal(format!(
                        "delete failed for {}: {e}",
                        resource.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn wait_ready(&self, resources: &[AppliedResource], timeout: Duration) -> Result<(), KubernetesError> {
        let start = Instant::now();
        for resource in resources {
            loop {
                let probe = serde_json::json!({
                    "apiVersion": resource.api_version,
                    "kind": resource.kind,
                    "metadata": {"name": resource.name, "namespace": resource.namespace},
                });
                let (api, _) = self.resolve_api(&probe, resource.namespace.as_deref())?;
                let ready = match block_on(api.get(&resource.name)) {
                    Ok(object) => is_ready(&resource.kind, &object),
                    Err(kube::Error::Api(err)) if err.code == 404 => false,
                    Err(e) => return Err(KubernetesError::internal(format!("get failed: {e}"))),
                };
                if ready {
                    break;
                }
                if start.elapsed() > timeout {
                    return Err(KubernetesError::Timeout {
                        raw_error_message: format!("{}/{} did not become ready", resource.kind, resource.name),
                    });
                }
                std::thread::sleep(Duration::from_secs(3));
            }
        }
        Ok(())
    }
}

fn is_ready(kind: &str, object: &DynamicObject) -> bool {
    let data = &object.data;
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = data
                .pointer("/spec/replicas")
                .and_then(|v| v.as_i64())
                .unwrap_or(1);
            let ready = data
                .pointer("/status/readyReplicas")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            ready >= desired
        }
        "DaemonSet" => {
            let desired = data
                .pointer("/status/desiredNumberScheduled")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let ready = data
                .pointer("/status/numberReady")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            desired > 0 && ready >= desired
        }
        "Pod" => matches!(
            data.pointer("/status/phase").and_then(|v| v.as_str()),
            Some("Running") | Some("Succeeded")
        ),
        "Job" => data
            .pointer("/status/succeeded")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .gt(&0),
        // Anything else is ready once it exists.
        _ => true,
    }
}

/// Rewrite `image:` references in pod templates by image name.
fn rewrite_images(document: &mut Value, overrides: &std::collections::HashMap<String, String>) {
    match document {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if key == "image" {
                    if let Some(reference) = value.as_str() {
                        let name = reference
                            .rsplit('/')
                            .next()
                            .unwrap_or(reference)
                            .split(':')
                            .next()
                            .unwrap_or(reference);
                        if let Some(replacement) = overrides.get(name).or_else(|| overrides.get(reference)) {
                            *value = Value::String(replacement.clone());
                            continue;
                        }
                    }
                }
                rewrite_images(value, overrides);
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_images(item, overrides);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use serde_json::json;

    #[test]
    fn parse_manifests_splits_documents() {
        let manifests = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";
        let documents = ApplyEngine::parse_manifests(manifests).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["kind"], "Service");
        assert_eq!(documents[1]["kind"], "Deployment");
    }

    #[test]
    fn normalize_stamps_labels_and_namespace() {
        let document = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
        });
        let options = ApplyOptions {
            namespace: Some("staging".to_string()),
            ..Default::default()
        };
        let normalized = ApplyEngine::normalize(&document, &options);
        assert_eq!(normalized.pointer("/metadata/namespace").unwrap(), "staging");
        assert_eq!(
            normalized.pointer("/metadata/labels").unwrap()[MANAGED_BY_LABEL],
            FIELD_MANAGER
        );
    }

    #[test]
    fn overlay_null_removes_fields() {
        let document = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "annotations": {"x": "y"}},
        });
        let options = ApplyOptions {
            overlay: Some(json!({"metadata": {"annotations": null}})),
            ..Default::default()
        };
        let normalized = ApplyEngine::normalize(&document, &options);
        assert!(normalized.pointer("/metadata/annotations").is_none());
    }

    #[test]
    fn image_rewrite_matches_by_image_name() {
        let document = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"template": {"spec": {"containers": [
                {"name": "web", "image": "web:latest"},
                {"name": "sidecar", "image": "envoy:v1"},
            ]}}},
        });
        let options = ApplyOptions {
            image_overrides: hashmap! {
                "web".to_string() => "registry.example.com/web@sha256:abc".to_string(),
            },
            ..Default::default()
        };
        let normalized = ApplyEngine::normalize(&document, &options);
        let containers = normalized
            .pointer("/spec/template/spec/containers")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(containers[0]["image"], "registry.example.com/web@sha256:abc");
        assert_eq!(containers[1]["image"], "envoy:v1");
    }
}
