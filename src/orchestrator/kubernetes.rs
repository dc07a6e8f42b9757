use super::{Orchestrator, OrchestratorError};
use crate::labels::LABEL_PREFIX;
use crate::models::{ImageReference, UpdateState, Workload, short_id};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Client, ResourceExt,
    api::{Api, ListParams, Patch, PatchParams},
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Orchestrator backed by Kubernetes Deployments. The first container of each
/// Deployment is the one kept up to date.
pub struct KubeOrchestrator {
    client: Client,
    namespace: Option<String>,
}

impl KubeOrchestrator {
    /// Watch `namespace`, or every namespace the client can see when `None`.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn list_api(&self) -> Api<Deployment> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn api_for(&self, workload: &Workload) -> Api<Deployment> {
        match workload.namespace.as_deref().or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    async fn fetch(&self, workload: &Workload) -> Result<Deployment, OrchestratorError> {
        let deployment = self
            .api_for(workload)
            .get(&workload.name)
            .await
            .map_err(|e| map_kube_error(&workload.display_name(), e))?;

        // Same name, different object: the one we knew is gone.
        if deployment.uid().as_deref() != Some(workload.id.as_str()) {
            return Err(OrchestratorError::NotFound(workload.display_name()));
        }

        Ok(deployment)
    }
}

#[async_trait::async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_workloads(&self, selector: Option<&str>) -> Result<Vec<Workload>, OrchestratorError> {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }

        let deployments = self
            .list_api()
            .list(&params)
            .await
            .map_err(|e| OrchestratorError::Api(e.to_string()))?;

        let workloads: Vec<Workload> = deployments
            .items
            .iter()
            .filter_map(workload_from_deployment)
            .collect();

        debug!("Listed {} deployments", workloads.len());
        Ok(workloads)
    }

    async fn get_workload(&self, workload: &Workload) -> Result<Workload, OrchestratorError> {
        let deployment = self.fetch(workload).await?;
        workload_from_deployment(&deployment)
            .ok_or_else(|| OrchestratorError::NotFound(workload.display_name()))
    }

    async fn update_image(
        &self,
        workload: &Workload,
        image: &ImageReference,
        force: bool,
    ) -> Result<(), OrchestratorError> {
        let deployment = self.fetch(workload).await?;
        let container = first_container_name(&deployment).ok_or_else(|| {
            OrchestratorError::Api(format!("{} has no containers", workload.display_name()))
        })?;

        let patch = image_patch(&container, &image.to_string(), force);

        info!(
            "Updating deployment {} container {} to image {}",
            workload.display_name(),
            container,
            image
        );

        self.api_for(workload)
            .patch(&workload.name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| map_kube_error(&workload.display_name(), e))?;

        Ok(())
    }
}

fn map_kube_error(name: &str, error: kube::Error) -> OrchestratorError {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            OrchestratorError::NotFound(name.to_string())
        },
        e => OrchestratorError::Api(e.to_string()),
    }
}

fn first_container_name(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
        .map(|c| c.name.clone())
}

/// Strategic-merge patch setting one container's image. A forced update also
/// stamps the pod template, which rolls the pods even for an identical image.
fn image_patch(container: &str, image: &str, force: bool) -> serde_json::Value {
    let mut patch = json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": container,
                        "image": image
                    }]
                }
            }
        }
    });

    if force {
        patch["spec"]["template"]["metadata"] = json!({
            "annotations": {
                RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339()
            }
        });
    }

    patch
}

/// Map a Deployment to a workload. Deployments without a uid or a container are skipped.
fn workload_from_deployment(deployment: &Deployment) -> Option<Workload> {
    let name = deployment.name_any();
    let Some(id) = deployment.uid() else {
        warn!("Deployment {} has no uid, skipping", name);
        return None;
    };

    let image = deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()?;

    Some(Workload {
        short_id: short_id(&id),
        id,
        name,
        namespace: deployment.namespace(),
        image: ImageReference::parse(&image),
        update_state: if rollout_in_progress(deployment) {
            UpdateState::Updating
        } else {
            UpdateState::Idle
        },
        labels: merged_labels(deployment),
    })
}

/// Deployment labels overlaid with crosswind annotations. Label values cannot
/// hold URLs, so webhook settings usually live in annotations.
fn merged_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    let mut labels = deployment.labels().clone();
    labels.extend(
        deployment
            .annotations()
            .iter()
            .filter(|(key, _)| key.starts_with(LABEL_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    labels
}

/// Whether the controller is still rolling out the latest pod template.
fn rollout_in_progress(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let Some(status) = &deployment.status else {
        return generation > 0;
    };

    // A rollout past its progress deadline will not converge on its own.
    let stalled = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if stalled {
        return false;
    }

    let observed = status.observed_generation.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    observed < generation
        || updated < desired
        || ready < desired
        || available < desired
        || total > updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(status: serde_json::Value) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "uid": "3f1c2a9e-7b4d-4c1e-9a55-0d2f6b7c8e90",
                "generation": 2,
                "labels": { "app": "web" },
                "annotations": {
                    "crosswind.sh/webhook.http.url": "https://example.test/hook",
                    "deployment.kubernetes.io/revision": "2"
                }
            },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "web" } },
                "template": {
                    "metadata": { "labels": { "app": "web" } },
                    "spec": {
                        "containers": [
                            { "name": "web", "image": "nginx@sha256:AAA" },
                            { "name": "sidecar", "image": "envoy:1.30" }
                        ]
                    }
                }
            },
            "status": status
        }))
        .unwrap()
    }

    fn complete() -> serde_json::Value {
        json!({
            "observedGeneration": 2,
            "replicas": 2,
            "updatedReplicas": 2,
            "readyReplicas": 2,
            "availableReplicas": 2
        })
    }

    #[test]
    fn test_workload_from_deployment() {
        let workload = workload_from_deployment(&deployment(complete())).unwrap();

        assert_eq!(workload.name, "web");
        assert_eq!(workload.namespace.as_deref(), Some("default"));
        assert_eq!(workload.short_id, "3f1c2a9e7b4d");
        assert_eq!(workload.image.to_string(), "nginx@sha256:AAA");
        assert_eq!(workload.update_state, UpdateState::Idle);
        assert_eq!(workload.labels.get("app").map(String::as_str), Some("web"));
        assert!(workload.labels.contains_key("crosswind.sh/webhook.http.url"));
        assert!(!workload.labels.contains_key("deployment.kubernetes.io/revision"));
    }

    #[test]
    fn test_rollout_not_observed_is_updating() {
        let mut status = complete();
        status["observedGeneration"] = json!(1);
        assert!(rollout_in_progress(&deployment(status)));
    }

    #[test]
    fn test_old_replicas_remaining_is_updating() {
        let mut status = complete();
        status["replicas"] = json!(3);
        assert!(rollout_in_progress(&deployment(status)));
    }

    #[test]
    fn test_unavailable_replicas_is_updating() {
        let mut status = complete();
        status["availableReplicas"] = json!(1);
        assert!(rollout_in_progress(&deployment(status)));
    }

    #[test]
    fn test_stalled_rollout_is_not_updating() {
        let mut status = complete();
        status["updatedReplicas"] = json!(1);
        status["conditions"] = json!([{
            "type": "Progressing",
            "status": "False",
            "reason": "ProgressDeadlineExceeded"
        }]);
        assert!(!rollout_in_progress(&deployment(status)));
    }

    #[test]
    fn test_forced_patch_stamps_template() {
        let patch = image_patch("web", "nginx@sha256:BBB", true);
        assert_eq!(
            patch["spec"]["template"]["spec"]["containers"][0]["image"],
            "nginx@sha256:BBB"
        );
        assert!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION].is_string()
        );

        let plain = image_patch("web", "nginx@sha256:BBB", false);
        assert!(plain["spec"]["template"].get("metadata").is_none());
    }

    #[test]
    fn test_first_container_is_used() {
        assert_eq!(
            first_container_name(&deployment(complete())).as_deref(),
            Some("web")
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"web\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(map_kube_error("default/web", error).is_not_found());
    }
}
