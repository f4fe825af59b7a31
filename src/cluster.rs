use crate::credentials::{DOCKER_CFG_KEY, DOCKER_CONFIG_JSON_KEY};
use crate::crd::{AgentDeployment, AgentDeploymentStatus};
use crate::state::{PodIdentity, PodSnapshot};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

/// Cluster operations an update cycle depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods belonging to the instance, in its namespace
    async fn list_pods(&self, instance: &AgentDeployment) -> anyhow::Result<Vec<PodSnapshot>>;

    async fn delete_pod(&self, pod: &PodIdentity) -> anyhow::Result<()>;

    /// Registry credential payload of a pull secret, `None` if the secret does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn update_status(
        &self,
        instance: &AgentDeployment,
        status: &AgentDeploymentStatus,
    ) -> anyhow::Result<()>;
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of(instance: &AgentDeployment) -> anyhow::Result<String> {
    instance
        .namespace()
        .with_context(|| format!("AgentDeployment {} has no namespace", instance.name_any()))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(&self, instance: &AgentDeployment) -> anyhow::Result<Vec<PodSnapshot>> {
        let namespace = namespace_of(instance)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let label_selector = instance.pod_selector();

        let pod_list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .with_context(|| {
                format!(
                    "Failed to list pods in namespace {} with label {}",
                    namespace, label_selector
                )
            })?;
        debug!(
            "Found {} pods with label {} in namespace {}",
            pod_list.items.len(),
            label_selector,
            namespace
        );

        Ok(pod_list.items.iter().map(PodSnapshot::from).collect())
    }

    async fn delete_pod(&self, pod: &PodIdentity) -> anyhow::Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        pods.delete(&pod.name, &DeleteParams::default())
            .await
            .with_context(|| format!("Failed to delete pod {}", pod))?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = secrets
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get secret {}/{}", namespace, name))?
        else {
            return Ok(None);
        };

        let payload = secret.data.and_then(|mut data| {
            data.remove(DOCKER_CONFIG_JSON_KEY)
                .or_else(|| data.remove(DOCKER_CFG_KEY))
        });
        Ok(payload.map(|bytes| bytes.0))
    }

    async fn update_status(
        &self,
        instance: &AgentDeployment,
        status: &AgentDeploymentStatus,
    ) -> anyhow::Result<()> {
        let namespace = namespace_of(instance)?;
        let name = instance.name_any();
        let api: Api<AgentDeployment> = Api::namespaced(self.client.clone(), &namespace);

        let mut patch = json!({ "status": status });
        // The resourceVersion makes the API server reject the write if the instance changed meanwhile
        if let Some(resource_version) = instance.resource_version() {
            patch["metadata"] = json!({ "resourceVersion": resource_version });
        }
        debug!("Patching status of AgentDeployment {} with {}", name, patch);

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to update status of AgentDeployment {}", name))?;
        Ok(())
    }
}
