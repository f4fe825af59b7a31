use crate::cluster::ClusterClient;
use crate::credentials::{REGISTRY_PULL_SECRET, RegistryCredentials};
use crate::crd::AgentDeployment;
use crate::oci_registry::VersionChecker;
use crate::state::PodSnapshot;
use crate::update::UpdateError;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

/// Finds the pods of `instance` that run at least one container with a stale image digest.
///
/// Containers without an observed digest are skipped, as are all containers when the instance
/// has no desired image. A registry failure only makes that one container indeterminate, except
/// rate limiting, which aborts the whole detection pass.
pub async fn find_outdated_pods(
    cluster: &dyn ClusterClient,
    version_checker: &dyn VersionChecker,
    instance: &AgentDeployment,
) -> Result<Vec<PodSnapshot>, UpdateError> {
    let pods = cluster.list_pods(instance).await.map_err(|source| {
        error!("Failed to list pods: {:#}", source);
        UpdateError::PodListFailed {
            instance: instance.name_any(),
            source,
        }
    })?;
    let desired_image = instance.desired_image();

    let mut outdated_pods = Vec::new();
    for pod in pods {
        for container in &pod.containers {
            let Some(desired_image) = desired_image else {
                // Nothing to compare against
                continue;
            };
            if container.digest.is_empty() {
                debug!(
                    "Skipping container {} of pod {}, image not pulled yet",
                    container.container_name, pod.identity
                );
                continue;
            }
            info!(
                "Checking pod {} container {} with image digest {}",
                pod.identity, container.container_name, container.digest
            );

            let credentials = resolve_credentials(cluster, &pod.identity.namespace).await;

            match version_checker
                .is_latest(desired_image, &container.digest, &credentials)
                .await
            {
                Ok(true) => {
                    debug!(
                        "Container {} of pod {} runs the latest image",
                        container.container_name, pod.identity
                    );
                }
                Ok(false) => {
                    info!(
                        "Pod {} is outdated, container {} does not run the latest {}",
                        pod.identity, container.container_name, desired_image
                    );
                    outdated_pods.push(pod.clone());
                    // One outdated container condemns the whole pod
                    break;
                }
                Err(e) if e.is_rate_limited() => {
                    warn!("Aborting outdated pod detection: {}", e);
                    return Err(UpdateError::RegistryRateLimited(e));
                }
                Err(e) => {
                    warn!(
                        "Could not check image of pod {} container {}, skipping it: {}",
                        pod.identity, container.container_name, e
                    );
                }
            }
        }
    }

    Ok(outdated_pods)
}

async fn resolve_credentials(cluster: &dyn ClusterClient, namespace: &str) -> RegistryCredentials {
    let payload = match cluster.get_secret(namespace, REGISTRY_PULL_SECRET).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to read registry pull secret: {:#}", e);
            None
        }
    };
    let credentials = RegistryCredentials::resolve(payload.as_deref());
    if credentials.is_anonymous() {
        debug!("Using anonymous registry access for namespace {}", namespace);
    }
    credentials
}
