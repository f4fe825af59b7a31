use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::image_reference::digest_from_image_id;
use crate::oci_registry::VersionChecker;
use crate::update::DetectionBackoff;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::Recorder;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) config: Config,
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) version_checker: Arc<dyn VersionChecker>,
    pub(crate) backoff: Arc<DetectionBackoff>,
    pub(crate) recorder: Recorder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Digest a container is running, empty while its image has not been pulled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDigest {
    pub container_name: String,
    pub digest: String,
}

/// A pod of an agent deployment as observed at the start of an update cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub identity: PodIdentity,
    pub containers: Vec<ContainerDigest>,
}

impl From<&Pod> for PodSnapshot {
    fn from(pod: &Pod) -> Self {
        let containers = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|status| ContainerDigest {
                        container_name: status.name.clone(),
                        digest: digest_from_image_id(&status.image_id),
                    })
                    .collect()
            })
            .unwrap_or_default();

        PodSnapshot {
            identity: PodIdentity {
                name: pod.metadata.name.clone().unwrap_or_default(),
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            },
            containers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_pod_snapshot_from_pod() {
        let digest = "sha256:abcdef0123456789";
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("collector-0".to_string()),
                namespace: Some("agents".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![
                    ContainerStatus {
                        name: "agent".to_string(),
                        image_id: format!("docker-pullable://quay.io/agents/collector@{}", digest),
                        ..Default::default()
                    },
                    ContainerStatus {
                        name: "sidecar".to_string(),
                        image_id: String::new(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = PodSnapshot::from(&pod);

        assert_eq!(snapshot.identity.to_string(), "agents/collector-0");
        assert_eq!(
            snapshot.containers,
            vec![
                ContainerDigest {
                    container_name: "agent".to_string(),
                    digest: digest.to_string(),
                },
                ContainerDigest {
                    container_name: "sidecar".to_string(),
                    digest: String::new(),
                },
            ]
        );
    }

    #[test]
    fn test_pod_snapshot_without_status_has_no_containers() {
        let snapshot = PodSnapshot::from(&Pod::default());
        assert!(snapshot.containers.is_empty());
    }
}
