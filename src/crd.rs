use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label every pod of an agent deployment carries, with the deployment's name as value.
pub static INSTANCE_LABEL: &str = "agents.kube-updater.io/instance";

/// A fleet of agent pods whose images are kept up to date with the registry
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "AgentDeployment",
    group = "agents.kube-updater.io",
    version = "v1alpha1",
    namespaced,
    shortname = "agd",
    derive = "Default"
)]
#[kube(status = "AgentDeploymentStatus")]
#[serde(rename_all = "camelCase")]
pub struct AgentDeploymentSpec {
    /// The image the agent pods should run, e.g. `registry.example.com/agents/collector:1.4`
    pub image: Option<String>,
    /// Stop evicting outdated agent pods
    #[serde(default)]
    pub disable_update: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeploymentStatus {
    /// When the last update cycle completed
    pub updated_timestamp: Option<DateTime<Utc>>,
}

impl AgentDeployment {
    /// The desired image, if one is set and not blank
    pub fn desired_image(&self) -> Option<&str> {
        self.spec
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
    }

    pub fn updated_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.updated_timestamp)
    }

    pub fn pod_selector(&self) -> String {
        format!(
            "{}={}",
            INSTANCE_LABEL,
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}
