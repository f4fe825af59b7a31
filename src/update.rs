use crate::cluster::ClusterClient;
use crate::crd::{AgentDeployment, AgentDeploymentStatus};
use crate::detector::find_outdated_pods;
use crate::oci_registry::{RegistryError, VersionChecker};
use crate::state::PodIdentity;
use chrono::{DateTime, TimeDelta, Utc};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Delay before retrying a cycle whose outdated pod detection failed
pub const DETECTION_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("failed to list pods of AgentDeployment {instance}")]
    PodListFailed {
        instance: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("registry rate limit reached, update cycle aborted")]
    RegistryRateLimited(#[source] RegistryError),
    #[error("failed to evict outdated pod {pod}")]
    PodDeleteFailed {
        pod: PodIdentity,
        #[source]
        source: anyhow::Error,
    },
}

impl UpdateError {
    /// Delay the next attempt should wait for, `None` to retry on the default error cadence
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            UpdateError::PodListFailed { .. } | UpdateError::RegistryRateLimited(_) => {
                Some(DETECTION_RETRY_DELAY)
            }
            UpdateError::PodDeleteFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Updates are switched off for the instance
    Disabled,
    /// The previous cycle completed less than an update interval ago
    NotDue { next_cycle_at: DateTime<Utc> },
    /// A recent detection failure holds the instance off until `retry_at`
    BackingOff { retry_at: DateTime<Utc> },
    /// Outdated pods were evicted and the cycle was recorded
    Completed { evicted: Vec<PodIdentity> },
}

/// Earliest retry time per instance after a failed detection pass.
///
/// Kept outside the instance status so that watch events and scheduled re-checks arriving
/// during the delay cannot start another pass against a rate limited registry.
#[derive(Debug, Default)]
pub struct DetectionBackoff {
    retry_at: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DetectionBackoff {
    fn key(instance: &AgentDeployment) -> String {
        format!(
            "{}/{}",
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
    }

    /// Retry time of `instance` if it is still ahead of `now`
    pub fn active_until(
        &self,
        instance: &AgentDeployment,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        let until = retry_at.get(&Self::key(instance)).copied();
        until.filter(|until| now < *until)
    }

    fn hold_off(&self, instance: &AgentDeployment, until: DateTime<Utc>) {
        let mut retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        retry_at.insert(Self::key(instance), until);
    }

    fn clear(&self, instance: &AgentDeployment) {
        let mut retry_at = self.retry_at.lock().unwrap_or_else(PoisonError::into_inner);
        retry_at.remove(&Self::key(instance));
    }
}

/// Runs update cycles: gate, detect outdated pods, evict them, record completion.
pub struct UpdateCoordinator<'a> {
    pub cluster: &'a dyn ClusterClient,
    pub version_checker: &'a dyn VersionChecker,
    pub backoff: &'a DetectionBackoff,
    pub update_interval: Duration,
}

impl UpdateCoordinator<'_> {
    #[instrument(
        skip_all,
        fields(instance = %instance.name_any(), namespace = %instance.namespace().unwrap_or_default())
    )]
    pub async fn run_update_cycle(
        &self,
        instance: &AgentDeployment,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, UpdateError> {
        if instance.spec.disable_update {
            info!("Skipping pod updates because of configuration, disableUpdate is true");
            return Ok(CycleOutcome::Disabled);
        }
        if let Some(next_cycle_at) = self.next_cycle_at(instance) {
            if now < next_cycle_at {
                return Ok(CycleOutcome::NotDue { next_cycle_at });
            }
        }
        if let Some(retry_at) = self.backoff.active_until(instance, now) {
            info!("Skipping update cycle, backing off until {}", retry_at);
            return Ok(CycleOutcome::BackingOff { retry_at });
        }

        info!("Checking for outdated pods");
        let outdated_pods = match find_outdated_pods(self.cluster, self.version_checker, instance)
            .await
        {
            Ok(outdated_pods) => outdated_pods,
            Err(e) => {
                if let Some(delay) = e.requeue_after() {
                    let retry_at = TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    self.backoff.hold_off(instance, retry_at);
                }
                return Err(e);
            }
        };
        self.backoff.clear(instance);

        let mut evicted = Vec::with_capacity(outdated_pods.len());
        for pod in outdated_pods {
            info!("Evicting outdated pod {}", pod.identity);
            if let Err(source) = self.cluster.delete_pod(&pod.identity).await {
                error!("Failed to evict pod {}: {:#}", pod.identity, source);
                return Err(UpdateError::PodDeleteFailed {
                    pod: pod.identity,
                    source,
                });
            }
            evicted.push(pod.identity);
        }

        let status = AgentDeploymentStatus {
            updated_timestamp: Some(now),
        };
        if let Err(e) = self.cluster.update_status(instance, &status).await {
            // Only makes the next cycle run early
            warn!("Failed to update instance status: {:#}", e);
        }

        info!("Update cycle completed, evicted {} pods", evicted.len());
        Ok(CycleOutcome::Completed { evicted })
    }

    fn next_cycle_at(&self, instance: &AgentDeployment) -> Option<DateTime<Utc>> {
        let updated_timestamp = instance.updated_timestamp()?;
        let next = TimeDelta::from_std(self.update_interval)
            .ok()
            .and_then(|interval| updated_timestamp.checked_add_signed(interval));
        Some(next.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}
