use crate::crd::AgentDeployment;
use crate::state::ControllerContext;
use crate::update::{CycleOutcome, UpdateCoordinator, UpdateError};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::channel::mpsc;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub static CONTROLLER_NAME: &str = "kube-agent-updater";
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(30);

/// Runs one update cycle for an AgentDeployment and decides when to look at it again.
pub async fn reconcile(
    instance: Arc<AgentDeployment>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, UpdateError> {
    let coordinator = UpdateCoordinator {
        cluster: ctx.cluster.as_ref(),
        version_checker: ctx.version_checker.as_ref(),
        backoff: ctx.backoff.as_ref(),
        update_interval: ctx.config.update_interval(),
    };
    let now = Utc::now();

    match coordinator.run_update_cycle(&instance, now).await {
        Ok(CycleOutcome::Disabled) => Ok(Action::await_change()),
        Ok(CycleOutcome::NotDue { next_cycle_at }) => {
            Ok(Action::requeue(requeue_delay(now, next_cycle_at)))
        }
        Ok(CycleOutcome::BackingOff { retry_at }) => {
            Ok(Action::requeue(requeue_delay(now, retry_at)))
        }
        Ok(CycleOutcome::Completed { evicted }) => {
            for pod in &evicted {
                publish_event(
                    &ctx,
                    &instance,
                    EventType::Normal,
                    "EvictedOutdatedPod",
                    format!("Evicted pod {} running an outdated image", pod),
                )
                .await;
            }
            Ok(Action::requeue(ctx.config.update_interval()))
        }
        Err(e) => {
            publish_event(
                &ctx,
                &instance,
                EventType::Warning,
                "UpdateFailed",
                e.to_string(),
            )
            .await;
            Err(e)
        }
    }
}

pub fn error_policy(
    instance: Arc<AgentDeployment>,
    err: &UpdateError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    let delay = err.requeue_after().unwrap_or(ERROR_REQUEUE_DELAY);
    error!(
        "Update cycle of AgentDeployment {} failed, retrying in {}s: {}",
        instance.name_any(),
        delay.as_secs(),
        err
    );
    Action::requeue(delay)
}

fn requeue_delay(now: DateTime<Utc>, next_cycle_at: DateTime<Utc>) -> Duration {
    (next_cycle_at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_secs(1))
}

async fn publish_event(
    ctx: &ControllerContext,
    instance: &AgentDeployment,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.into(),
        note: Some(note),
        action: "UpdateCycle".into(),
        secondary: None,
    };
    if let Err(e) = ctx
        .recorder
        .publish(&event, &instance.object_ref(&()))
        .await
    {
        warn!(
            "Failed to publish {} event for AgentDeployment {}: {}",
            reason,
            instance.name_any(),
            e
        );
    }
}

/// Watches AgentDeployments in all namespaces until a shutdown signal arrives.
///
/// Every message on `recheck_trigger` re-runs all instances, which is how the cron schedule
/// reaches instances that saw no watch events.
pub async fn run(
    client: Client,
    ctx: ControllerContext,
    recheck_trigger: mpsc::Receiver<()>,
    ready: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let instances: Api<AgentDeployment> = Api::all(client);
    instances
        .list(&ListParams::default().limit(1))
        .await
        .with_context(|| {
            format!(
                "AgentDeployment CRD is not queryable. Install it with: {} crd | kubectl apply -f -",
                CONTROLLER_NAME
            )
        })?;

    info!("Watching AgentDeployments in all namespaces");
    ready.store(true, Ordering::Relaxed);

    Controller::new(instances, watcher::Config::default().any_semantic())
        .reconcile_all_on(recheck_trigger)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled AgentDeployment {}", object.name),
                Err(e) => warn!("Reconciliation error: {}", e),
            }
        })
        .await;

    ready.store(false, Ordering::Relaxed);
    info!("Controller stopped");
    Ok(())
}
