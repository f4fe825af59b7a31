use crate::cluster::KubeClusterClient;
use crate::config::DEFAULT_CONFIG_PATH;
use crate::controller::CONTROLLER_NAME;
use crate::crd::AgentDeployment;
use crate::oci_registry::OciVersionChecker;
use crate::state::ControllerContext;
use crate::update::DetectionBackoff;
use kube::CustomResourceExt;
use kube::runtime::events::{Recorder, Reporter};
use std::env;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod cluster;
mod config;
mod controller;
mod crd;
mod credentials;
mod detector;
mod image_reference;
mod oci_registry;
mod secret_string;
mod state;
mod update;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml_ng::to_string(&AgentDeployment::crd())?);
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    info!("Starting {} {}", CONTROLLER_NAME, env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let client = cluster::create_client().await?;
    let http_client = oci_registry::create_client(&config)?;
    let reporter = Reporter {
        controller: CONTROLLER_NAME.into(),
        instance: env::var("CONTROLLER_POD_NAME").ok(),
    };
    let ctx = ControllerContext {
        config: config.clone(),
        cluster: Arc::new(KubeClusterClient::new(client.clone())),
        version_checker: Arc::new(OciVersionChecker::new(
            http_client,
            &config.insecure_registries,
        )),
        backoff: Arc::new(DetectionBackoff::default()),
        recorder: Recorder::new(client.clone(), reporter),
    };

    let (recheck_tx, recheck_rx) = futures::channel::mpsc::channel::<()>(1);
    info!(
        "Re-checking all AgentDeployments at cron schedule {}",
        config.cron_schedule
    );
    let mut scheduler = JobScheduler::new().await?;
    let job = Job::new_async(config.cron_schedule.clone(), move |_uuid, _l| {
        let mut recheck_tx = recheck_tx.clone();
        Box::pin(async move {
            // A full channel means a re-check is already pending
            if let Err(e) = recheck_tx.try_send(()) {
                debug!("Skipping scheduled re-check: {}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let ready = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();
    let app = webserver::create_app(ready.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    let result = controller::run(client, ctx, recheck_rx, ready).await;

    shutdown.cancel();
    scheduler.shutdown().await?;
    server.await??;
    result
}
