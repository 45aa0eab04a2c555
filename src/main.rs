use crate::cluster::KubeCluster;
use crate::state::ControllerContext;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cluster;
mod config;
mod container;
mod controller;
mod credentials;
mod error;
mod gate;
mod registry;
mod repository;
mod rollout;
mod secret_string;
mod state;
mod version;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_path) = config::load_from_env()?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level_filter()?)
        .init();
    info!("Starting kube-autoupdate {}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Loaded config from file {}", path.display()),
        None => info!("CONFIG_PATH is not set, using default configuration"),
    }
    if config.dry_run {
        info!("Dry run enabled, deployments will not be updated");
    }

    let client = cluster::create_client(config.host.as_deref()).await?;
    let cluster = KubeCluster::new(client, config.namespace.clone());
    info!("Watching namespace {}", cluster.namespace());
    let http_client = registry::create_client(&config)?;

    let cancel = CancellationToken::new();
    let ctx = ControllerContext::new(Arc::new(cluster), config, http_client, cancel.clone());

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                cancel.cancel();
            }
        }
    });

    let Some(schedule) = ctx.config.schedule.clone() else {
        controller::run(&ctx).await?;
        return Ok(());
    };

    info!("Executing update pass at cron schedule {}", schedule);
    let mut scheduler = JobScheduler::new().await?;
    let job_ctx = ctx.clone();
    let job = Job::new_async(schedule.clone(), move |_uuid, _l| {
        let ctx = job_ctx.clone();
        Box::pin(async move {
            if let Err(e) = controller::run(&ctx).await {
                error!("Error running update pass: {:?}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let app = webserver::create_app();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
