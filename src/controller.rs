use crate::container::Container;
use crate::credentials::{RegistryResolver, get_registries};
use crate::gate::annotation_key;
use crate::rollout::update_deployment;
use crate::state::ControllerContext;
use anyhow::Context;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub checked: usize,
    pub updated: usize,
    pub up_to_date: usize,
    /// Containers a dry run would have updated
    pub would_update: usize,
    /// Containers whose version could not be decided
    pub skipped: usize,
    /// Containers whose rollout was attempted and failed
    pub failed: usize,
}

/// Expands every deployment carrying the autoupdate label into its containers,
/// each bound to the repository its image comes from.
///
/// A deployment whose pull secrets cannot be read is skipped as a whole; a
/// container without a matching registry or with a missing pre-update job
/// template is skipped on its own.
pub async fn discover(ctx: &ControllerContext) -> anyhow::Result<Vec<Container>> {
    let label_selector = &ctx.config.label_selector;
    let deployments = ctx
        .cluster
        .list_deployments(label_selector)
        .await
        .context("Can't get deployments")?;

    info!(
        "Scanning {} deployments with label {}",
        deployments.len(),
        label_selector
    );

    let mut containers = Vec::new();
    for deployment in deployments {
        let deployment_name = deployment.metadata.name.clone().unwrap_or_default();
        let registries =
            match get_registries(ctx.cluster.as_ref(), &deployment, &ctx.http_client, &ctx.config)
                .await
            {
                Ok(registries) => registries,
                Err(e) => {
                    error!(
                        "Skipping deployment {}, could not resolve its registries: {}",
                        deployment_name, e
                    );
                    continue;
                }
            };
        let resolver = RegistryResolver::new(&registries);

        let pod_containers = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|ps| ps.containers.clone())
            .unwrap_or_default();

        for pod_container in pod_containers {
            let image = pod_container.image.clone().unwrap_or_default();
            let repository = match resolver.resolve(&pod_container.name, &image) {
                Ok(repository) => repository,
                Err(e) => {
                    error!(
                        "Skipping container {} of deployment {}: {}",
                        pod_container.name, deployment_name, e
                    );
                    continue;
                }
            };

            let before_update = match before_update_job(ctx, &deployment, &pod_container.name).await {
                Ok(job) => job,
                Err(e) => {
                    error!(
                        "Skipping container {} of deployment {}: {:#}",
                        pod_container.name, deployment_name, e
                    );
                    continue;
                }
            };

            debug!(
                "Found container {} of deployment {} with image {} in repository {}",
                pod_container.name, deployment_name, image, repository.name
            );
            containers.push(Container::new(
                pod_container,
                deployment.clone(),
                repository,
                before_update,
            ));
        }
    }

    Ok(containers)
}

async fn before_update_job(
    ctx: &ControllerContext,
    deployment: &Deployment,
    container_name: &str,
) -> anyhow::Result<Option<Job>> {
    let Some(template_name) = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&annotation_key(container_name)))
    else {
        return Ok(None);
    };

    let job = ctx
        .cluster
        .get_job(template_name)
        .await
        .with_context(|| format!("Pre-update job {} is not available", template_name))?;
    Ok(Some(job))
}

/// One update pass: discover, decide and roll forward, one container at a time.
pub async fn run(ctx: &ControllerContext) -> anyhow::Result<RunSummary> {
    let Ok(_pass) = ctx.pass_lock.try_lock() else {
        warn!("Previous update pass is still running, skipping this one");
        return Ok(RunSummary::default());
    };

    let containers = discover(ctx).await?;
    if containers.is_empty() {
        warn!("No autoupdate deployments found");
    }

    let mut summary = RunSummary::default();
    for mut container in containers {
        summary.checked += 1;

        let version = match container.image_version() {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    "Could not get container image version for {}: {}",
                    container.name(),
                    e
                );
                summary.skipped += 1;
                continue;
            }
        };
        let new_version = match container.autoupdate_version().await {
            Ok(new_version) => new_version,
            Err(e) => {
                error!(
                    "Could not decide on an update for container {} of deployment {}: {}",
                    container.name(),
                    container.deployment_name(),
                    e
                );
                summary.skipped += 1;
                continue;
            }
        };

        let Some(new_version) = new_version else {
            debug!(
                "Nothing to update for {} container of {} deployment, current version {} is the latest",
                container.name(),
                container.deployment_name(),
                version
            );
            summary.up_to_date += 1;
            continue;
        };
        let msg = format!(
            "{} container of {} deployment from version {} to {}",
            container.name(),
            container.deployment_name(),
            version,
            new_version
        );

        if ctx.config.dry_run {
            info!("Dry run, not updating {}", msg);
            summary.would_update += 1;
            continue;
        }

        info!("Going to update {}", msg);
        match update_deployment(ctx, &mut container, &new_version).await {
            Ok(_) => {
                info!(
                    "Successfully updated deployment {} to image {}",
                    container.deployment_name(),
                    container.image()
                );
                summary.updated += 1;
            }
            Err(e) => {
                error!(
                    "Failed to update deployment {}: {}",
                    container.deployment_name(),
                    e
                );
                summary.failed += 1;
            }
        }
    }

    info!(
        "Update pass done: {} containers checked, {} updated, {} up to date, {} would update, {} skipped, {} failed",
        summary.checked,
        summary.updated,
        summary.up_to_date,
        summary.would_update,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}
