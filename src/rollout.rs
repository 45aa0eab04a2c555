use crate::container::Container;
use crate::error::Result;
use crate::gate::{GatePolicy, run_gate};
use crate::state::ControllerContext;
use crate::version::Version;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

static KUBE_AUTOUPDATE_UPDATED_AT_ANNOTATION: &str = "kube-autoupdate/updatedAt";
static KUBE_AUTOUPDATE_UPDATED_IMAGE_ANNOTATION: &str = "kube-autoupdate/updatedImage";

/// Rolls the container's deployment forward to `new_version`.
///
/// When the container has a pre-update job template, a gate job built from it
/// has to succeed first; otherwise nothing is persisted. The gate job and its
/// pods are removed whatever the outcome.
pub async fn update_deployment(
    ctx: &ControllerContext,
    container: &mut Container,
    new_version: &Version,
) -> Result<Deployment> {
    container.set_image_version(new_version)?;
    let new_image = container.image().to_string();

    if let Some(template) = &container.before_update {
        let policy = GatePolicy::from(&ctx.config.gate);
        run_gate(
            ctx.cluster.as_ref(),
            template,
            container.name(),
            &new_image,
            &policy,
            &ctx.cancel,
        )
        .await?;
    }

    stamp_annotations(&mut container.deployment, &new_image);
    debug!(
        "Persisting deployment {} with image {}",
        container.deployment_name(),
        new_image
    );
    let updated = ctx.cluster.replace_deployment(&container.deployment).await?;
    Ok(updated)
}

fn stamp_annotations(deployment: &mut Deployment, new_image: &str) {
    let annotations = deployment.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(
        KUBE_AUTOUPDATE_UPDATED_AT_ANNOTATION.to_string(),
        Utc::now().to_rfc3339(),
    );
    annotations.insert(
        KUBE_AUTOUPDATE_UPDATED_IMAGE_ANNOTATION.to_string(),
        new_image.to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{
        FakeCluster, FakeState, container, deployment, failed, job_template, running, succeeded,
    };
    use crate::config::Config;
    use crate::error::Error;
    use crate::registry::{Credentials, Registry};
    use crate::repository::Repository;
    use reqwest::Client;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    static WEB_IMAGE: &str = "registry.example.com/web:1.0.0";

    fn context(cluster: Arc<FakeCluster>) -> ControllerContext {
        ControllerContext::new(cluster, Config::default(), Client::new(), CancellationToken::new())
    }

    fn web_container(with_gate: bool) -> Container {
        let annotations: &[(&str, &str)] = if with_gate {
            &[("before_autoupdate_web", "migrate")]
        } else {
            &[]
        };
        let deployment = deployment(
            "shop",
            vec![container("web", WEB_IMAGE), container("worker", "registry.example.com/worker:2.0.0")],
            &[],
            annotations,
        );
        let registry = Registry::new("registry.example.com", Credentials::default(), Client::new());
        let template = with_gate.then(|| {
            job_template(
                "migrate",
                vec![container("migrate", WEB_IMAGE), container("check", "busybox:1.36.1")],
            )
        });
        Container::new(
            container("web", WEB_IMAGE),
            deployment,
            Repository::new(WEB_IMAGE, registry),
            template,
        )
    }

    fn persisted_images(deployment: &Deployment) -> Vec<String> {
        deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
            .iter()
            .map(|c| c.image.clone().unwrap())
            .collect()
    }

    fn v(tag: &str) -> Version {
        Version::parse_tag(tag).unwrap()
    }

    #[tokio::test]
    async fn test_update_without_gate() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = context(cluster.clone());
        let mut web = web_container(false);

        let updated = update_deployment(&ctx, &mut web, &v("v1.1.0")).await.unwrap();

        assert_eq!(
            persisted_images(&updated),
            vec!["registry.example.com/web:v1.1.0", "registry.example.com/worker:2.0.0"]
        );
        let annotations = updated.metadata.annotations.unwrap();
        assert_eq!(
            annotations[KUBE_AUTOUPDATE_UPDATED_IMAGE_ANNOTATION],
            "registry.example.com/web:v1.1.0"
        );
        assert!(annotations.contains_key(KUBE_AUTOUPDATE_UPDATED_AT_ANNOTATION));
        let state = cluster.state();
        assert_eq!(state.replaced.len(), 1);
        assert!(state.created_jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_with_successful_gate() {
        let cluster = Arc::new(FakeCluster::new(FakeState {
            job_statuses: [running(), succeeded()].into(),
            ..Default::default()
        }));
        let ctx = context(cluster.clone());
        let mut web = web_container(true);

        update_deployment(&ctx, &mut web, &v("1.1.0")).await.unwrap();

        let state = cluster.state();
        assert_eq!(state.job_polls, 2);
        let gate_images: Vec<_> = state.created_jobs[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
            .iter()
            .map(|c| c.image.clone().unwrap())
            .collect();
        assert_eq!(gate_images, vec!["registry.example.com/web:1.1.0", "busybox:1.36.1"]);
        assert_eq!(state.replaced.len(), 1);
        assert_eq!(
            persisted_images(&state.replaced[0]),
            vec!["registry.example.com/web:1.1.0", "registry.example.com/worker:2.0.0"]
        );
        assert_eq!(state.deleted_jobs, vec!["web-migrate-x7k2p"]);
        assert_eq!(state.deleted_pods, vec!["web-migrate-x7k2p-pod"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_with_failed_gate_is_not_persisted() {
        let cluster = Arc::new(FakeCluster::new(FakeState {
            job_statuses: [failed()].into(),
            ..Default::default()
        }));
        let ctx = context(cluster.clone());
        let mut web = web_container(true);

        let err = update_deployment(&ctx, &mut web, &v("1.1.0")).await.unwrap_err();

        assert!(matches!(err, Error::GateFailed { .. }));
        let state = cluster.state();
        assert!(state.replaced.is_empty());
        assert_eq!(state.deleted_jobs, vec!["web-migrate-x7k2p"]);
        assert_eq!(state.deleted_pods, vec!["web-migrate-x7k2p-pod"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_conflict_is_surfaced_after_cleanup() {
        let cluster = Arc::new(FakeCluster::new(FakeState {
            job_statuses: [succeeded()].into(),
            fail_replace: true,
            ..Default::default()
        }));
        let ctx = context(cluster.clone());
        let mut web = web_container(true);

        let err = update_deployment(&ctx, &mut web, &v("1.1.0")).await.unwrap_err();

        assert!(matches!(err, Error::Cluster(_)));
        let state = cluster.state();
        assert_eq!(state.deleted_jobs.len(), 1);
        assert_eq!(state.deleted_pods.len(), 1);
    }
}
