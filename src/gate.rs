//! Pre-update gate: a copy of a user supplied job template, run against the
//! new image, that has to succeed before a deployment is rolled forward.

use crate::cluster::ClusterApi;
use crate::config;
use crate::error::{Error, Result};
use crate::version::image_without_tag;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deployment annotation prefix; the full key is `before_autoupdate_{container name}`
/// and its value names the job template.
pub static BEFORE_AUTOUPDATE_ANNOTATION_PREFIX: &str = "before_autoupdate_";
static GATE_LABEL: &str = "kube-autoupdate/gate-for";
static CONTROLLER_UID_LABEL: &str = "controller-uid";

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Succeeded,
    Failed,
    TimedOut(Duration),
    PollError(String),
    Cancelled,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateOutcome::Succeeded => write!(f, "succeeded"),
            GateOutcome::Failed => write!(f, "job failed"),
            GateOutcome::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            GateOutcome::PollError(e) => write!(f, "could not poll job status: {}", e),
            GateOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub backoff_factor: f64,
    pub timeout: Duration,
}

impl GatePolicy {
    /// Grows `interval` by the backoff factor, never past the cap. Factors that
    /// overflow a `Duration` land on the cap.
    fn next_interval(&self, interval: Duration) -> Duration {
        let cap = self.max_poll_interval.max(self.poll_interval);
        Duration::try_from_secs_f64(interval.as_secs_f64() * self.backoff_factor.max(1.0))
            .unwrap_or(cap)
            .min(cap)
    }
}

impl From<&config::Gate> for GatePolicy {
    fn from(gate: &config::Gate) -> Self {
        Self {
            poll_interval: gate.poll_interval(),
            max_poll_interval: gate.max_poll_interval(),
            backoff_factor: gate.backoff_factor,
            timeout: gate.timeout(),
        }
    }
}

pub fn annotation_key(container_name: &str) -> String {
    format!("{}{}", BEFORE_AUTOUPDATE_ANNOTATION_PREFIX, container_name)
}

fn retarget(containers: &mut [Container], target_image_without_tag: &str, new_image: &str) {
    containers
        .iter_mut()
        .filter(|c| {
            c.image
                .as_deref()
                .is_some_and(|image| image_without_tag(image) == target_image_without_tag)
        })
        .for_each(|c| c.image = Some(new_image.to_string()));
}

/// Copies the template's pod spec into a fresh job and points every container
/// running the target image at `new_image`.
pub fn build_gate_job(
    template: &Job,
    container_name: &str,
    target_image_without_tag: &str,
    new_image: &str,
) -> Result<Job> {
    let template_name = template.metadata.name.clone().unwrap_or_default();
    let template_spec = template
        .spec
        .as_ref()
        .ok_or_else(|| Error::InvalidGateTemplate(template_name.clone()))?;
    let mut pod_spec = template_spec
        .template
        .spec
        .clone()
        .ok_or_else(|| Error::InvalidGateTemplate(template_name.clone()))?;

    retarget(&mut pod_spec.containers, target_image_without_tag, new_image);
    if let Some(init_containers) = pod_spec.init_containers.as_mut() {
        retarget(init_containers, target_image_without_tag, new_image);
    }

    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-{}-", container_name, template_name)),
            labels: Some(BTreeMap::from([(
                GATE_LABEL.to_string(),
                container_name.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: template_spec.backoff_limit,
            active_deadline_seconds: template_spec.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Polls the job until it succeeds, fails, the policy's timeout elapses or
/// `cancel` fires. A job reporting both failed and succeeded pods counts as failed.
pub async fn wait_for_job(
    cluster: &dyn ClusterApi,
    job_name: &str,
    policy: &GatePolicy,
    cancel: &CancellationToken,
) -> GateOutcome {
    // a timeout too large for the clock means no deadline
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut interval = policy.poll_interval;

    loop {
        let nap = match deadline {
            Some(deadline) => interval.min(deadline.saturating_duration_since(Instant::now())),
            None => interval,
        };
        tokio::select! {
            _ = cancel.cancelled() => return GateOutcome::Cancelled,
            _ = sleep(nap) => {}
        }

        match cluster.get_job(job_name).await {
            Ok(job) => {
                let status = job.status.unwrap_or_default();
                if status.failed.unwrap_or(0) > 0 {
                    return GateOutcome::Failed;
                }
                if status.succeeded.unwrap_or(0) > 0 {
                    return GateOutcome::Succeeded;
                }
                debug!(
                    "Job {} still running ({} active pods)",
                    job_name,
                    status.active.unwrap_or(0)
                );
            }
            Err(e) => return GateOutcome::PollError(format!("{:#}", e)),
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return GateOutcome::TimedOut(policy.timeout);
        }
        interval = policy.next_interval(interval);
    }
}

/// Deletes the job's pods and then the job. Failures are only logged.
pub async fn cleanup(cluster: &dyn ClusterApi, job: &Job) {
    let job_name = job.metadata.name.as_deref().unwrap_or_default();

    match job.metadata.uid.as_deref() {
        Some(uid) => {
            let selector = format!("{}={}", CONTROLLER_UID_LABEL, uid);
            match cluster.list_pods(&selector).await {
                Ok(pods) => {
                    for pod_name in pods.into_iter().filter_map(|p| p.metadata.name) {
                        if let Err(e) = cluster.delete_pod(&pod_name).await {
                            warn!("Could not delete pod {} of job {}: {:#}", pod_name, job_name, e);
                        }
                    }
                }
                Err(e) => warn!("Could not list pods of job {}: {:#}", job_name, e),
            }
        }
        None => warn!("Job {} has no uid, skipping deletion of its pods", job_name),
    }

    if let Err(e) = cluster.delete_job(job_name).await {
        warn!("Could not delete job {}: {:#}", job_name, e);
    }
}

/// Creates the gate job for `container_name`, waits for it and always cleans it up.
pub async fn run_gate(
    cluster: &dyn ClusterApi,
    template: &Job,
    container_name: &str,
    new_image: &str,
    policy: &GatePolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let gate_job = build_gate_job(template, container_name, image_without_tag(new_image), new_image)?;
    let created = cluster.create_job(&gate_job).await?;
    let job_name = created.metadata.name.clone().unwrap_or_default();
    info!(
        "Created pre-update job {} for container {} with image {}",
        job_name, container_name, new_image
    );

    let outcome = wait_for_job(cluster, &job_name, policy, cancel).await;
    cleanup(cluster, &created).await;

    match outcome {
        GateOutcome::Succeeded => {
            info!("Pre-update job {} succeeded", job_name);
            Ok(())
        }
        outcome => Err(Error::GateFailed {
            job: job_name,
            container: container_name.to_string(),
            outcome,
        }),
    }
}
