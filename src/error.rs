use crate::gate::GateOutcome;
use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid image name, could not extract version: {0}")]
    InvalidImageName(String),

    #[error("tag {tag} is not a semantic version: {reason}")]
    InvalidVersion { tag: String, reason: String },

    #[error("registry {0} not found")]
    RegistryNotFound(String),

    #[error("no registry matches image {image} of container {container}")]
    NoRegistry { container: String, image: String },

    #[error("request to registry {host} failed: {source}")]
    RegistryRequest {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("registry {host} returned status {status} while listing tags of repository {repository}")]
    RegistryStatus {
        host: String,
        repository: String,
        status: StatusCode,
    },

    #[error("no image tags for {0}")]
    NoTags(String),

    #[error("no version tags for {0}")]
    NoVersionTags(String),

    #[error("image pull secret {secret} is invalid: {reason}")]
    InvalidPullSecret { secret: String, reason: String },

    #[error("pre-update job template {0} has no pod spec")]
    InvalidGateTemplate(String),

    #[error("pre-update job {job} for container {container} did not succeed: {outcome}")]
    GateFailed {
        job: String,
        container: String,
        outcome: GateOutcome,
    },

    #[error("container {container} not found in deployment {deployment}")]
    ContainerNotFound {
        container: String,
        deployment: String,
    },

    #[error(transparent)]
    Cluster(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
