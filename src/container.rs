use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::version::{Version, image_without_tag, parse_version};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1;

/// One container of an autoupdate deployment, bound to the repository its
/// image is pulled from.
#[derive(Debug, Clone)]
pub struct Container {
    pub(crate) container: v1::Container,
    pub(crate) deployment: Deployment,
    pub(crate) repository: Repository,
    /// Job template that has to succeed against the new image before the rollout
    pub(crate) before_update: Option<Job>,
}

impl Container {
    pub fn new(
        container: v1::Container,
        deployment: Deployment,
        repository: Repository,
        before_update: Option<Job>,
    ) -> Self {
        Self {
            container,
            deployment,
            repository,
            before_update,
        }
    }

    pub fn name(&self) -> &str {
        &self.container.name
    }

    pub fn deployment_name(&self) -> &str {
        self.deployment.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn image(&self) -> &str {
        self.container.image.as_deref().unwrap_or_default()
    }

    pub fn image_version(&self) -> Result<Version> {
        parse_version(self.image())
    }

    pub async fn latest_version(&self) -> Result<Version> {
        self.repository.latest_version().await
    }

    /// The version to roll out, if the registry holds one strictly newer than
    /// the running image.
    pub async fn autoupdate_version(&self) -> Result<Option<Version>> {
        let current = self.image_version()?;
        let latest = self.latest_version().await?;
        Ok(decide(&current, latest))
    }

    /// Points the container, and its twin in the deployment's pod template,
    /// at `{image without tag}:{version.tag}`.
    pub fn set_image_version(&mut self, version: &Version) -> Result<&Deployment> {
        let image = format!("{}:{}", image_without_tag(self.image()), version.tag);

        let deployment_name = self.deployment_name().to_string();
        let target = self
            .deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|ps| ps.containers.iter_mut().find(|c| c.name == self.container.name))
            .ok_or_else(|| Error::ContainerNotFound {
                container: self.container.name.clone(),
                deployment: deployment_name,
            })?;

        target.image = Some(image.clone());
        self.container.image = Some(image);
        Ok(&self.deployment)
    }
}

pub fn decide(current: &Version, latest: Version) -> Option<Version> {
    (latest > *current).then_some(latest)
}
