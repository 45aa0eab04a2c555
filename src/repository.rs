use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::version::{Version, image_without_tag};
use tracing::debug;

/// An image path inside a registry, without registry prefix and tag.
#[derive(Debug, Clone)]
pub struct Repository {
    pub name: String,
    pub registry: Registry,
}

impl Repository {
    /// Builds the repository of `image`, dropping the tag and a leading
    /// `{registry.name}/` so that both explicit and implicit registries work.
    pub fn new(image: &str, registry: Registry) -> Self {
        let path = image_without_tag(image);
        let prefix = format!("{}/", registry.name);
        let name = path.strip_prefix(&prefix).unwrap_or(path).to_string();
        Self { name, registry }
    }

    /// Highest semantic version among the repository's tags.
    ///
    /// Tags that are not semantic versions (`latest`, `dev`, ...) are skipped.
    /// When several tags share the same precedence the first one listed wins.
    pub async fn latest_version(&self) -> Result<Version> {
        let tags = self.registry.get_tags(&self.name).await?;
        if tags.is_empty() {
            return Err(Error::NoTags(self.name.clone()));
        }
        highest_version(&tags).ok_or_else(|| Error::NoVersionTags(self.name.clone()))
    }
}

fn highest_version(tags: &[String]) -> Option<Version> {
    tags.iter()
        .filter_map(|tag| match Version::parse_tag(tag) {
            Ok(version) => Some(version),
            Err(e) => {
                debug!("Skipping tag {}: {}", tag, e);
                None
            }
        })
        .fold(None, |latest: Option<Version>, version| match latest {
            Some(latest) if version <= latest => Some(latest),
            _ => Some(version),
        })
}
