use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A container image tag together with its semantic version.
///
/// Comparison only looks at semantic version precedence, so `v1.2.3` and
/// `1.2.3+build.7` are equal. `tag` keeps the registry's spelling so it can be
/// written back into an image reference unchanged.
#[derive(Debug, Clone)]
pub struct Version {
    pub tag: String,
    pub semver: semver::Version,
}

impl Version {
    /// Tolerant parse: accepts a single leading `v`, otherwise strict `MAJOR.MINOR.PATCH[-pre][+build]`.
    pub fn parse_tag(tag: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidVersion {
            tag: tag.to_string(),
            reason: reason.to_string(),
        };

        let stripped = tag.strip_prefix('v').unwrap_or(tag);
        if stripped.starts_with('.') {
            return Err(invalid("a `v` prefix must be followed by the major version"));
        }

        let semver = semver::Version::parse(stripped).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            tag: tag.to_string(),
            semver,
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.semver.cmp_precedence(&other.semver)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag)
    }
}

/// Splits an image reference into the part before the tag and the tag itself.
///
/// The tag separator is the last `:` after the last `/`, so a registry port
/// (`host:5000/app`) is never taken for a tag.
fn split_tag(image: &str) -> (&str, Option<&str>) {
    match image.rfind(':') {
        Some(pos) if pos > image.rfind('/').unwrap_or(0) => (&image[..pos], Some(&image[pos + 1..])),
        _ => (image, None),
    }
}

pub fn image_without_tag(image: &str) -> &str {
    split_tag(image).0
}

pub fn parse_version(image: &str) -> Result<Version> {
    // digest references are not versions
    if image.contains('@') {
        return Err(Error::InvalidImageName(image.to_string()));
    }

    match split_tag(image) {
        (_, Some(tag)) if !tag.is_empty() => Version::parse_tag(tag),
        _ => Err(Error::InvalidImageName(image.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_keeps_tag_verbatim() {
        for tag in ["1.2.3", "v1.2.3", "1.2.3-rc.1", "v2.0.0+build.5", "10.20.30-alpha+exp.sha.5114f85"] {
            let image = format!("registry.example.com/my-image:{}", tag);
            let version = parse_version(&image).expect("tag should parse");
            assert_eq!(version.tag, tag);
        }
    }

    #[test]
    fn test_parse_version_components() {
        let version = parse_version("registry.example.com/my-image:v1.2.3").unwrap();
        assert_eq!(version.semver.major, 1);
        assert_eq!(version.semver.minor, 2);
        assert_eq!(version.semver.patch, 3);
    }

    #[test]
    fn test_parse_version_rejects_non_versions() {
        assert!(parse_version("repo:latest").is_err());
        assert!(parse_version("repo").is_err());
        assert!(parse_version("repo:v.3.4.5").is_err());
        assert!(parse_version("repo:1.2").is_err());
        assert!(parse_version("repo:").is_err());
    }

    #[test]
    fn test_parse_version_missing_tag_message() {
        let err = parse_version("registry.example.com/my-image").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid image name, could not extract version: registry.example.com/my-image"
        );
    }

    #[test]
    fn test_parse_version_ignores_registry_port() {
        assert!(parse_version("localhost:5000/my-image").is_err());
        let version = parse_version("localhost:5000/my-image:3.1.4").unwrap();
        assert_eq!(version.tag, "3.1.4");
    }

    #[test]
    fn test_parse_version_rejects_digest() {
        assert!(parse_version("my-image@sha256:0123456789abcdef").is_err());
    }

    #[test]
    fn test_ordering_uses_precedence() {
        let v = |tag: &str| Version::parse_tag(tag).unwrap();
        assert!(v("1.2.4") > v("1.2.3"));
        assert!(v("1.2.3") > v("1.2.3-rc.1"));
        assert!(v("2.0.0") > v("v1.99.99"));
        assert_eq!(v("v1.2.3"), v("1.2.3"));
        assert_eq!(v("1.2.3+build.1"), v("1.2.3+build.2"));
    }

    #[test]
    fn test_image_without_tag() {
        assert_eq!(image_without_tag("my-image:1.2.3"), "my-image");
        assert_eq!(image_without_tag("host:5000/team/app:v1.0.0"), "host:5000/team/app");
        assert_eq!(image_without_tag("host:5000/team/app"), "host:5000/team/app");
    }
}
