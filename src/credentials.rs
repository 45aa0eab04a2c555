use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{Credentials, DEFAULT_REGISTRY, Registry, RegistryList};
use crate::repository::Repository;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

static DOCKERCFG_KEY: &str = ".dockercfg";
static DOCKERCONFIGJSON_KEY: &str = ".dockerconfigjson";

#[derive(Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, Credentials>,
}

/// Reads the per-registry credentials out of an image pull secret.
pub fn parse_pull_secret(secret: &Secret) -> Result<BTreeMap<String, Credentials>> {
    let secret_name = secret.metadata.name.clone().unwrap_or_default();
    let invalid = |reason: String| Error::InvalidPullSecret {
        secret: secret_name.clone(),
        reason,
    };
    let data = secret.data.as_ref();

    let entries = if let Some(payload) = data.and_then(|d| d.get(DOCKERCFG_KEY)) {
        serde_json::from_slice::<BTreeMap<String, Credentials>>(&payload.0)
            .map_err(|e| invalid(format!("{} is not valid JSON: {}", DOCKERCFG_KEY, e)))?
    } else if let Some(payload) = data.and_then(|d| d.get(DOCKERCONFIGJSON_KEY)) {
        serde_json::from_slice::<DockerConfigJson>(&payload.0)
            .map_err(|e| invalid(format!("{} is not valid JSON: {}", DOCKERCONFIGJSON_KEY, e)))?
            .auths
    } else {
        return Err(invalid(format!(
            "neither {} nor {} is present",
            DOCKERCFG_KEY, DOCKERCONFIGJSON_KEY
        )));
    };

    entries
        .into_iter()
        .map(|(name, credentials)| -> Result<(String, Credentials)> {
            let credentials = credentials
                .resolve_auth()
                .map_err(|reason| invalid(format!("entry {}: {}", name, reason)))?;
            Ok((name, credentials))
        })
        .collect()
}

/// Builds one registry per entry of every image pull secret of the deployment.
pub async fn get_registries(
    cluster: &dyn ClusterApi,
    deployment: &Deployment,
    http_client: &Client,
    config: &Config,
) -> Result<RegistryList> {
    let secret_names = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|ps| ps.image_pull_secrets.as_ref())
        .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut registries = RegistryList::default();
    for secret_name in secret_names {
        let secret = cluster.get_secret(&secret_name).await?;
        for (name, credentials) in parse_pull_secret(&secret)? {
            debug!(
                "Using pull secret {} for registry {} (user {}, email {})",
                secret_name,
                name,
                credentials.username.as_deref().unwrap_or("<none>"),
                credentials.email.as_deref().unwrap_or("<none>")
            );
            let insecure = config.is_insecure_registry(&name);
            registries
                .items
                .push(Registry::new(name, credentials, http_client.clone()).with_insecure(insecure));
        }
    }
    Ok(registries)
}

/// Picks the registry serving an image: the first registry whose name prefixes
/// the image, else the `default` registry.
pub struct RegistryResolver {
    rules: Vec<(Box<dyn Fn(&str) -> bool + Send + Sync>, Registry)>,
    default: Option<Registry>,
}

impl RegistryResolver {
    pub fn new(registries: &RegistryList) -> Self {
        let rules = registries
            .items
            .iter()
            .filter(|r| r.name != DEFAULT_REGISTRY)
            .map(|registry| {
                let prefix = format!("{}/", registry.name);
                let predicate: Box<dyn Fn(&str) -> bool + Send + Sync> =
                    Box::new(move |image: &str| image.starts_with(&prefix));
                (predicate, registry.clone())
            })
            .collect();
        let default = registries.get(DEFAULT_REGISTRY).ok().cloned();
        Self { rules, default }
    }

    pub fn resolve(&self, container_name: &str, image: &str) -> Result<Repository> {
        self.rules
            .iter()
            .find(|(matches, _)| matches(image))
            .map(|(_, registry)| registry)
            .or(self.default.as_ref())
            .map(|registry| Repository::new(image, registry.clone()))
            .ok_or_else(|| Error::NoRegistry {
                container: container_name.to_string(),
                image: image.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{FakeCluster, FakeState, container, deployment, dockercfg_secret};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use k8s_openapi::ByteString;
    use serde_json::json;

    fn registry(name: &str) -> Registry {
        Registry::new(name, Credentials::default(), Client::new())
    }

    #[test]
    fn test_parse_dockercfg() {
        let secret = dockercfg_secret(
            "private",
            json!({
                "registry.example.com": {
                    "username": "robot",
                    "password": "s3cret",
                    "email": "ops@example.com",
                    "auth": STANDARD.encode("robot:s3cret")
                },
                "default": {
                    "auth": STANDARD.encode("hub:token")
                }
            }),
        );

        let entries = parse_pull_secret(&secret).unwrap();
        assert_eq!(entries.len(), 2);
        let private = &entries["registry.example.com"];
        assert_eq!(private.username.as_deref(), Some("robot"));
        assert_eq!(private.email.as_deref(), Some("ops@example.com"));
        let hub = &entries["default"];
        assert_eq!(hub.username.as_deref(), Some("hub"));
        assert_eq!(hub.password.as_ref().unwrap().expose_secret(), "token");
    }

    #[test]
    fn test_parse_dockerconfigjson() {
        let payload = json!({"auths": {"ghcr.io": {"username": "bot", "password": "pat"}}});
        let secret = Secret {
            data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                ByteString(serde_json::to_vec(&payload).unwrap()),
            )])),
            ..Default::default()
        };
        let entries = parse_pull_secret(&secret).unwrap();
        assert_eq!(entries["ghcr.io"].username.as_deref(), Some("bot"));
    }

    #[test]
    fn test_parse_malformed_secret() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                ".dockercfg".to_string(),
                ByteString(b"{not json".to_vec()),
            )])),
            ..Default::default()
        };
        assert!(matches!(
            parse_pull_secret(&secret),
            Err(Error::InvalidPullSecret { .. })
        ));
        assert!(parse_pull_secret(&Secret::default()).is_err());
    }

    #[tokio::test]
    async fn test_get_registries() {
        let cluster = FakeCluster::new(FakeState {
            secrets: BTreeMap::from([
                (
                    "private".to_string(),
                    dockercfg_secret("private", json!({"registry.example.com": {"username": "u", "password": "p"}})),
                ),
                (
                    "hub".to_string(),
                    dockercfg_secret("hub", json!({"default": {}})),
                ),
            ]),
            ..Default::default()
        });
        let web = deployment(
            "web",
            vec![container("web", "registry.example.com/web:1.0.0")],
            &["private", "hub"],
            &[],
        );
        let config = Config {
            insecure_registries: vec!["registry.example.com".to_string()],
            ..Default::default()
        };

        let registries = get_registries(&cluster, &web, &Client::new(), &config)
            .await
            .unwrap();
        assert_eq!(registries.items.len(), 2);
        assert_eq!(registries.get("registry.example.com").unwrap().host(), "registry.example.com");
        assert_eq!(registries.get("default").unwrap().host(), "index.docker.io");
    }

    #[tokio::test]
    async fn test_get_registries_missing_secret() {
        let cluster = FakeCluster::default();
        let web = deployment("web", vec![container("web", "web:1.0.0")], &["gone"], &[]);
        let result = get_registries(&cluster, &web, &Client::new(), &Config::default()).await;
        assert!(matches!(result, Err(Error::Cluster(_))));
    }

    #[test]
    fn test_resolver_prefers_explicit_prefix() {
        let list = RegistryList {
            items: vec![registry("default"), registry("registry.example.com")],
        };
        let resolver = RegistryResolver::new(&list);

        let repository = resolver
            .resolve("web", "registry.example.com/team/web:1.2.3")
            .unwrap();
        assert_eq!(repository.registry.name, "registry.example.com");
        assert_eq!(repository.name, "team/web");

        let repository = resolver.resolve("db", "postgres:16.1.0").unwrap();
        assert_eq!(repository.registry.name, "default");
        assert_eq!(repository.name, "postgres");
    }

    #[test]
    fn test_resolver_without_match_or_default() {
        let list = RegistryList {
            items: vec![registry("registry.example.com")],
        };
        let resolver = RegistryResolver::new(&list);
        let err = resolver.resolve("web", "ghcr.io/team/web:1.2.3").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no registry matches image ghcr.io/team/web:1.2.3 of container web"
        );
    }
}
