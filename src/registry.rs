use crate::config::Config;
use crate::error::{Error, Result};
use crate::secret_string::SecretString;
use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::LINK;
use reqwest::{Certificate, Client, Response};
use serde::Deserialize;
use std::fs;
use tracing::{debug, info, warn};

pub static DEFAULT_REGISTRY: &str = "default";
static DEFAULT_REGISTRY_HOST: &str = "index.docker.io";
const MAX_TAG_PAGES: usize = 50;

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing container registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// One registry entry of a `.dockercfg` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub auth: Option<SecretString>,
}

impl Credentials {
    /// Fills username and password from the base64 `user:password` auth field
    /// when they are not set explicitly, as `docker login` writes them.
    pub fn resolve_auth(mut self) -> std::result::Result<Self, String> {
        if self.username().is_some() {
            return Ok(self);
        }
        let Some(auth) = self.auth.as_ref().filter(|a| !a.is_empty()) else {
            return Ok(self);
        };

        let decoded = STANDARD
            .decode(auth.expose_secret())
            .map_err(|e| format!("auth field is not valid base64: {}", e))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| "auth field is not valid UTF-8".to_string())?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| "auth field is not of the form user:password".to_string())?;

        self.username = Some(username.to_string());
        self.password = Some(SecretString::new(password));
        Ok(self)
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    fn password(&self) -> Option<&str> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret())
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    name: String,
    tags: Option<Vec<String>>,
}

/// A container registry bound to its credentials and an HTTP client.
#[derive(Debug, Clone)]
pub struct Registry {
    pub name: String,
    credentials: Credentials,
    client: Client,
    insecure: bool,
}

impl Registry {
    pub fn new(name: impl Into<String>, credentials: Credentials, client: Client) -> Self {
        Self {
            name: name.into(),
            credentials,
            client,
            insecure: false,
        }
    }

    /// Talk plain HTTP instead of HTTPS.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn host(&self) -> &str {
        if self.name == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_HOST
        } else {
            &self.name
        }
    }

    fn base_url(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.host())
    }

    pub async fn get_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut url = format!("{}/v2/{}/tags/list", self.base_url(), repository);
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let response = self.fetch(&url, repository).await?;
            let next_page = next_page_link(&response).and_then(|link| self.same_origin_url(&link));

            let page: TagList = response.json().await.map_err(|source| Error::RegistryRequest {
                host: self.host().to_string(),
                source,
            })?;
            let page_tags = page.tags.unwrap_or_default();
            debug!("Registry {} returned {} tags for {}", self.host(), page_tags.len(), page.name);
            tags.extend(page_tags);

            match next_page {
                Some(next) => url = next,
                None => return Ok(tags),
            }
        }

        warn!(
            "Stopped listing tags of {} on registry {} after {} pages",
            repository,
            self.host(),
            MAX_TAG_PAGES
        );
        Ok(tags)
    }

    async fn fetch(&self, url: &str, repository: &str) -> Result<Response> {
        debug!("Listing image tags from URL {}", url);
        let mut request = self.client.get(url);
        let (username, password) = (self.credentials.username(), self.credentials.password());
        if username.is_some() || password.is_some() {
            request = request.basic_auth(username.unwrap_or_default(), password);
        }

        let response = request.send().await.map_err(|source| Error::RegistryRequest {
            host: self.host().to_string(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(Error::RegistryStatus {
                host: self.host().to_string(),
                repository: repository.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }

    /// Resolves a pagination link against the registry. Links to another
    /// scheme or host are not followed, credentials stay with their registry.
    fn same_origin_url(&self, link: &str) -> Option<String> {
        let base_url = self.base_url();
        if link.starts_with('/') {
            return Some(format!("{}{}", base_url, link));
        }
        if link.starts_with(&format!("{}/", base_url)) {
            return Some(link.to_string());
        }
        warn!(
            "Not following tag list link {} that leaves registry {}",
            link,
            self.host()
        );
        None
    }
}

/// Extracts the target of a `Link: <...>; rel="next"` header.
fn next_page_link(response: &Response) -> Option<String> {
    let header = response.headers().get(LINK)?.to_str().ok()?;
    header
        .split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            (start < end).then(|| part[start..end].to_string())
        })
}

#[derive(Debug, Default, Clone)]
pub struct RegistryList {
    pub items: Vec<Registry>,
}

impl RegistryList {
    pub fn get(&self, name: &str) -> Result<&Registry> {
        self.items
            .iter()
            .find(|registry| registry.name == name)
            .ok_or_else(|| Error::RegistryNotFound(name.to_string()))
    }
}
