use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::{debug, info};

/// The slice of the Kubernetes API the updater needs, scoped to one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_deployments(&self, label_selector: &str) -> anyhow::Result<Vec<Deployment>>;
    async fn replace_deployment(&self, deployment: &Deployment) -> anyhow::Result<Deployment>;
    async fn get_secret(&self, name: &str) -> anyhow::Result<Secret>;
    async fn get_job(&self, name: &str) -> anyhow::Result<Job>;
    async fn create_job(&self, job: &Job) -> anyhow::Result<Job>;
    async fn delete_job(&self, name: &str) -> anyhow::Result<()>;
    async fn list_pods(&self, label_selector: &str) -> anyhow::Result<Vec<Pod>>;
    async fn delete_pod(&self, name: &str) -> anyhow::Result<()>;
}

/// Connects to `host` when given, else to the in-cluster or kubeconfig default.
pub async fn create_client(host: Option<&str>) -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let mut config = kube::Config::infer()
        .await
        .context("Can't infer Kubernetes client configuration")?;
    if let Some(host) = host {
        config.cluster_url = host
            .parse()
            .with_context(|| format!("Invalid Kubernetes API server URL {}", host))?;
        info!("Using Kubernetes API server {}", host);
    }
    let client = Client::try_from(config)?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        Self { client, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_deployments(&self, label_selector: &str) -> anyhow::Result<Vec<Deployment>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .api::<Deployment>()
            .list(&lp)
            .await
            .with_context(|| format!("Failed to list deployments with label {}", label_selector))?;
        Ok(list.items)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> anyhow::Result<Deployment> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .context("Deployment has no name")?;
        debug!("Replacing deployment {}", name);
        self.api::<Deployment>()
            .replace(name, &PostParams::default(), deployment)
            .await
            .with_context(|| format!("Failed to update deployment {}", name))
    }

    async fn get_secret(&self, name: &str) -> anyhow::Result<Secret> {
        self.api::<Secret>()
            .get(name)
            .await
            .with_context(|| format!("Failed to get secret {}", name))
    }

    async fn get_job(&self, name: &str) -> anyhow::Result<Job> {
        self.api::<Job>()
            .get(name)
            .await
            .with_context(|| format!("Failed to get job {}", name))
    }

    async fn create_job(&self, job: &Job) -> anyhow::Result<Job> {
        self.api::<Job>()
            .create(&PostParams::default(), job)
            .await
            .context("Failed to create job")
    }

    async fn delete_job(&self, name: &str) -> anyhow::Result<()> {
        self.api::<Job>()
            .delete(name, &DeleteParams::background())
            .await
            .with_context(|| format!("Failed to delete job {}", name))?;
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> anyhow::Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .api::<Pod>()
            .list(&lp)
            .await
            .with_context(|| format!("Failed to list pods with label {}", label_selector))?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> anyhow::Result<()> {
        self.api::<Pod>()
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("Failed to delete pod {}", name))?;
        Ok(())
    }
}
