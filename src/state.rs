use crate::cluster::ClusterApi;
use crate::config::Config;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Everything a pass needs, shared by all containers it visits.
#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) config: Arc<Config>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) cancel: CancellationToken,
    /// Held for the duration of a pass so scheduled passes never overlap
    pub(crate) pass_lock: Arc<Mutex<()>>,
}

impl ControllerContext {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: Config,
        http_client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            config: Arc::new(config),
            http_client,
            cancel,
            pass_lock: Arc::new(Mutex::new(())),
        }
    }
}
