//! Namespace management on the target clusters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use tokio::sync::Mutex;

use crate::models::deployment::is_protected_namespace;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Refusal to touch a system namespace. Callers deleting namespaces treat it as a no-op.
    #[error("refusing to modify protected namespace {0}")]
    ProtectedNamespace(String),
    #[error("cluster API error: {0}")]
    Api(String),
    #[error("cannot connect to cluster {cluster_id}: {message}")]
    Connect { cluster_id: i64, message: String },
    #[error("cluster call timed out: {0}")]
    Timeout(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Fails with `ProtectedNamespace` for system namespaces.
pub fn ensure_not_protected(namespace: &str) -> ClusterResult<()> {
    if is_protected_namespace(namespace) {
        return Err(ClusterError::ProtectedNamespace(namespace.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Creates the namespace, or re-applies `labels` when it already exists.
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> ClusterResult<()>;

    /// Missing namespaces count as deleted.
    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;
}

/// Resolves the gateway for a project's cluster.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, project_id: i64, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterGateway>>;
}

/// Namespace operations against one cluster through the kube client.
pub struct KubeNamespaces {
    api: Api<Namespace>,
    timeout: Duration,
}

impl KubeNamespaces {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            api: Api::all(client),
            timeout,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, kube::Error>>,
    ) -> ClusterResult<Result<T, kube::Error>> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ClusterError::Timeout(what.to_string()))
    }
}

fn api_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

#[async_trait]
impl ClusterGateway for KubeNamespaces {
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> ClusterResult<()> {
        ensure_not_protected(name)?;

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: if labels.is_empty() { None } else { Some(labels.clone()) },
                ..Default::default()
            },
            ..Default::default()
        };

        match self
            .bounded("create namespace", self.api.create(&PostParams::default(), &ns))
            .await?
        {
            Ok(_) => {
                tracing::info!(namespace = name, "Created namespace");
                Ok(())
            }
            Err(e) if api_code(&e) == Some(409) => {
                if labels.is_empty() {
                    return Ok(());
                }
                let patch = serde_json::json!({ "metadata": { "labels": labels } });
                self.bounded(
                    "patch namespace labels",
                    self.api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
                )
                .await?
                .map(|_| ())
                .map_err(|e| ClusterError::Api(format!("patching labels on {name}: {e}")))
            }
            Err(e) => Err(ClusterError::Api(format!("creating namespace {name}: {e}"))),
        }
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        ensure_not_protected(name)?;

        match self
            .bounded("delete namespace", self.api.delete(name, &DeleteParams::default()))
            .await?
        {
            Ok(_) => {
                tracing::info!(namespace = name, "Deleted namespace");
                Ok(())
            }
            Err(e) if api_code(&e) == Some(404) => {
                tracing::debug!(namespace = name, "Namespace already gone");
                Ok(())
            }
            Err(e) => Err(ClusterError::Api(format!("deleting namespace {name}: {e}"))),
        }
    }
}

/// Connects to clusters through kubeconfig contexts.
///
/// Clusters listed in `contexts` use that context; every other cluster uses
/// the inferred in-cluster or default kubeconfig. Clients are cached per
/// cluster id.
pub struct KubeClusters {
    contexts: HashMap<i64, String>,
    timeout: Duration,
    clients: Mutex<HashMap<i64, Client>>,
}

impl KubeClusters {
    pub fn new(contexts: HashMap<i64, String>, timeout: Duration) -> Self {
        Self {
            contexts,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn config_for(&self, cluster_id: i64) -> ClusterResult<Config> {
        let connect_err = |message: String| ClusterError::Connect { cluster_id, message };

        match self.contexts.get(&cluster_id) {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| connect_err(format!("context {context}: {e}")))
            }
            None => Config::infer().await.map_err(|e| connect_err(e.to_string())),
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeClusters {
    async fn connect(&self, project_id: i64, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterGateway>> {
        let cached = self.clients.lock().await.get(&cluster_id).cloned();
        if let Some(client) = cached {
            return Ok(Arc::new(KubeNamespaces::new(client, self.timeout)));
        }

        // Resolved without holding the cache lock; on a race the first insert wins.
        let config = self.config_for(cluster_id).await?;
        let client = Client::try_from(config).map_err(|e| ClusterError::Connect {
            cluster_id,
            message: e.to_string(),
        })?;
        tracing::debug!(project_id, cluster_id, "Connected to cluster");

        let client = self
            .clients
            .lock()
            .await
            .entry(cluster_id)
            .or_insert(client)
            .clone();
        Ok(Arc::new(KubeNamespaces::new(client, self.timeout)))
    }
}

/// Parse `cluster_id=context,...` into a context map. Malformed entries are skipped.
pub fn parse_contexts(raw: &str) -> HashMap<i64, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (id, context) = entry.split_once('=')?;
            let id = id.trim().parse().ok()?;
            let context = context.trim();
            (!context.is_empty()).then(|| (id, context.to_string()))
        })
        .collect()
}
