//! Kubernetes access
//!
//! The pipelines talk to the cluster only through [`ClusterApi`]. [`KubeCluster`]
//! is the production implementation over `kube`; [`ClusterConnector`] hands out a
//! freshly authenticated one, because EKS tokens expire during the long waits of a
//! transition.

use crate::error::{PauseError, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, Taint, Toleration};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Workload kinds whose pod templates carry tolerations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 ReplicaSet
    ReplicaSet,
}

impl WorkloadKind {
    /// Every kind, in patch order
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::ReplicaSet,
    ];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::ReplicaSet => "ReplicaSet",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload as seen by the toleration reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Kind
    pub kind: WorkloadKind,
    /// Name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Pod template tolerations
    pub tolerations: Vec<Toleration>,
    /// Has owner references (e.g. a replica set managed by a deployment)
    pub owned: bool,
}

/// A node as seen by the taint controller
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Current taints
    pub taints: Vec<Taint>,
    /// `Ready` condition is true
    pub ready: bool,
}

/// A pod as seen by the restart and wait steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Node the pod is bound to, if scheduled
    pub node_name: Option<String>,
    /// `ContainersReady` condition is true
    pub ready: bool,
}

/// Operations the pipelines need from the container orchestrator
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Replace a node's taints (merge patch on `spec.taints`)
    async fn patch_node_taints(&self, node: &str, taints: &[Taint]) -> Result<()>;

    /// List workloads of one kind in a namespace
    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;

    /// Replace a workload's pod template tolerations (merge patch)
    async fn patch_workload_tolerations(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        tolerations: &[Toleration],
    ) -> Result<()>;

    /// List pods, in one namespace or all, optionally by label selector
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<PodInfo>>;

    /// Delete a pod immediately (grace period 0)
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Set a deployment's replica count
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
}

/// Produces an authenticated [`ClusterApi`]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Load credentials and build a fresh client
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>>;
}

/// Workload types with a pod template
trait PodTemplated:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    fn pod_spec(&self) -> Option<&PodSpec>;
}

impl PodTemplated for Deployment {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }
}

impl PodTemplated for StatefulSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }
}

impl PodTemplated for DaemonSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }
}

impl PodTemplated for ReplicaSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.as_ref()?.spec.as_ref()
    }
}

fn condition_true<'a>(
    mut conditions: impl Iterator<Item = (&'a str, &'a str)>,
    wanted: &str,
) -> bool {
    conditions.any(|(kind, status)| kind == wanted && status == "True")
}

/// [`ClusterApi`] over a `kube` client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_templated<K: PodTemplated>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
    ) -> Result<Vec<Workload>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .iter()
            .map(|item| Workload {
                kind,
                name: item.name_any(),
                namespace: namespace.to_string(),
                tolerations: item
                    .pod_spec()
                    .and_then(|spec| spec.tolerations.clone())
                    .unwrap_or_default(),
                owned: !item.owner_references().is_empty(),
            })
            .collect())
    }

    async fn patch_templated<K: PodTemplated>(
        &self,
        namespace: &str,
        name: &str,
        tolerations: &[Toleration],
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "spec": { "template": { "spec": { "tolerations": tolerations } } }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;

        Ok(nodes
            .items
            .into_iter()
            .map(|node| {
                let ready = node
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        condition_true(
                            conds.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
                            "Ready",
                        )
                    })
                    .unwrap_or(false);

                NodeInfo {
                    name: node.name_any(),
                    taints: node
                        .spec
                        .and_then(|spec| spec.taints)
                        .unwrap_or_default(),
                    ready,
                }
            })
            .collect())
    }

    async fn patch_node_taints(&self, node: &str, taints: &[Taint]) -> Result<()> {
        debug!(node, taints = taints.len(), "Patching node taints");
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "taints": taints } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        match kind {
            WorkloadKind::Deployment => self.list_templated::<Deployment>(kind, namespace).await,
            WorkloadKind::StatefulSet => self.list_templated::<StatefulSet>(kind, namespace).await,
            WorkloadKind::DaemonSet => self.list_templated::<DaemonSet>(kind, namespace).await,
            WorkloadKind::ReplicaSet => self.list_templated::<ReplicaSet>(kind, namespace).await,
        }
    }

    async fn patch_workload_tolerations(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        tolerations: &[Toleration],
    ) -> Result<()> {
        debug!(%kind, namespace, name, "Patching workload tolerations");
        match kind {
            WorkloadKind::Deployment => {
                self.patch_templated::<Deployment>(namespace, name, tolerations).await
            }
            WorkloadKind::StatefulSet => {
                self.patch_templated::<StatefulSet>(namespace, name, tolerations).await
            }
            WorkloadKind::DaemonSet => {
                self.patch_templated::<DaemonSet>(namespace, name, tolerations).await
            }
            WorkloadKind::ReplicaSet => {
                self.patch_templated::<ReplicaSet>(namespace, name, tolerations).await
            }
        }
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }

        let pods = api.list(&params).await?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        condition_true(
                            conds.iter().map(|c| (c.type_.as_str(), c.status.as_str())),
                            "ContainersReady",
                        )
                    })
                    .unwrap_or(false);

                PodInfo {
                    name: pod.name_any(),
                    namespace: pod.namespace().unwrap_or_default(),
                    node_name: pod.spec.and_then(|spec| spec.node_name),
                    ready,
                }
            })
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| PauseError::ScaleFailed {
                deployment: format!("{}/{}", namespace, name),
                replicas,
                cause: e.to_string(),
            })?;
        Ok(())
    }
}

/// Builds [`KubeCluster`] clients from a kubeconfig or the ambient environment
#[derive(Debug, Clone, Default)]
pub struct KubeConnector {
    /// Explicit kubeconfig path; `None` infers (KUBECONFIG, ~/.kube/config, in-cluster)
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
}

impl KubeConnector {
    /// Create a connector
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self { kubeconfig, context }
    }

    async fn load_config(&self) -> Result<Config> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };

        match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(PauseError::credentials)?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(PauseError::credentials)
            }
            None if self.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(PauseError::credentials),
            None => Config::infer().await.map_err(PauseError::credentials),
        }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        debug!(
            kubeconfig = ?self.kubeconfig,
            context = ?self.context,
            "Loading Kubernetes credentials"
        );
        let config = self.load_config().await?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeCluster::new(client)))
    }
}
