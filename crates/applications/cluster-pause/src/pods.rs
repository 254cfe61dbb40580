//! Pod housekeeping and fleet readiness
//!
//! Restarts are plain deletions; the owning controllers recreate the pods, now
//! scheduled under the current taints. Deletion is best-effort: a pod that cannot be
//! deleted is logged and skipped.

use crate::cluster::{ClusterApi, PodInfo};
use crate::error::Result;
use crate::wait::{Progress, poll_until, poll_until_deadline};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which pods a restart touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodScope {
    /// Every pod in every namespace
    All,
    /// Pods in the listed namespaces
    Namespaces(Vec<String>),
}

/// Outcome of the stop-side evacuation wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evacuation {
    /// No workload pod is bound to a node any more
    Drained,
    /// The bound elapsed with pods still bound
    TimedOut,
}

/// Deletes, counts and watches pods and nodes through one cluster client
pub struct PodController {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl PodController {
    /// Create a pod controller polling every `poll_interval`
    pub fn new(cluster: Arc<dyn ClusterApi>, poll_interval: Duration) -> Self {
        Self {
            cluster,
            poll_interval,
        }
    }

    /// Delete the pods in `scope`; with `only_unready`, just those whose containers
    /// are not ready.
    ///
    /// Returns the number of pods deleted.
    pub async fn restart(&self, scope: &PodScope, only_unready: bool) -> Result<usize> {
        let pods = match scope {
            PodScope::All => self.cluster.list_pods(None, None).await?,
            PodScope::Namespaces(namespaces) => {
                let mut pods = Vec::new();
                for namespace in namespaces {
                    pods.extend(self.cluster.list_pods(Some(namespace), None).await?);
                }
                pods
            }
        };

        let targets: Vec<&PodInfo> = pods.iter().filter(|p| !only_unready || !p.ready).collect();
        info!(scope = ?scope, only_unready, count = targets.len(), "Restarting pods");

        Ok(self.delete_each(targets).await)
    }

    /// Delete the etcd pods matched by `selector` in `namespace`, then wait until at
    /// least `quorum` of them are present again.
    pub async fn recycle_etcd(&self, namespace: &str, selector: &str, quorum: usize) -> Result<()> {
        let pods = self.cluster.list_pods(Some(namespace), Some(selector)).await?;
        info!(namespace, selector, count = pods.len(), "Restarting etcd pods");
        self.delete_each(pods.iter().collect()).await;

        let cluster = &self.cluster;
        poll_until("etcd quorum", self.poll_interval, || async move {
            let present = cluster.list_pods(Some(namespace), Some(selector)).await?.len();
            Ok(Progress::count(present, quorum, "etcd pods"))
        })
        .await
    }

    /// Wait up to `bound` for every pod outside `system_namespaces` to lose its node
    /// binding. Reaching the bound is not an error.
    pub async fn wait_for_evacuation(
        &self,
        system_namespaces: &[String],
        bound: Duration,
    ) -> Result<Evacuation> {
        let cluster = &self.cluster;
        let poll = || async move {
            let bound_pods = cluster
                .list_pods(None, None)
                .await?
                .into_iter()
                .filter(|p| !system_namespaces.contains(&p.namespace) && p.node_name.is_some())
                .count();

            Ok(if bound_pods == 0 {
                Progress::done("no workload pods bound")
            } else {
                Progress::pending(format!("{} workload pods still bound", bound_pods))
            })
        };
        let result = poll_until_deadline("pod evacuation", self.poll_interval, bound, poll).await;

        match result {
            Ok(()) => Ok(Evacuation::Drained),
            Err(err) if err.is_timeout() => {
                warn!(
                    bound_secs = bound.as_secs(),
                    "Pods still bound after evacuation bound, proceeding"
                );
                Ok(Evacuation::TimedOut)
            }
            Err(err) => Err(err),
        }
    }

    /// Wait until exactly `expected` nodes are registered, then until all are Ready.
    pub async fn wait_for_nodes(&self, expected: usize) -> Result<()> {
        let cluster = &self.cluster;

        info!(expected, "Waiting for nodes to register");
        poll_until("node registration", self.poll_interval, || async move {
            let registered = cluster.list_nodes().await?.len();
            let detail = format!("{}/{} nodes registered", registered, expected);
            Ok(if registered == expected {
                Progress::done(detail)
            } else {
                Progress::pending(detail)
            })
        })
        .await?;

        poll_until("node readiness", self.poll_interval, || async move {
            let nodes = cluster.list_nodes().await?;
            let ready = nodes.iter().filter(|n| n.ready).count();
            Ok(Progress::count(ready, nodes.len(), "nodes ready"))
        })
        .await
    }

    async fn delete_each(&self, pods: Vec<&PodInfo>) -> usize {
        let mut deleted = 0;
        for pod in pods {
            match self.cluster.delete_pod(&pod.namespace, &pod.name).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    error = %e,
                    "Pod cannot be deleted, ignoring"
                ),
            }
        }
        deleted
    }
}
